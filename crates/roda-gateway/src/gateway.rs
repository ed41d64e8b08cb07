//! The [`Gateway`] trait: everything the sync engines are allowed to assume
//! about the remote data store.

use async_trait::async_trait;

use roda_shared::{Identity, Session};

use crate::error::Result;
use crate::feed::{AuthFeed, ChangeFeed, EventKind};
use crate::resource::{Filter, Ordering, Resource, Row};

/// CRUD-style access to named resources plus change subscriptions and the
/// authentication operations of the identity provider.
///
/// Contract assumed by consumers:
/// - every call is asynchronous and non-blocking;
/// - change delivery is at-least-once and FIFO *per subscription*, with no
///   ordering guarantee across resources;
/// - a locally issued mutation's echo event is not guaranteed to be the next
///   event on a subscription;
/// - dropping a feed handle releases the subscription synchronously.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch rows matching `filter`, optionally sorted and truncated.
    async fn query(
        &self,
        resource: Resource,
        filter: Filter,
        ordering: Option<Ordering>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>>;

    /// Persist a new row. The gateway assigns `id` and `created_at` when
    /// absent and returns the stored row.
    async fn insert(&self, resource: Resource, row: Row) -> Result<Row>;

    /// Merge `patch` into the first row matching `filter` and return the
    /// updated row. Fails with `NotFound` when nothing matches.
    async fn update(&self, resource: Resource, filter: Filter, patch: Row) -> Result<Row>;

    /// Delete every row matching `filter`, returning how many were removed.
    async fn delete(&self, resource: Resource, filter: Filter) -> Result<u64>;

    /// Open a live subscription for changes of `kind` on `resource`,
    /// optionally restricted to rows matching `filter`.
    async fn subscribe(
        &self,
        resource: Resource,
        kind: EventKind,
        filter: Option<Filter>,
    ) -> Result<ChangeFeed>;

    /// Create an identity and establish a session for it.
    async fn sign_up(&self, email: &str, password: &str) -> Result<Session>;

    /// Establish a session for existing credentials.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;

    /// Invalidate the current session, if any.
    async fn sign_out(&self) -> Result<()>;

    /// The most recently resolved session, or `None` when signed out.
    /// Never blocks; used to rehydrate client state at startup.
    fn current_session(&self) -> Option<Session>;

    /// The identity behind the current session, if any. Never blocks.
    fn current_identity(&self) -> Option<Identity> {
        self.current_session().map(|session| session.identity)
    }

    /// Subscribe to authentication-state changes.
    async fn auth_events(&self) -> Result<AuthFeed>;
}
