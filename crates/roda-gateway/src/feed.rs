//! Change-notification feeds with scoped release.
//!
//! A [`Feed`] pairs an unbounded receiver with an RAII guard; dropping the
//! feed synchronously removes the subscriber from the gateway's dispatch
//! table, so no event can be delivered into a dead context after release.
//! Delivery within one feed is FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use roda_shared::Session;

use crate::resource::{Filter, Row};

/// The kind of change a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// One change notification: the kind plus the affected row.
///
/// For inserts and updates the row is the post-change state; for deletes it
/// is the removed row.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub row: Row,
}

/// Authentication-state change notifications.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut,
}

/// A live subscription handle.
///
/// Yields events until either the handle is dropped (scoped release) or the
/// gateway invalidates the subscription, in which case [`Feed::recv`]
/// returns `None` and the consumer is expected to re-subscribe.
pub struct Feed<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _guard: FeedGuard<T>,
}

pub type ChangeFeed = Feed<ChangeEvent>;
pub type AuthFeed = Feed<AuthEvent>;

impl<T> Feed<T> {
    /// Wait for the next event. `None` means the subscription is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drain one already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> std::fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Dispatch-table internals (used by MemoryGateway)
// ---------------------------------------------------------------------------

pub(crate) struct Subscriber<T> {
    pub tx: mpsc::UnboundedSender<T>,
    /// Only events of this kind are delivered (`None` = all kinds).
    pub kind: Option<EventKind>,
    /// Only rows matching this filter are delivered (`None` = all rows).
    pub filter: Option<Filter>,
}

pub(crate) type SubscriberTable<T> = Arc<Mutex<HashMap<u64, Subscriber<T>>>>;

struct FeedGuard<T> {
    table: Weak<Mutex<HashMap<u64, Subscriber<T>>>>,
    id: u64,
}

impl<T> Drop for FeedGuard<T> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if let Ok(mut table) = table.lock() {
                table.remove(&self.id);
            }
        }
    }
}

/// Register a subscriber and hand back its feed handle.
pub(crate) fn register<T>(
    table: &SubscriberTable<T>,
    next_id: &AtomicU64,
    kind: Option<EventKind>,
    filter: Option<Filter>,
) -> crate::error::Result<Feed<T>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = next_id.fetch_add(1, AtomicOrdering::Relaxed);

    table
        .lock()
        .map_err(|_| crate::error::GatewayError::Unavailable("subscriber table poisoned".into()))?
        .insert(id, Subscriber { tx, kind, filter });

    Ok(Feed {
        rx,
        _guard: FeedGuard {
            table: Arc::downgrade(table),
            id,
        },
    })
}

/// Deliver a change event to every subscriber whose kind and filter accept it.
pub(crate) fn dispatch(table: &SubscriberTable<ChangeEvent>, event: &ChangeEvent) {
    let table = match table.lock() {
        Ok(table) => table,
        Err(_) => {
            tracing::error!("subscriber table poisoned, dropping event");
            return;
        }
    };
    for sub in table.values() {
        if sub.kind.is_some_and(|kind| kind != event.kind) {
            continue;
        }
        if let Some(ref filter) = sub.filter {
            if !filter.matches(&event.row) {
                continue;
            }
        }
        // A closed receiver just means the feed was dropped mid-dispatch.
        let _ = sub.tx.send(event.clone());
    }
}

/// Deliver an auth event to every listener.
pub(crate) fn dispatch_auth(table: &SubscriberTable<AuthEvent>, event: &AuthEvent) {
    let table = match table.lock() {
        Ok(table) => table,
        Err(_) => {
            tracing::error!("auth listener table poisoned, dropping event");
            return;
        }
    };
    for sub in table.values() {
        let _ = sub.tx.send(event.clone());
    }
}
