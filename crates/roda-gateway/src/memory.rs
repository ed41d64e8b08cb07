//! In-process reference implementation of the [`Gateway`] contract.
//!
//! Rows live in plain `Vec`s keyed by resource, change events are fanned
//! out synchronously to matching subscribers, and the identity provider is
//! a password-checked account map.  This is the development and test
//! backend; it is not a credential store and keeps passwords in memory
//! as-is.
//!
//! Beyond the trait, a few knobs expose gateway-side realities the engines
//! must survive: [`MemoryGateway::replay_last_event`] (at-least-once
//! duplicate delivery), [`MemoryGateway::invalidate_subscriptions`] (a
//! subscription handle going dead), and fault injection for inserts and
//! queries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use roda_shared::constants::SESSION_TTL_HOURS;
use roda_shared::{Identity, Session, UserId};

use crate::error::{AuthError, GatewayError, Result};
use crate::feed::{
    dispatch, dispatch_auth, register, AuthEvent, AuthFeed, ChangeEvent, ChangeFeed, EventKind,
    SubscriberTable,
};
use crate::gateway::Gateway;
use crate::resource::{Filter, Ordering, Resource, Row};

struct Account {
    user_id: UserId,
    password: String,
}

#[derive(Default)]
struct State {
    tables: HashMap<Resource, Vec<Row>>,
    accounts: HashMap<String, Account>,
    session: Option<Session>,
}

struct Inner {
    state: Mutex<State>,
    changes: Mutex<HashMap<Resource, SubscriberTable<ChangeEvent>>>,
    auth_listeners: SubscriberTable<AuthEvent>,
    next_sub_id: AtomicU64,
    last_events: Mutex<HashMap<Resource, ChangeEvent>>,
    fail_inserts: Mutex<HashSet<Resource>>,
    fail_queries: Mutex<HashSet<Resource>>,
    fail_subscribes: Mutex<HashSet<Resource>>,
}

/// The in-memory gateway. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryGateway {
    inner: Arc<Inner>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes: Mutex::new(HashMap::new()),
                auth_listeners: Arc::new(Mutex::new(HashMap::new())),
                next_sub_id: AtomicU64::new(1),
                last_events: Mutex::new(HashMap::new()),
                fail_inserts: Mutex::new(HashSet::new()),
                fail_queries: Mutex::new(HashSet::new()),
                fail_subscribes: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.inner
            .state
            .lock()
            .map_err(|_| GatewayError::Unavailable("gateway state poisoned".into()))
    }

    fn change_table(&self, resource: Resource) -> Result<SubscriberTable<ChangeEvent>> {
        let mut tables = self
            .inner
            .changes
            .lock()
            .map_err(|_| GatewayError::Unavailable("subscription tables poisoned".into()))?;
        Ok(tables
            .entry(resource)
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone())
    }

    fn publish(&self, resource: Resource, event: ChangeEvent) {
        if let Ok(mut last) = self.inner.last_events.lock() {
            last.insert(resource, event.clone());
        }
        if let Ok(tables) = self.inner.changes.lock() {
            if let Some(table) = tables.get(&resource) {
                dispatch(table, &event);
            }
        }
    }

    fn take_injected(set: &Mutex<HashSet<Resource>>, resource: Resource) -> bool {
        set.lock().map(|mut s| s.remove(&resource)).unwrap_or(false)
    }

    fn mint_session(user_id: UserId, email: &str) -> Session {
        let token_bytes: [u8; 32] = rand::random();
        Session {
            token: hex::encode(token_bytes),
            expires_at: Utc::now() + chrono::Duration::hours(SESSION_TTL_HOURS),
            identity: Identity {
                user_id,
                email: email.to_string(),
            },
        }
    }

    // -- test-support surface ------------------------------------------------

    /// Re-deliver the most recent event published for `resource`, simulating
    /// the at-least-once duplicate delivery real gateways are allowed.
    /// Returns whether there was an event to replay.
    pub fn replay_last_event(&self, resource: Resource) -> bool {
        let event = self
            .inner
            .last_events
            .lock()
            .ok()
            .and_then(|last| last.get(&resource).cloned());
        match event {
            Some(event) => {
                debug!(resource = %resource, "replaying last change event");
                self.publish(resource, event);
                true
            }
            None => false,
        }
    }

    /// Kill every live subscription on `resource`. Their feeds observe
    /// end-of-stream and are expected to re-subscribe.
    pub fn invalidate_subscriptions(&self, resource: Resource) {
        if let Ok(tables) = self.inner.changes.lock() {
            if let Some(table) = tables.get(&resource) {
                if let Ok(mut table) = table.lock() {
                    debug!(resource = %resource, dropped = table.len(), "invalidating subscriptions");
                    table.clear();
                }
            }
        }
    }

    /// Make the next `insert` on `resource` fail.
    pub fn fail_next_insert(&self, resource: Resource) {
        if let Ok(mut set) = self.inner.fail_inserts.lock() {
            set.insert(resource);
        }
    }

    /// Make the next `query` on `resource` fail.
    pub fn fail_next_query(&self, resource: Resource) {
        if let Ok(mut set) = self.inner.fail_queries.lock() {
            set.insert(resource);
        }
    }

    /// Make the next `subscribe` on `resource` fail.
    pub fn fail_next_subscribe(&self, resource: Resource) {
        if let Ok(mut set) = self.inner.fail_subscribes.lock() {
            set.insert(resource);
        }
    }

    /// Number of live auth-state listeners.
    pub fn auth_listener_count(&self) -> usize {
        self.inner
            .auth_listeners
            .lock()
            .map(|t| t.len())
            .unwrap_or(0)
    }

    /// Number of live subscribers on `resource` (leak checks in tests).
    pub fn subscriber_count(&self, resource: Resource) -> usize {
        self.inner
            .changes
            .lock()
            .ok()
            .and_then(|tables| {
                tables
                    .get(&resource)
                    .map(|table| table.lock().map(|t| t.len()).unwrap_or(0))
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn query(
        &self,
        resource: Resource,
        filter: Filter,
        ordering: Option<Ordering>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>> {
        if Self::take_injected(&self.inner.fail_queries, resource) {
            return Err(GatewayError::Unavailable("injected query failure".into()));
        }

        let state = self.state()?;
        let mut rows: Vec<Row> = state
            .tables
            .get(&resource)
            .map(|table| table.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        drop(state);

        if let Some(ordering) = ordering {
            rows.sort_by(|a, b| {
                let cmp = cmp_values(a.get(&ordering.column), b.get(&ordering.column));
                if ordering.descending {
                    cmp.reverse()
                } else {
                    cmp
                }
            });
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, resource: Resource, mut row: Row) -> Result<Row> {
        if Self::take_injected(&self.inner.fail_inserts, resource) {
            return Err(GatewayError::Unavailable("injected insert failure".into()));
        }

        if !row.contains_key("id") {
            row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        if !row.contains_key("created_at") {
            row.insert("created_at".to_string(), serde_json::to_value(Utc::now())?);
        }

        {
            let mut state = self.state()?;
            state.tables.entry(resource).or_default().push(row.clone());
        }

        debug!(resource = %resource, "row inserted");
        self.publish(
            resource,
            ChangeEvent {
                kind: EventKind::Insert,
                row: row.clone(),
            },
        );
        Ok(row)
    }

    async fn update(&self, resource: Resource, filter: Filter, patch: Row) -> Result<Row> {
        let updated = {
            let mut state = self.state()?;
            let table = state.tables.entry(resource).or_default();
            let row = table
                .iter_mut()
                .find(|r| filter.matches(r))
                .ok_or(GatewayError::NotFound)?;
            for (column, value) in patch {
                row.insert(column, value);
            }
            row.clone()
        };

        debug!(resource = %resource, "row updated");
        self.publish(
            resource,
            ChangeEvent {
                kind: EventKind::Update,
                row: updated.clone(),
            },
        );
        Ok(updated)
    }

    async fn delete(&self, resource: Resource, filter: Filter) -> Result<u64> {
        let removed: Vec<Row> = {
            let mut state = self.state()?;
            let table = state.tables.entry(resource).or_default();
            let (removed, kept): (Vec<Row>, Vec<Row>) =
                table.drain(..).partition(|r| filter.matches(r));
            *table = kept;
            removed
        };

        let count = removed.len() as u64;
        for row in removed {
            self.publish(
                resource,
                ChangeEvent {
                    kind: EventKind::Delete,
                    row,
                },
            );
        }
        Ok(count)
    }

    async fn subscribe(
        &self,
        resource: Resource,
        kind: EventKind,
        filter: Option<Filter>,
    ) -> Result<ChangeFeed> {
        if Self::take_injected(&self.inner.fail_subscribes, resource) {
            return Err(GatewayError::Unavailable(
                "injected subscribe failure".into(),
            ));
        }
        let table = self.change_table(resource)?;
        register(&table, &self.inner.next_sub_id, Some(kind), filter)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Session> {
        let session = {
            let mut state = self.state()?;
            if state.accounts.contains_key(email) {
                return Err(AuthError::EmailTaken(email.to_string()).into());
            }
            let user_id = UserId::new();
            state.accounts.insert(
                email.to_string(),
                Account {
                    user_id,
                    password: password.to_string(),
                },
            );
            let session = Self::mint_session(user_id, email);
            state.session = Some(session.clone());
            session
        };

        debug!(user = %session.user_id().short(), "account created");
        dispatch_auth(
            &self.inner.auth_listeners,
            &AuthEvent::SignedIn(session.clone()),
        );
        Ok(session)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = {
            let mut state = self.state()?;
            let account = state
                .accounts
                .get(email)
                .ok_or(AuthError::InvalidCredentials)?;
            if account.password != password {
                return Err(AuthError::InvalidCredentials.into());
            }
            let session = Self::mint_session(account.user_id, email);
            state.session = Some(session.clone());
            session
        };

        debug!(user = %session.user_id().short(), "signed in");
        dispatch_auth(
            &self.inner.auth_listeners,
            &AuthEvent::SignedIn(session.clone()),
        );
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let had_session = {
            let mut state = self.state()?;
            state.session.take().is_some()
        };
        if had_session {
            debug!("signed out");
            dispatch_auth(&self.inner.auth_listeners, &AuthEvent::SignedOut);
        }
        Ok(())
    }

    fn current_session(&self) -> Option<Session> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.session.clone())
    }

    async fn auth_events(&self) -> Result<AuthFeed> {
        register(&self.inner.auth_listeners, &self.inner.next_sub_id, None, None)
    }
}

/// Column-value comparison for query ordering.
///
/// RFC 3339 strings with differing fractional-second precision do not sort
/// lexicographically, so strings that parse as timestamps are compared as
/// timestamps.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering as O;
    match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(dx), Ok(dy)) => dx.cmp(&dy),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(O::Equal),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => O::Less,
        (Some(_), None) => O::Greater,
        _ => O::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{from_row, to_row};
    use roda_shared::{Message, NewMessage};

    fn new_message(sender: UserId, receiver: UserId, text: &str) -> Row {
        to_row(&NewMessage {
            sender_id: sender,
            receiver_id: receiver,
            text: text.to_string(),
            read: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_id_and_timestamp() {
        let gw = MemoryGateway::new();
        let row = gw
            .insert(
                Resource::Messages,
                new_message(UserId::new(), UserId::new(), "oi"),
            )
            .await
            .unwrap();
        let msg: Message = from_row(&row).unwrap();
        assert!(!msg.id.is_nil());
        assert_eq!(msg.text, "oi");
    }

    #[tokio::test]
    async fn query_filters_orders_and_limits() {
        let gw = MemoryGateway::new();
        let a = UserId::new();
        let b = UserId::new();
        for text in ["um", "dois", "tres"] {
            gw.insert(Resource::Messages, new_message(a, b, text))
                .await
                .unwrap();
        }
        gw.insert(Resource::Messages, new_message(b, a, "quatro"))
            .await
            .unwrap();

        let rows = gw
            .query(
                Resource::Messages,
                Filter::any().eq("sender_id", a.to_string()),
                Some(Ordering::asc("created_at")),
                Some(2),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let first: Message = from_row(&rows[0]).unwrap();
        assert_eq!(first.text, "um");
    }

    #[tokio::test]
    async fn update_merges_patch_and_misses_report_not_found() {
        let gw = MemoryGateway::new();
        let row = gw
            .insert(
                Resource::Messages,
                new_message(UserId::new(), UserId::new(), "oi"),
            )
            .await
            .unwrap();
        let id = crate::rows::row_id(&row).unwrap();

        let mut patch = Row::new();
        patch.insert("read".to_string(), Value::Bool(true));
        let updated = gw
            .update(
                Resource::Messages,
                Filter::any().eq("id", id.to_string()),
                patch.clone(),
            )
            .await
            .unwrap();
        let msg: Message = from_row(&updated).unwrap();
        assert!(msg.read);

        let missing = gw
            .update(
                Resource::Messages,
                Filter::any().eq("id", Uuid::new_v4().to_string()),
                patch,
            )
            .await;
        assert!(matches!(missing, Err(GatewayError::NotFound)));
    }

    #[tokio::test]
    async fn subscription_delivers_matching_inserts_only() {
        let gw = MemoryGateway::new();
        let a = UserId::new();
        let b = UserId::new();

        let mut feed = gw
            .subscribe(
                Resource::Messages,
                EventKind::Insert,
                Some(Filter::any().eq("receiver_id", b.to_string())),
            )
            .await
            .unwrap();

        gw.insert(Resource::Messages, new_message(a, b, "para voce"))
            .await
            .unwrap();
        gw.insert(Resource::Messages, new_message(b, a, "para mim"))
            .await
            .unwrap();

        let event = feed.recv().await.unwrap();
        let msg: Message = from_row(&event.row).unwrap();
        assert_eq!(msg.text, "para voce");
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_a_feed_releases_the_subscription() {
        let gw = MemoryGateway::new();
        let feed = gw
            .subscribe(Resource::Posts, EventKind::Insert, None)
            .await
            .unwrap();
        assert_eq!(gw.subscriber_count(Resource::Posts), 1);
        drop(feed);
        assert_eq!(gw.subscriber_count(Resource::Posts), 0);
    }

    #[tokio::test]
    async fn invalidation_closes_the_feed() {
        let gw = MemoryGateway::new();
        let mut feed = gw
            .subscribe(Resource::Posts, EventKind::Insert, None)
            .await
            .unwrap();
        gw.invalidate_subscriptions(Resource::Posts);
        assert!(feed.recv().await.is_none());
    }

    #[tokio::test]
    async fn replay_duplicates_the_last_event() {
        let gw = MemoryGateway::new();
        let mut feed = gw
            .subscribe(Resource::Messages, EventKind::Insert, None)
            .await
            .unwrap();
        gw.insert(
            Resource::Messages,
            new_message(UserId::new(), UserId::new(), "oi"),
        )
        .await
        .unwrap();
        assert!(gw.replay_last_event(Resource::Messages));

        let first = feed.recv().await.unwrap();
        let second = feed.recv().await.unwrap();
        assert_eq!(
            crate::rows::row_id(&first.row),
            crate::rows::row_id(&second.row)
        );
    }

    #[tokio::test]
    async fn auth_round_trip_and_events() {
        let gw = MemoryGateway::new();
        let mut events = gw.auth_events().await.unwrap();

        let session = gw.sign_up("a@b.com", "x").await.unwrap();
        assert_eq!(gw.current_identity().unwrap().email, "a@b.com");
        assert!(matches!(events.recv().await, Some(AuthEvent::SignedIn(_))));

        let dup = gw.sign_up("a@b.com", "y").await;
        assert!(matches!(
            dup,
            Err(GatewayError::Auth(AuthError::EmailTaken(_)))
        ));

        gw.sign_out().await.unwrap();
        assert!(gw.current_identity().is_none());
        assert!(matches!(events.recv().await, Some(AuthEvent::SignedOut)));

        let wrong = gw.sign_in("a@b.com", "nope").await;
        assert!(matches!(
            wrong,
            Err(GatewayError::Auth(AuthError::InvalidCredentials))
        ));
        let again = gw.sign_in("a@b.com", "x").await.unwrap();
        assert_eq!(again.user_id(), session.user_id());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let gw = MemoryGateway::new();
        gw.fail_next_insert(Resource::Profiles);
        let row = Row::new();
        assert!(gw.insert(Resource::Profiles, row.clone()).await.is_err());
        assert!(gw.insert(Resource::Profiles, row).await.is_ok());

        gw.fail_next_query(Resource::Profiles);
        assert!(gw
            .query(Resource::Profiles, Filter::any(), None, None)
            .await
            .is_err());
        assert!(gw
            .query(Resource::Profiles, Filter::any(), None, None)
            .await
            .is_ok());
    }
}
