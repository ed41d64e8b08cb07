//! Per-conversation message synchronization.
//!
//! One engine instance per open conversation, bound to a single peer.  On
//! bind the engine opens its live subscription, then fetches the full
//! history between the current user and the peer; events raced by the
//! fetch are buffered and removed by the merge's id dedupe.  `send` never
//! appends locally — the list changes when the gateway's echo event
//! arrives, so it only ever shows confirmed rows.
//!
//! Conversation membership is a two-direction disjunction
//! (`sender = peer OR receiver = peer`) that the gateway's equality
//! filters cannot express, so the subscription is unfiltered and the
//! predicate is applied when events land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use roda_gateway::rows::{from_row, to_row};
use roda_gateway::{ChangeEvent, EventKind, Filter, Gateway, Ordering, Resource};
use roda_shared::constants::{MAX_MESSAGE_LEN, NOTICE_CHANNEL_CAPACITY};
use roda_shared::{Message, NewMessage, Profile, UserId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::lifecycle::{FeedDriver, SyncNotice};
use crate::session::SessionStore;

struct ThreadShared {
    gateway: Arc<dyn Gateway>,
    session: Arc<SessionStore>,
    peer: Mutex<UserId>,
    messages: Mutex<Vec<Message>>,
    profiles: Mutex<HashMap<UserId, Profile>>,
    loading: AtomicBool,
    revision: watch::Sender<u64>,
    notices: broadcast::Sender<SyncNotice>,
}

/// Synchronizes the message list of one conversation.
pub struct ThreadSyncEngine {
    shared: Arc<ThreadShared>,
    config: ClientConfig,
    driver: Option<FeedDriver>,
}

impl ThreadSyncEngine {
    /// Bind to a conversation with `peer` and start syncing.
    pub fn bind(
        gateway: Arc<dyn Gateway>,
        session: Arc<SessionStore>,
        config: ClientConfig,
        peer: UserId,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let shared = Arc::new(ThreadShared {
            gateway,
            session,
            peer: Mutex::new(peer),
            messages: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            loading: AtomicBool::new(true),
            revision,
            notices,
        });
        let driver = spawn_driver(&shared, &config);
        Self {
            shared,
            config,
            driver: Some(driver),
        }
    }

    /// Snapshot of the conversation, `created_at` ascending.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock_messages().clone()
    }

    pub fn peer(&self) -> UserId {
        self.shared.peer()
    }

    /// Whether the initial historical fetch is still in flight.
    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(AtomicOrdering::Acquire)
    }

    /// Revision counter bumped on every visible state change.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Transient, user-visible conditions (failed fetches, lost updates).
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.shared.notices.subscribe()
    }

    /// Persist a message to the bound peer.
    ///
    /// Completion means the gateway accepted the row; visibility in the
    /// list follows asynchronously when the echo event arrives.
    pub async fn send(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if text.len() > MAX_MESSAGE_LEN {
            return Err(ClientError::MessageTooLong(MAX_MESSAGE_LEN));
        }
        let me = self
            .shared
            .session
            .current_user_id()
            .ok_or(ClientError::NotAuthenticated)?;

        let row = to_row(&NewMessage {
            sender_id: me,
            receiver_id: self.shared.peer(),
            text: text.to_string(),
            read: false,
        })
        .map_err(ClientError::from)?;

        self.shared
            .gateway
            .insert(Resource::Messages, row)
            .await
            .map_err(ClientError::from)?;
        debug!(peer = %self.shared.peer().short(), "message persisted");
        Ok(())
    }

    /// Re-run the historical fetch, e.g. after a `FetchFailed` notice.
    pub async fn refresh(&self) {
        self.shared.load_history().await;
    }

    /// Release the live subscription. After this returns, no in-flight
    /// event can mutate the engine's state; the snapshot stays readable.
    pub fn unbind(&mut self) {
        self.driver = None;
    }

    /// Switch the engine to a different peer.
    ///
    /// The old subscription is torn down strictly before the new one is
    /// created, so no two subscriptions are ever concurrently active.
    pub fn rebind(&mut self, peer: UserId) {
        self.unbind();
        *self.shared.peer.lock().unwrap_or_else(PoisonError::into_inner) = peer;
        self.shared.lock_messages().clear();
        self.shared.loading.store(true, AtomicOrdering::Release);
        self.shared.bump();
        self.driver = Some(spawn_driver(&self.shared, &self.config));
    }
}

fn spawn_driver(shared: &Arc<ThreadShared>, config: &ClientConfig) -> FeedDriver {
    let subscribe = {
        let shared = shared.clone();
        Box::new(move || {
            let shared = shared.clone();
            Box::pin(async move {
                shared
                    .gateway
                    .subscribe(Resource::Messages, EventKind::Insert, None)
                    .await
            }) as futures::future::BoxFuture<'static, roda_gateway::Result<roda_gateway::ChangeFeed>>
        })
    };
    let load = {
        let shared = shared.clone();
        Box::new(move || {
            let shared = shared.clone();
            Box::pin(async move { shared.load_history().await })
                as futures::future::BoxFuture<'static, ()>
        })
    };
    let apply = {
        let shared = shared.clone();
        Box::new(move |event: ChangeEvent| {
            let shared = shared.clone();
            Box::pin(async move { shared.apply_event(event).await })
                as futures::future::BoxFuture<'static, ()>
        })
    };
    FeedDriver::spawn(
        "thread",
        config.retry(),
        shared.notices.clone(),
        subscribe,
        load,
        apply,
    )
}

impl ThreadShared {
    fn peer(&self) -> UserId {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    async fn load_history(&self) {
        match self.fetch_history().await {
            Ok(fetched) => {
                let mut list = self.lock_messages();
                for msg in fetched {
                    if !list.iter().any(|m| m.id == msg.id) {
                        insert_sorted(&mut list, msg);
                    }
                }
            }
            Err(e) => {
                warn!(peer = %self.peer().short(), error = %e, "historical message fetch failed");
                let _ = self.notices.send(SyncNotice::FetchFailed(e.to_string()));
            }
        }
        self.loading.store(false, AtomicOrdering::Release);
        self.bump();
    }

    async fn fetch_history(&self) -> roda_gateway::Result<Vec<Message>> {
        let Some(me) = self.session.current_user_id() else {
            return Ok(Vec::new());
        };
        let peer = self.peer();

        let sent = self
            .gateway
            .query(
                Resource::Messages,
                Filter::any()
                    .eq("sender_id", me.to_string())
                    .eq("receiver_id", peer.to_string()),
                Some(Ordering::asc("created_at")),
                None,
            )
            .await?;
        let received = self
            .gateway
            .query(
                Resource::Messages,
                Filter::any()
                    .eq("sender_id", peer.to_string())
                    .eq("receiver_id", me.to_string()),
                Some(Ordering::asc("created_at")),
                None,
            )
            .await?;

        let mut messages = Vec::with_capacity(sent.len() + received.len());
        for row in sent.iter().chain(received.iter()) {
            messages.push(from_row::<Message>(row)?);
        }
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        for msg in &mut messages {
            msg.sender = self.profile_for(msg.sender_id).await;
        }
        Ok(messages)
    }

    async fn apply_event(&self, event: ChangeEvent) {
        if event.kind != EventKind::Insert {
            return;
        }
        let mut msg: Message = match from_row(&event.row) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed message event");
                return;
            }
        };

        let Some(me) = self.session.current_user_id() else {
            return;
        };
        let peer = self.peer();
        let in_conversation = (msg.sender_id == me && msg.receiver_id == peer)
            || (msg.sender_id == peer && msg.receiver_id == me);
        if !in_conversation {
            // belongs to another bound engine, or to none
            return;
        }

        // fast path for at-least-once redelivery
        if self.lock_messages().iter().any(|m| m.id == msg.id) {
            return;
        }

        msg.sender = self.profile_for(msg.sender_id).await;

        {
            let mut list = self.lock_messages();
            // re-check: the profile fetch awaited, another copy may have landed
            if list.iter().any(|m| m.id == msg.id) {
                return;
            }
            insert_sorted(&mut list, msg);
        }
        self.bump();
    }

    async fn profile_for(&self, user_id: UserId) -> Option<Profile> {
        if let Some(profile) = self
            .profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
        {
            return Some(profile.clone());
        }

        let rows = self
            .gateway
            .query(
                Resource::Profiles,
                Filter::any().eq("id", user_id.to_string()),
                None,
                Some(1),
            )
            .await;
        match rows {
            Ok(rows) => {
                let profile = rows.first().and_then(|row| from_row::<Profile>(row).ok())?;
                self.profiles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(user_id, profile.clone());
                Some(profile)
            }
            Err(e) => {
                debug!(user = %user_id.short(), error = %e, "sender profile fetch failed");
                None
            }
        }
    }
}

/// Keep the list `created_at` ascending, ids as tiebreak.
fn insert_sorted(list: &mut Vec<Message>, msg: Message) {
    let key = (msg.created_at, msg.id);
    let idx = list.partition_point(|m| (m.created_at, m.id) <= key);
    list.insert(idx, msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    use roda_gateway::MemoryGateway;
    use roda_shared::NewProfile;

    use crate::session::SessionState;

    fn test_config() -> ClientConfig {
        ClientConfig {
            profile_fetch_retry_delay: Duration::from_millis(10),
            resubscribe_base_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    async fn signed_in(gw: &MemoryGateway, email: &str) -> (Arc<SessionStore>, UserId) {
        let store = SessionStore::start(Arc::new(gw.clone()), test_config())
            .await
            .unwrap();
        store
            .sign_up(
                email,
                "pw",
                NewProfile {
                    name: "Eu".to_string(),
                    username: "eu".to_string(),
                },
            )
            .await
            .unwrap();
        let mut rx = store.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.state() != SessionState::Ready {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        let me = store.current_user_id().unwrap();
        (Arc::new(store), me)
    }

    /// Seed a profile row for a user that never signs in locally.
    async fn seed_peer(gw: &MemoryGateway, name: &str) -> UserId {
        let id = UserId::new();
        let profile = Profile {
            id,
            email: format!("{name}@roda.app"),
            name: name.to_string(),
            username: name.to_string(),
            avatar_url: None,
            bio: None,
            is_beta_tester: false,
            created_at: Utc::now(),
        };
        gw.insert(Resource::Profiles, to_row(&profile).unwrap())
            .await
            .unwrap();
        id
    }

    /// Insert a message row with an explicit timestamp.
    async fn seed_message(
        gw: &MemoryGateway,
        sender: UserId,
        receiver: UserId,
        text: &str,
        age_minutes: i64,
    ) -> Uuid {
        let msg = Message {
            id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            text: text.to_string(),
            read: false,
            created_at: Utc::now() - ChronoDuration::minutes(age_minutes),
            sender: None,
        };
        gw.insert(Resource::Messages, to_row(&msg).unwrap())
            .await
            .unwrap();
        msg.id
    }

    fn bind(gw: &MemoryGateway, store: &Arc<SessionStore>, peer: UserId) -> ThreadSyncEngine {
        ThreadSyncEngine::bind(Arc::new(gw.clone()), store.clone(), test_config(), peer)
    }

    /// The driver task owns the feed guard; aborting releases it shortly
    /// after, not necessarily before the abort call returns.
    async fn wait_subscribers(gw: &MemoryGateway, n: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while gw.subscriber_count(Resource::Messages) != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    async fn wait_for(engine: &ThreadSyncEngine, pred: impl Fn(&ThreadSyncEngine) -> bool) {
        let mut rx = engine.updates();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(engine) {
                    return;
                }
                rx.changed().await.expect("engine gone");
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn history_loads_ascending_without_duplicates() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;

        seed_message(&gw, me, peer, "primeiro", 3).await;
        seed_message(&gw, peer, me, "segundo", 2).await;
        seed_message(&gw, me, peer, "terceiro", 1).await;

        let engine = bind(&gw, &store, peer);
        wait_for(&engine, |e| !e.is_loading() && e.messages().len() == 3).await;

        let texts: Vec<String> = engine.messages().iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts, ["primeiro", "segundo", "terceiro"]);
        let list = engine.messages();
        assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        // sender profiles were attached for display
        assert_eq!(list[1].sender.as_ref().unwrap().name, "bia");
    }

    #[tokio::test]
    async fn duplicate_event_delivery_is_idempotent() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;

        let engine = bind(&gw, &store, peer);
        wait_for(&engine, |e| !e.is_loading()).await;

        seed_message(&gw, peer, me, "oi", 0).await;
        wait_for(&engine, |e| e.messages().len() == 1).await;

        assert!(gw.replay_last_event(Resource::Messages));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.messages().len(), 1);
    }

    #[tokio::test]
    async fn events_for_other_conversations_are_ignored() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let bia = seed_peer(&gw, "bia").await;
        let caio = seed_peer(&gw, "caio").await;

        let engine = bind(&gw, &store, bia);
        wait_for(&engine, |e| !e.is_loading()).await;

        seed_message(&gw, caio, me, "outra conversa", 0).await;
        seed_message(&gw, caio, bia, "nem minha", 0).await;
        seed_message(&gw, bia, me, "essa sim", 0).await;

        wait_for(&engine, |e| e.messages().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let list = engine.messages();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].text, "essa sim");
    }

    #[tokio::test]
    async fn send_surfaces_through_the_echo() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;

        let engine = bind(&gw, &store, peer);
        wait_for(&engine, |e| !e.is_loading()).await;

        engine.send("oi").await.unwrap();
        // completion and visibility are decoupled: wait for the echo
        wait_for(&engine, |e| e.messages().len() == 1).await;
        let list = engine.messages();
        assert_eq!(list[0].sender_id, me);
        assert_eq!(list[0].text, "oi");
    }

    #[tokio::test]
    async fn send_without_session_fails_and_leaves_list_unchanged() {
        let gw = MemoryGateway::new();
        let store = Arc::new(
            SessionStore::start(Arc::new(gw.clone()), test_config())
                .await
                .unwrap(),
        );
        let peer = seed_peer(&gw, "bia").await;

        let engine = bind(&gw, &store, peer);
        wait_for(&engine, |e| !e.is_loading()).await;

        let err = engine.send("oi").await.unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated));
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_the_gateway() {
        let gw = MemoryGateway::new();
        let (store, _) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;
        let engine = bind(&gw, &store, peer);

        assert!(matches!(
            engine.send("   ").await.unwrap_err(),
            ClientError::EmptyMessage
        ));
    }

    #[tokio::test]
    async fn unbind_stops_all_mutation_and_releases_the_subscription() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;

        let mut engine = bind(&gw, &store, peer);
        wait_for(&engine, |e| !e.is_loading()).await;
        assert_eq!(gw.subscriber_count(Resource::Messages), 1);

        engine.unbind();
        wait_subscribers(&gw, 0).await;

        seed_message(&gw, peer, me, "tarde demais", 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn rebind_swaps_conversations_with_one_live_subscription() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let bia = seed_peer(&gw, "bia").await;
        let caio = seed_peer(&gw, "caio").await;

        seed_message(&gw, bia, me, "da bia", 2).await;
        seed_message(&gw, caio, me, "do caio", 1).await;

        let mut engine = bind(&gw, &store, bia);
        wait_for(&engine, |e| !e.is_loading() && e.messages().len() == 1).await;

        engine.rebind(caio);
        wait_for(&engine, |e| !e.is_loading() && e.messages().len() == 1).await;
        assert_eq!(engine.messages()[0].text, "do caio");
        assert_eq!(engine.peer(), caio);
        wait_subscribers(&gw, 1).await;
    }

    #[tokio::test]
    async fn fetch_failure_notifies_and_refresh_recovers() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;
        seed_message(&gw, peer, me, "oi", 1).await;

        gw.fail_next_query(Resource::Messages);
        let engine = bind(&gw, &store, peer);
        let mut notices = engine.notices();

        wait_for(&engine, |e| !e.is_loading()).await;
        assert!(engine.messages().is_empty());
        let notice = tokio::time::timeout(Duration::from_secs(1), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice, SyncNotice::FetchFailed(_)));

        engine.refresh().await;
        assert_eq!(engine.messages().len(), 1);
    }

    #[tokio::test]
    async fn resubscribes_after_invalidation() {
        let gw = MemoryGateway::new();
        let (store, me) = signed_in(&gw, "me@roda.app").await;
        let peer = seed_peer(&gw, "bia").await;

        let engine = bind(&gw, &store, peer);
        wait_for(&engine, |e| !e.is_loading()).await;

        gw.invalidate_subscriptions(Resource::Messages);
        seed_message(&gw, peer, me, "depois da queda", 0).await;

        // the driver re-subscribes and reloads to close the gap
        wait_for(&engine, |e| e.messages().len() == 1).await;
        wait_subscribers(&gw, 1).await;
    }
}
