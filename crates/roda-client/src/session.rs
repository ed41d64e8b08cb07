//! Process-wide session store.
//!
//! Owns the authentication/session lifecycle: rehydrates any existing
//! session at startup, follows the gateway's auth-state stream, and fetches
//! the profile row belonging to the authenticated identity.  Exactly one
//! underlying auth subscription is held for the store's lifetime no matter
//! how many listeners register locally — fan-out happens through a
//! `watch` channel.
//!
//! State machine: `Unresolved → ProfileLoading → Ready` when a session is
//! found, `Unresolved → SignedOut` otherwise, and `Ready → SignedOut` on
//! sign-out or external invalidation.  A session whose profile cannot be
//! fetched is treated as unusable and reported as signed-out; the cause is
//! logged.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use roda_gateway::rows::{from_row, to_row};
use roda_gateway::{AuthEvent, AuthFeed, Filter, Gateway, Resource};
use roda_shared::{NewProfile, Profile, ProfilePatch, Session, UserId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Where the session lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Startup: the gateway has not yet been asked for a session.
    Unresolved,
    /// A session exists; its profile row is being fetched.
    ProfileLoading,
    /// Session and profile are both available.
    Ready,
    /// No usable session.
    SignedOut,
}

/// The value fanned out to listeners on every change.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session: Option<Session>,
    pub profile: Option<Profile>,
}

impl SessionSnapshot {
    fn unresolved() -> Self {
        Self {
            state: SessionState::Unresolved,
            session: None,
            profile: None,
        }
    }

    fn signed_out() -> Self {
        Self {
            state: SessionState::SignedOut,
            session: None,
            profile: None,
        }
    }

    fn loading(session: Session) -> Self {
        Self {
            state: SessionState::ProfileLoading,
            session: Some(session),
            profile: None,
        }
    }

    fn ready(session: Session, profile: Profile) -> Self {
        Self {
            state: SessionState::Ready,
            session: Some(session),
            profile: Some(profile),
        }
    }
}

struct SessionInner {
    gateway: Arc<dyn Gateway>,
    config: ClientConfig,
    snapshot: watch::Sender<SessionSnapshot>,
}

/// Process-wide singleton owning session and profile state.
pub struct SessionStore {
    inner: Arc<SessionInner>,
    watcher: JoinHandle<()>,
}

impl SessionStore {
    /// Open the auth subscription, rehydrate any existing session, and
    /// start following auth-state changes.
    pub async fn start(gateway: Arc<dyn Gateway>, config: ClientConfig) -> Result<Self> {
        let (snapshot, _) = watch::channel(SessionSnapshot::unresolved());
        let inner = Arc::new(SessionInner {
            gateway,
            config,
            snapshot,
        });

        // The one underlying auth subscription; listeners fan out locally.
        let events = inner.gateway.auth_events().await.map_err(ClientError::from)?;

        match inner.gateway.current_session() {
            Some(session) => {
                debug!(user = %session.user_id().short(), "rehydrated session");
                inner.snapshot.send_replace(SessionSnapshot::loading(session.clone()));
                resolve_profile(&inner, session).await;
            }
            None => {
                inner.snapshot.send_replace(SessionSnapshot::signed_out());
            }
        }

        let watcher = tokio::spawn(watch_auth(inner.clone(), events));
        Ok(Self { inner, watcher })
    }

    /// The latest known session, or `None`. Never blocks.
    pub fn current_session(&self) -> Option<Session> {
        self.inner.snapshot.borrow().session.clone()
    }

    /// The authenticated user's id, when a session exists.
    pub fn current_user_id(&self) -> Option<UserId> {
        self.inner.snapshot.borrow().session.as_ref().map(Session::user_id)
    }

    /// The loaded profile, when in the `Ready` state.
    pub fn current_profile(&self) -> Option<Profile> {
        self.inner.snapshot.borrow().profile.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.snapshot.borrow().state
    }

    /// Register a listener. Dropping the receiver deregisters it; the
    /// underlying gateway subscription is unaffected by listener count.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Submit credentials. State transitions (profile loading, ready)
    /// follow asynchronously via the auth-state stream.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = self
            .inner
            .gateway
            .sign_in(email, password)
            .await
            .map_err(ClientError::from)?;
        info!(user = %session.user_id().short(), "signed in");
        Ok(session)
    }

    /// Create an identity, then its profile row.
    ///
    /// A profile-row failure after the identity exists is surfaced as
    /// [`ClientError::ProfileInconsistency`] so the caller can retry or
    /// clean up — it is never swallowed.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        new_profile: NewProfile,
    ) -> Result<Profile> {
        let session = self
            .inner
            .gateway
            .sign_up(email, password)
            .await
            .map_err(ClientError::from)?;
        let user_id = session.user_id();

        let profile = Profile {
            id: user_id,
            email: email.to_string(),
            name: new_profile.name,
            username: new_profile.username,
            avatar_url: None,
            bio: None,
            is_beta_tester: self.inner.config.signup_beta_testers,
            created_at: Utc::now(),
        };
        let row = to_row(&profile).map_err(ClientError::from)?;

        match self.inner.gateway.insert(Resource::Profiles, row).await {
            Ok(stored) => {
                info!(user = %user_id.short(), beta = profile.is_beta_tester, "account registered");
                Ok(from_row(&stored).map_err(ClientError::from)?)
            }
            Err(source) => Err(ClientError::ProfileInconsistency { user_id, source }),
        }
    }

    /// Invalidate the session. Listeners observe the cleared state
    /// synchronously, before the gateway's own sign-out echo arrives.
    pub async fn sign_out(&self) -> Result<()> {
        self.inner
            .gateway
            .sign_out()
            .await
            .map_err(ClientError::from)?;
        self.inner.snapshot.send_replace(SessionSnapshot::signed_out());
        info!("signed out");
        Ok(())
    }

    /// Persist a partial profile update and replace the local copy with the
    /// server-confirmed row. No optimistic local mutation: server-side
    /// defaults and triggers must win.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<Profile> {
        let session = self.current_session().ok_or(ClientError::NotAuthenticated)?;
        let row_patch = to_row(&patch).map_err(ClientError::from)?;

        let updated = self
            .inner
            .gateway
            .update(
                Resource::Profiles,
                Filter::any().eq("id", session.user_id().to_string()),
                row_patch,
            )
            .await
            .map_err(ClientError::from)?;

        let profile: Profile = from_row(&updated).map_err(ClientError::from)?;
        self.inner.snapshot.send_modify(|snap| {
            snap.profile = Some(profile.clone());
        });
        Ok(profile)
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_auth(inner: Arc<SessionInner>, mut events: AuthFeed) {
    loop {
        match events.recv().await {
            Some(AuthEvent::SignedIn(session)) => {
                inner
                    .snapshot
                    .send_replace(SessionSnapshot::loading(session.clone()));
                resolve_profile(&inner, session).await;
            }
            Some(AuthEvent::SignedOut) => {
                inner.snapshot.send_replace(SessionSnapshot::signed_out());
            }
            None => match reacquire_auth_feed(&inner).await {
                Some(next) => events = next,
                None => {
                    warn!("auth-state stream lost for good; session changes will no longer be observed");
                    return;
                }
            },
        }
    }
}

async fn reacquire_auth_feed(inner: &SessionInner) -> Option<AuthFeed> {
    for attempt in 0..inner.config.resubscribe_max_attempts {
        if attempt > 0 {
            tokio::time::sleep(
                inner.config.resubscribe_base_delay * 2u32.saturating_pow(attempt - 1),
            )
            .await;
        }
        match inner.gateway.auth_events().await {
            Ok(feed) => return Some(feed),
            Err(e) => warn!(attempt = attempt + 1, error = %e, "auth re-subscribe failed"),
        }
    }
    None
}

/// Fetch the profile row for a fresh session and move to `Ready`.
///
/// A missing row is retried briefly (sign-up writes the profile right after
/// the identity, so the first fetch can race it).  A fetch error or a row
/// that never appears leaves the session unusable: the store reports
/// signed-out and logs the cause.
async fn resolve_profile(inner: &SessionInner, session: Session) {
    let user_id = session.user_id();

    for attempt in 0..=inner.config.profile_fetch_retries {
        if attempt > 0 {
            tokio::time::sleep(inner.config.profile_fetch_retry_delay).await;
        }

        let fetched = inner
            .gateway
            .query(
                Resource::Profiles,
                Filter::any().eq("id", user_id.to_string()),
                None,
                Some(1),
            )
            .await;

        match fetched {
            Ok(rows) => match rows.first() {
                Some(row) => match from_row::<Profile>(row) {
                    Ok(profile) => {
                        debug!(user = %user_id.short(), "profile loaded");
                        inner
                            .snapshot
                            .send_replace(SessionSnapshot::ready(session, profile));
                        return;
                    }
                    Err(e) => {
                        warn!(user = %user_id.short(), error = %e, "profile row is malformed; treating session as unusable");
                        inner.snapshot.send_replace(SessionSnapshot::signed_out());
                        return;
                    }
                },
                None => continue,
            },
            Err(e) => {
                warn!(user = %user_id.short(), error = %e, "profile fetch failed; treating session as unusable");
                inner.snapshot.send_replace(SessionSnapshot::signed_out());
                return;
            }
        }
    }

    warn!(user = %user_id.short(), "no profile row for identity; treating session as unusable");
    inner.snapshot.send_replace(SessionSnapshot::signed_out());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use roda_gateway::MemoryGateway;

    fn test_config() -> ClientConfig {
        ClientConfig {
            profile_fetch_retry_delay: Duration::from_millis(10),
            resubscribe_base_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    async fn started(gw: &MemoryGateway) -> SessionStore {
        SessionStore::start(Arc::new(gw.clone()), test_config())
            .await
            .expect("store should start")
    }

    async fn wait_state(store: &SessionStore, target: SessionState) {
        let mut rx = store.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.state() == target {
                    return;
                }
                rx.changed().await.expect("store dropped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {target:?}, stuck at {:?}", store.state()));
    }

    fn ana() -> NewProfile {
        NewProfile {
            name: "Ana".to_string(),
            username: "ana1".to_string(),
        }
    }

    #[tokio::test]
    async fn sign_up_creates_beta_profile_and_update_sticks() {
        let gw = MemoryGateway::new();
        let store = started(&gw).await;

        let profile = store.sign_up("a@b.com", "x", ana()).await.unwrap();
        assert!(profile.is_beta_tester);
        assert_eq!(profile.name, "Ana");
        assert_eq!(profile.username, "ana1");

        wait_state(&store, SessionState::Ready).await;
        assert_eq!(store.current_session().unwrap().identity.email, "a@b.com");

        let updated = store
            .update_profile(ProfilePatch {
                bio: Some("hi".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.bio.as_deref(), Some("hi"));
        assert_eq!(store.current_profile().unwrap().bio.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn beta_enrollment_is_a_config_switch() {
        let gw = MemoryGateway::new();
        let config = ClientConfig {
            signup_beta_testers: false,
            ..test_config()
        };
        let store = SessionStore::start(Arc::new(gw.clone()), config)
            .await
            .unwrap();

        let profile = store.sign_up("b@b.com", "x", ana()).await.unwrap();
        assert!(!profile.is_beta_tester);
    }

    #[tokio::test]
    async fn sign_out_clears_state_synchronously_and_sign_in_restores() {
        let gw = MemoryGateway::new();
        let store = started(&gw).await;
        store.sign_up("a@b.com", "x", ana()).await.unwrap();
        wait_state(&store, SessionState::Ready).await;

        store.sign_out().await.unwrap();
        // no waiting: listeners must already see the cleared state
        assert_eq!(store.state(), SessionState::SignedOut);
        assert!(store.current_session().is_none());
        assert!(store.current_profile().is_none());

        store.sign_in("a@b.com", "x").await.unwrap();
        wait_state(&store, SessionState::Ready).await;
    }

    #[tokio::test]
    async fn wrong_password_surfaces_auth_error() {
        let gw = MemoryGateway::new();
        let store = started(&gw).await;
        store.sign_up("a@b.com", "x", ana()).await.unwrap();
        store.sign_out().await.unwrap();

        let err = store.sign_in("a@b.com", "wrong").await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[tokio::test]
    async fn profile_insert_failure_is_not_swallowed() {
        let gw = MemoryGateway::new();
        let store = started(&gw).await;

        gw.fail_next_insert(Resource::Profiles);
        let err = store.sign_up("a@b.com", "x", ana()).await.unwrap_err();
        assert!(matches!(err, ClientError::ProfileInconsistency { .. }));
    }

    #[tokio::test]
    async fn identity_without_profile_row_ends_signed_out() {
        let gw = MemoryGateway::new();
        // identity exists but no profile row was ever written
        gw.sign_up("ghost@b.com", "x").await.unwrap();

        let store = started(&gw).await;
        wait_state(&store, SessionState::SignedOut).await;
    }

    #[tokio::test]
    async fn profile_fetch_error_ends_signed_out() {
        let gw = MemoryGateway::new();
        gw.sign_up("a@b.com", "x").await.unwrap();
        gw.fail_next_query(Resource::Profiles);

        let store = started(&gw).await;
        wait_state(&store, SessionState::SignedOut).await;
    }

    #[tokio::test]
    async fn rehydrates_existing_session_at_startup() -> anyhow::Result<()> {
        let gw = MemoryGateway::new();
        let bootstrap = started(&gw).await;
        bootstrap.sign_up("a@b.com", "x", ana()).await?;
        wait_state(&bootstrap, SessionState::Ready).await;
        drop(bootstrap);

        // a second store (fresh process) finds the gateway-held session
        let store = started(&gw).await;
        wait_state(&store, SessionState::Ready).await;
        assert_eq!(store.current_profile().unwrap().name, "Ana");
        Ok(())
    }

    #[tokio::test]
    async fn listener_count_does_not_multiply_gateway_subscriptions() {
        let gw = MemoryGateway::new();
        let store = started(&gw).await;

        let _a = store.subscribe();
        let _b = store.subscribe();
        let _c = store.subscribe();
        assert_eq!(gw.auth_listener_count(), 1);

        drop(store);
        // the watcher task owns the feed; aborting releases it shortly after
        tokio::time::timeout(Duration::from_secs(1), async {
            while gw.auth_listener_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("auth subscription not released");
    }

    #[tokio::test]
    async fn update_profile_requires_a_session() {
        let gw = MemoryGateway::new();
        let store = started(&gw).await;
        let err = store
            .update_profile(ProfilePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated));
    }
}
