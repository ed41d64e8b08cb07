//! Global post feed synchronization.
//!
//! The engine keeps a newest-first list of [`Post`] view models.  Raw
//! insert events only carry the post row, so every incoming post (initial
//! page and live alike) goes through [`FeedShared::assemble`], which
//! attaches the author profile and upvote aggregates before the post is
//! surfaced.  `create_post` never appends locally; the confirmed row
//! arrives through the live subscription like everyone else's posts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, warn};
use uuid::Uuid;

use roda_gateway::rows::{from_row, row_id, to_row};
use roda_gateway::{ChangeEvent, EventKind, Filter, Gateway, GatewayError, Ordering, Resource};
use roda_shared::constants::{MAX_POST_LEN, NOTICE_CHANNEL_CAPACITY};
use roda_shared::{NewPost, NewUpvote, Post, PostRecord, Profile, Upvote, UserId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::lifecycle::{FeedDriver, SyncNotice};
use crate::session::SessionStore;

/// What a toggle did to the viewer's upvote on a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Added,
    Removed,
}

struct FeedShared {
    gateway: Arc<dyn Gateway>,
    session: Arc<SessionStore>,
    config: ClientConfig,
    posts: Mutex<Vec<Post>>,
    profiles: Mutex<HashMap<UserId, Profile>>,
    /// Serializes toggle_upvote's query-then-write sequence. The gateway
    /// has no atomic toggle, so concurrent toggles from this client would
    /// otherwise race the existence check.
    toggle_gate: AsyncMutex<()>,
    loading: AtomicBool,
    revision: watch::Sender<u64>,
    notices: broadcast::Sender<SyncNotice>,
}

/// Synchronizes the community-wide post feed.
pub struct FeedSyncEngine {
    shared: Arc<FeedShared>,
    driver: Option<FeedDriver>,
}

impl FeedSyncEngine {
    /// Open the feed and start syncing.
    pub fn open(
        gateway: Arc<dyn Gateway>,
        session: Arc<SessionStore>,
        config: ClientConfig,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let shared = Arc::new(FeedShared {
            gateway,
            session,
            config,
            posts: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            toggle_gate: AsyncMutex::new(()),
            loading: AtomicBool::new(true),
            revision,
            notices,
        });
        let driver = spawn_driver(&shared);
        Self {
            shared,
            driver: Some(driver),
        }
    }

    /// Snapshot of the feed, `created_at` descending.
    pub fn posts(&self) -> Vec<Post> {
        self.shared.lock_posts().clone()
    }

    /// Whether the initial page fetch is still in flight.
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

    /// Persist a new post and return its assigned id.
    ///
    /// The post appears in the feed when its echo event arrives, not when
    /// this call returns.
    pub async fn create_post(
        &self,
        content: &str,
        image_url: Option<String>,
        video_url: Option<String>,
    ) -> Result<Uuid> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyPost);
        }
        if content.len() > MAX_POST_LEN {
            return Err(ClientError::PostTooLong(MAX_POST_LEN));
        }
        let me = self
            .shared
            .session
            .current_user_id()
            .ok_or(ClientError::NotAuthenticated)?;

        let post = NewPost {
            image_url,
            video_url,
            ..NewPost::text(me, content)
        };
        let stored = self
            .shared
            .gateway
            .insert(Resource::Posts, to_row(&post)?)
            .await?;
        let id = row_id(&stored).ok_or(GatewayError::NotAnObject)?;
        debug!(post = %id, "post persisted");
        Ok(id)
    }

    /// Add or remove the current user's upvote on `post_id`.
    ///
    /// The stored outcome is an involution: two toggles restore the
    /// original state, and at most one upvote row per user exists per post.
    pub async fn toggle_upvote(&self, post_id: Uuid) -> Result<ToggleOutcome> {
        let me = self
            .shared
            .session
            .current_user_id()
            .ok_or(ClientError::NotAuthenticated)?;

        let _gate = self.shared.toggle_gate.lock().await;

        let existing = self
            .shared
            .gateway
            .query(
                Resource::Upvotes,
                Filter::any()
                    .eq("user_id", me.to_string())
                    .eq("post_id", post_id.to_string()),
                None,
                None,
            )
            .await?;

        let outcome = if let Some(row) = existing.first() {
            let upvote: Upvote = from_row(row)?;
            self.shared
                .gateway
                .delete(
                    Resource::Upvotes,
                    Filter::any().eq("id", upvote.id.to_string()),
                )
                .await?;
            ToggleOutcome::Removed
        } else {
            self.shared
                .gateway
                .insert(Resource::Upvotes, to_row(&NewUpvote { user_id: me, post_id })?)
                .await?;
            ToggleOutcome::Added
        };

        self.shared.apply_toggle(post_id, outcome);
        Ok(outcome)
    }

    /// Re-run the page fetch, e.g. after a `FetchFailed` notice.
    pub async fn refresh(&self) {
        self.shared.load_page().await;
    }

    /// Release the live subscription. After this returns, no in-flight
    /// event can mutate the engine's state; the snapshot stays readable.
    pub fn close(&mut self) {
        self.driver = None;
    }
}

fn spawn_driver(shared: &Arc<FeedShared>) -> FeedDriver {
    let subscribe = {
        let shared = shared.clone();
        Box::new(move || {
            let shared = shared.clone();
            Box::pin(async move {
                shared
                    .gateway
                    .subscribe(Resource::Posts, EventKind::Insert, None)
                    .await
            }) as futures::future::BoxFuture<'static, roda_gateway::Result<roda_gateway::ChangeFeed>>
        })
    };
    let load = {
        let shared = shared.clone();
        Box::new(move || {
            let shared = shared.clone();
            Box::pin(async move { shared.load_page().await })
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
        "feed",
        shared.config.retry(),
        shared.notices.clone(),
        subscribe,
        load,
        apply,
    )
}

impl FeedShared {
    fn lock_posts(&self) -> std::sync::MutexGuard<'_, Vec<Post>> {
        self.posts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    async fn load_page(&self) {
        match self.fetch_page().await {
            Ok(fetched) => {
                let mut list = self.lock_posts();
                for post in fetched {
                    if !list.iter().any(|p| p.id == post.id) {
                        insert_newest_first(&mut list, post);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "feed page fetch failed");
                let _ = self.notices.send(SyncNotice::FetchFailed(e.to_string()));
            }
        }
        self.loading.store(false, AtomicOrdering::Release);
        self.bump();
    }

    async fn fetch_page(&self) -> roda_gateway::Result<Vec<Post>> {
        let rows = self
            .gateway
            .query(
                Resource::Posts,
                Filter::any(),
                Some(Ordering::desc("created_at")),
                Some(self.config.feed_page_size),
            )
            .await?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in &rows {
            let record: PostRecord = from_row(row)?;
            posts.push(self.assemble(record).await?);
        }
        Ok(posts)
    }

    async fn apply_event(&self, event: ChangeEvent) {
        if event.kind != EventKind::Insert {
            return;
        }
        let record: PostRecord = match from_row(&event.row) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "malformed post event");
                return;
            }
        };

        // fast path for at-least-once redelivery
        if self.lock_posts().iter().any(|p| p.id == record.id) {
            return;
        }

        // The event row lacks author and upvote data; assemble before
        // surfacing, same as the initial page.
        let post = match self.assemble(record).await {
            Ok(post) => post,
            Err(e) => {
                warn!(error = %e, "could not assemble live post");
                return;
            }
        };

        {
            let mut list = self.lock_posts();
            // re-check: assembly awaited, another copy may have landed
            if list.iter().any(|p| p.id == post.id) {
                return;
            }
            insert_newest_first(&mut list, post);
        }
        self.bump();
    }

    /// Turn a raw record into the view model the feed surfaces.
    async fn assemble(&self, record: PostRecord) -> roda_gateway::Result<Post> {
        let author = self.profile_for(record.author_id).await;

        let upvote_rows = self
            .gateway
            .query(
                Resource::Upvotes,
                Filter::any().eq("post_id", record.id.to_string()),
                None,
                None,
            )
            .await?;
        let mut upvotes = Vec::with_capacity(upvote_rows.len());
        for row in &upvote_rows {
            upvotes.push(from_row::<Upvote>(row)?);
        }

        let viewer = self.session.current_user_id();
        let viewer_has_upvoted =
            viewer.is_some_and(|me| upvotes.iter().any(|u| u.user_id == me));
        Ok(Post::from_record(
            record,
            author,
            upvotes.len() as u32,
            viewer_has_upvoted,
        ))
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
                debug!(user = %user_id.short(), error = %e, "author profile fetch failed");
                None
            }
        }
    }

    /// Reflect a confirmed toggle on the cached feed entry, if present.
    fn apply_toggle(&self, post_id: Uuid, outcome: ToggleOutcome) {
        let mut changed = false;
        {
            let mut list = self.lock_posts();
            if let Some(post) = list.iter_mut().find(|p| p.id == post_id) {
                match outcome {
                    ToggleOutcome::Added => {
                        post.upvote_count = post.upvote_count.saturating_add(1);
                        post.viewer_has_upvoted = true;
                    }
                    ToggleOutcome::Removed => {
                        post.upvote_count = post.upvote_count.saturating_sub(1);
                        post.viewer_has_upvoted = false;
                    }
                }
                changed = true;
            }
        }
        if changed {
            self.bump();
        }
    }
}

/// Keep the list `created_at` descending, ids as tiebreak.
fn insert_newest_first(list: &mut Vec<Post>, post: Post) {
    let key = (post.created_at, post.id);
    let idx = list.partition_point(|p| (p.created_at, p.id) > key);
    list.insert(idx, post);
}
