//! Subscription lifecycle management shared by the sync engines.
//!
//! A [`FeedDriver`] owns the background task that consumes a live change
//! feed and applies events to engine state.  Acquire/release is strictly
//! paired: the subscription is opened *before* the historical load (so
//! events raced by the fetch are buffered and handled by the merge's
//! dedupe), and dropping the driver aborts the task, which stops event
//! application immediately and releases the subscription as the task is
//! torn down.
//!
//! When a feed ends unexpectedly (the gateway invalidated the handle), the
//! driver re-subscribes with bounded exponential backoff and re-runs the
//! load to close the delivery gap.  Exhausting the retries emits
//! [`SyncNotice::LiveUpdatesLost`] rather than failing silently.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use roda_gateway::{ChangeEvent, ChangeFeed};

/// User-visible transient conditions an engine can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// A historical fetch failed. The list is unchanged and can be
    /// reloaded with the engine's `refresh`.
    FetchFailed(String),
    /// The live subscription could not be re-established; updates stop
    /// until the view is reopened.
    LiveUpdatesLost,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

type SubscribeFn =
    Box<dyn Fn() -> BoxFuture<'static, roda_gateway::Result<ChangeFeed>> + Send + Sync>;
type LoadFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type ApplyFn = Box<dyn FnMut(ChangeEvent) -> BoxFuture<'static, ()> + Send>;

/// Owns one live subscription and the task applying its events.
pub(crate) struct FeedDriver {
    task: JoinHandle<()>,
}

impl FeedDriver {
    pub fn spawn(
        label: &'static str,
        retry: RetrySettings,
        notices: broadcast::Sender<SyncNotice>,
        subscribe: SubscribeFn,
        load: LoadFn,
        apply: ApplyFn,
    ) -> Self {
        let task = tokio::spawn(run(label, retry, notices, subscribe, load, apply));
        Self { task }
    }
}

impl Drop for FeedDriver {
    fn drop(&mut self) {
        // Aborting drops the feed handle inside the task, which releases
        // the subscription before any further event can be applied.
        self.task.abort();
    }
}

async fn run(
    label: &'static str,
    retry: RetrySettings,
    notices: broadcast::Sender<SyncNotice>,
    subscribe: SubscribeFn,
    load: LoadFn,
    mut apply: ApplyFn,
) {
    let feed = acquire(label, retry, &notices, &subscribe).await;

    // The load runs even when the subscription is gone: a list without
    // live updates beats no list at all.
    load().await;

    let Some(mut feed) = feed else { return };

    loop {
        match feed.recv().await {
            Some(event) => apply(event).await,
            None => {
                info!(engine = label, "live feed ended, re-subscribing");
                match acquire(label, retry, &notices, &subscribe).await {
                    Some(next) => {
                        feed = next;
                        // Events between invalidation and re-subscribe are
                        // lost; reload to close the gap.
                        load().await;
                    }
                    None => return,
                }
            }
        }
    }
}

async fn acquire(
    label: &'static str,
    retry: RetrySettings,
    notices: &broadcast::Sender<SyncNotice>,
    subscribe: &SubscribeFn,
) -> Option<ChangeFeed> {
    for attempt in 0..retry.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(retry.base_delay * 2u32.saturating_pow(attempt - 1)).await;
        }
        match subscribe().await {
            Ok(feed) => return Some(feed),
            Err(e) => {
                warn!(engine = label, attempt = attempt + 1, error = %e, "subscribe failed");
            }
        }
    }
    warn!(engine = label, "giving up on live updates");
    let _ = notices.send(SyncNotice::LiveUpdatesLost);
    None
}
