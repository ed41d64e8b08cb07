//! # roda-client
//!
//! The client-side real-time synchronization layer: the stateful engines
//! that keep local application state consistent with the remote data
//! gateway while it pushes asynchronous change notifications.
//!
//! Three engines, one per concern:
//!
//! - [`SessionStore`] — process-wide authentication/session lifecycle,
//!   profile loading, local listener fan-out over a single underlying
//!   auth-state subscription.
//! - [`ThreadSyncEngine`] — one instance per open conversation; merges the
//!   historical message fetch with live inbound events.
//! - [`FeedSyncEngine`] — the global post feed; merges the historical page
//!   with live "new post" events and owns the upvote toggle.
//!
//! Mutations are echo-driven: `send` and `create_post` persist through the
//! gateway and let the live subscription surface the confirmed row, so the
//! visible list only ever contains gateway-confirmed state.

pub mod config;
pub mod feed;
pub mod lifecycle;
pub mod session;
pub mod thread;

mod error;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use feed::{FeedSyncEngine, ToggleOutcome};
pub use lifecycle::SyncNotice;
pub use session::{SessionSnapshot, SessionState, SessionStore};
pub use thread::ThreadSyncEngine;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default tracing subscriber for the client.
///
/// Honours `RUST_LOG`; safe to call more than once (later calls are no-ops).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roda_client=debug,roda_gateway=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
