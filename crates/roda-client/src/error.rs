use thiserror::Error;

use roda_gateway::{AuthError, GatewayError};
use roda_shared::UserId;

/// Errors surfaced by the sync engines.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A mutation was attempted with no active session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Credential or registration failure from the identity provider.
    #[error("authentication failed: {0}")]
    Auth(AuthError),

    /// CRUD or subscription failure from the remote store.
    #[error("gateway error: {0}")]
    Gateway(GatewayError),

    /// The identity exists but its profile row could not be written.
    /// Surfaced to the caller so the UI can prompt a retry; the two sides
    /// must never be left silently inconsistent.
    #[error("identity {user_id} was created but its profile row could not be written: {source}")]
    ProfileInconsistency {
        user_id: UserId,
        source: GatewayError,
    },

    #[error("message text must not be empty")]
    EmptyMessage,

    #[error("message text exceeds {0} bytes")]
    MessageTooLong(usize),

    #[error("post content must not be empty")]
    EmptyPost,

    #[error("post content exceeds {0} bytes")]
    PostTooLong(usize),
}

impl From<GatewayError> for ClientError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Auth(auth) => ClientError::Auth(auth),
            other => ClientError::Gateway(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
