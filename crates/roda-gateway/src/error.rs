use thiserror::Error;

/// Credential / registration failures from the identity provider.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("an account already exists for {0}")]
    EmailTaken(String),

    #[error("no active session")]
    NoSession,
}

/// Errors produced by the gateway layer.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Identity-provider failure (sign-in / sign-up / sign-out).
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// A query or mutation expected a row but found none.
    #[error("record not found")]
    NotFound,

    /// A row could not be encoded or decoded.
    #[error("row codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A typed value did not serialize to a JSON object row.
    #[error("expected a JSON object row")]
    NotAnObject,

    /// The gateway could not service the request.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
