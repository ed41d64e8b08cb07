//! # roda-shared
//!
//! Domain models and identifiers shared between the gateway layer and the
//! client sync engines.  Every struct derives `Serialize` and `Deserialize`
//! so it can cross the gateway boundary as a plain JSON row and be handed
//! directly to the UI layer.

pub mod constants;
pub mod models;
pub mod types;

pub use models::*;
pub use types::UserId;
