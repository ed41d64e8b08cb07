//! # roda-gateway
//!
//! The remote data gateway boundary: a generic CRUD-plus-subscriptions
//! contract ([`Gateway`]) over named resources, with change notifications
//! delivered through scoped subscription handles ([`ChangeFeed`]).
//!
//! Delivery semantics per subscription are at-least-once and FIFO; there is
//! no ordering guarantee across resources.  Transport-level reconnection is
//! the gateway implementation's problem — consumers only ever see a feed
//! that yields events until its handle is dropped or invalidated.
//!
//! [`MemoryGateway`] is the in-process reference implementation, used for
//! development and by the sync-engine test suites.

pub mod feed;
pub mod gateway;
pub mod memory;
pub mod resource;
pub mod rows;

mod error;

pub use error::{AuthError, GatewayError, Result};
pub use feed::{AuthEvent, AuthFeed, ChangeEvent, ChangeFeed, EventKind, Feed};
pub use gateway::Gateway;
pub use memory::MemoryGateway;
pub use resource::{Filter, Ordering, Resource, Row};
