//! Consistency reconciliation over a partition's replica set.
//!
//! - [`ConsistencyEngine`] picks replicas, fans requests out, and decides
//!   from the collected results whether a consistency level is met
//! - [`SessionTokenStore`] tracks the highest session token seen per
//!   partition
//! - [`AddressResolver`] supplies replica addresses; the engine invalidates
//!   them when replicas report gone or stale routing
//! - [`DirectClient`] wires all of it to pooled RNTBD channels

pub mod address;
pub mod client;
pub mod engine;
pub mod selector;
pub mod session_store;

pub use address::{AddressResolver, StaticAddressResolver};
pub use client::DirectClient;
pub use engine::{ConsistencyEngine, Phase};
pub use selector::ReplicaSelector;
pub use session_store::SessionTokenStore;
