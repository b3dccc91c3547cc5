//! RNTBD direct-mode client plumbing.
//!
//! - [`EndpointManager`] pools channels per replica address and bounds the
//!   number of concurrently admitted requests
//! - [`StoreInvoker`] / [`ReplicaInvoker`] send one request to one replica
//!   and classify the answer as a [`StoreResult`]
//! - [`DirectConfig`] gathers timeouts, limits and retry settings

pub mod config;
pub mod endpoint;
pub mod invoker;
pub mod store_result;

pub use config::{DirectConfig, RetryConfig, SaturationPolicy};
pub use endpoint::{Endpoint, EndpointLease, EndpointManager, EndpointStats};
pub use invoker::{ReplicaInvoker, StoreInvoker};
pub use store_result::{RequestChargeTracker, StoreError, StoreOutcome, StoreResult};
