//! RNTBD Common Types and Transport
//!
//! Wire protocol and connection layer shared by the direct-mode client
//! crates.
//!
//! # Components
//!
//! - [`protocol`] - frames, metadata tokens, session tokens, requests,
//!   responses and the [`RntbdError`] taxonomy
//! - [`transport`] - frame codec, request timer, multiplexed channels and
//!   a replica-side frame server
//!
//! # Wire Format
//!
//! Frames are length prefixed and little-endian:
//! `[u32 length][u16 resource type][u16 operation type][16 byte activity id]
//! [u32 metadata length][tokens][u32 payload length][payload]`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rntbd_common::{PartitionId, StoreRequest};
//! use rntbd_common::transport::{Channel, ChannelConfig, RequestTimer};
//!
//! # async fn run() -> rntbd_common::Result<()> {
//! let timer = Arc::new(RequestTimer::new(Duration::from_secs(5), Duration::from_millis(100))?);
//! let channel = Channel::connect("127.0.0.1:10251", &ChannelConfig::default(), timer).await?;
//!
//! let request = StoreRequest::read("dbs/db/colls/c/docs/d", PartitionId::new("c", "0"));
//! let response = channel.send(request.to_frame()).await?;
//! println!("status {:?}", response.metadata().status_code);
//! # Ok(())
//! # }
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
