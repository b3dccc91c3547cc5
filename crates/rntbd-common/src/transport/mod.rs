//! Connection layer: frame codec, request timer, multiplexed channels and
//! a frame server.
//!
//! - [`RntbdCodec`] adapts [`Frame`](crate::protocol::Frame) encoding to
//!   `FramedRead` / `FramedWrite`
//! - [`RequestTimer`] expires requests that outlive the request timeout
//! - [`Channel`] multiplexes requests over one TCP connection
//! - [`ReplicaServer`] answers frames with a user supplied handler

pub mod channel;
pub mod codec;
pub mod report;
pub mod server;
pub mod timer;

pub use channel::{Channel, ChannelConfig, ChannelState, ResponseFuture};
pub use codec::RntbdCodec;
pub use server::{error_frame, ReplicaServer};
pub use timer::{RequestTimer, TimeoutHandle};
