//! # RNTBD CLI
//!
//! Support code for the `rntbd` binary:
//!
//! - `rntbd serve`: a [`replica::SimulatedReplica`] answering RNTBD frames
//! - `rntbd read`: one read through a `DirectClient`, printed as a
//!   [`summary::ReadSummary`] JSON line

pub mod replica;
pub mod summary;
