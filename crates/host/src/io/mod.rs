//! Reliable I/O primitives.
//!
//! Everything that touches the network goes through [`write_full`] and
//! [`read_full`], bounded by an [`OpContext`] and counted by a [`Tracker`].

pub mod backoff;
pub mod context;
pub mod reliable;
pub mod tracker;

pub use context::OpContext;
pub use reliable::{read_full, recv_payload, send_payload, write_full};
pub use tracker::{ActionGuard, Tracker};
