//! Conductor sync: the rendezvous barrier between an experiment's peers.
//!
//! One process runs the [`Coordinator`]; every experiment peer runs a
//! [`SyncClient`]. The protocol is line-oriented and textual:
//!
//! ```text
//! Peer ──► Coordinator    time:<float>        (once, first)
//!                         set:<key>:<value>   (zero or more)
//!                         ready               (once)
//!
//! Coordinator ──► Peer    id:<u32>
//!                         <metadata table, one JSON line>
//!                         go                  (after the barrier)
//! ```
//!
//! When the last expected peer signals readiness, the coordinator assigns
//! ordinal ids in connection order, freezes the merged metadata table and
//! pushes it to everyone, then sends `go` after a fixed post-distribution
//! delay. A peer treats the *local receipt time* of `go` as the shared
//! start instant; cross-peer alignment is therefore bounded by one-way
//! trip time variance, which is accepted rather than corrected for.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod proto;

pub use client::{ClientConfig, SyncClient, Synchronized};
pub use coordinator::{BarrierReport, Coordinator, CoordinatorConfig};
pub use error::SyncError;
