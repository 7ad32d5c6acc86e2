//! Conductor core: the domain logic of distributed experiment coordination.
//!
//! This crate is deliberately free of network I/O. It holds the three
//! synchronous subsystems that make a reproducible experiment run possible:
//!
//! - **Scenario language** (`scenario`): parses a declarative timeline of
//!   timed, parameterized, peer-filtered actions, with include directives
//!   and environment-variable substitution.
//! - **Scenario runner** (`schedule`): maps action names to registered
//!   callables and decides, per peer, which events fire and in what order.
//! - **Component loader** (`loader`): computes a dependency-respecting
//!   activation order for pluggable components, rejecting cycles.
//!
//! The rendezvous barrier that produces the shared start instant and the
//! merged metadata table lives in `conductor_sync`; it feeds the types
//! defined in `metadata` back into this crate's runner.

pub mod error;
pub mod filter;
pub mod loader;
pub mod metadata;
pub mod scenario;
pub mod schedule;

pub use error::CoreError;
pub use filter::PeerFilter;
pub use loader::{ComponentDescriptor, ComponentLoader, LoadContext};
pub use metadata::{MetadataTable, PeerId, PeerRecord, WIRE_VERSION};
pub use scenario::{ScenarioEvent, ScenarioParser};
pub use schedule::ScenarioRunner;
