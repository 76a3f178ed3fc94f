//! Emergency Reparent Shard (ERS) coordinator.
//!
//! Given a sharded MySQL cluster with a topology store and a tablet-manager
//! RPC surface, [`orchestrator::ReparentCoordinator::reparent_shard`] drives
//! a fault-recovery reparent: stop replication everywhere, pick the most
//! advanced durably-reachable replica, promote it, and repoint survivors.
//! See `SPEC_FULL.md` for the full state machine and invariants.

pub mod candidate;
pub mod durability;
pub mod error;
pub mod gtid;
pub mod options;
pub mod orchestrator;
pub mod tablet;
pub mod telemetry;
pub mod tmc;
pub mod topology;

/// In-memory fakes shared by unit tests (`#[cfg(test)]` modules) and the
/// `tests/` integration suite. Not behind `#[cfg(test)]` because separate
/// integration-test binaries cannot see items gated that way.
pub mod testing;

pub use error::{ErsError, Result};
pub use gtid::Position;
pub use options::Options;
pub use orchestrator::ReparentCoordinator;
pub use tablet::{Tablet, TabletAlias, TabletRole};
pub use telemetry::{Event, EventLog, Telemetry};
