//! Tablet Manager Client interface (spec §4.3, component C3): the typed RPC
//! surface ERS uses to talk to each tablet. No wire format is prescribed —
//! this is the contract an implementation must satisfy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::gtid::Position;
use crate::tablet::{StopReplicationStatus, TabletAlias};

/// One call per row of spec §4.3's table. Every method takes a per-call
/// deadline; none is retried by an implementation — ERS decides whether and
/// how to retry (spec §5 "No retries at the coordinator level").
#[async_trait]
pub trait TabletManagerClient: Send + Sync {
    /// Stops the IO and SQL threads and returns the before/after snapshot.
    /// An `Err(ErsError::NotReplica(..))` is a *soft* error meaning the
    /// target claims the PRIMARY role (spec §4.3).
    async fn stop_replication_and_get_status(
        &self,
        tablet: &TabletAlias,
        deadline: Duration,
    ) -> Result<StopReplicationStatus>;

    /// `CHANGE SOURCE` (+ optional `START REPLICA`) to point at `source`.
    async fn set_source(
        &self,
        tablet: &TabletAlias,
        source: &TabletAlias,
        start_replication: bool,
        force_start: bool,
        deadline: Duration,
    ) -> Result<()>;

    /// `STOP REPLICA; RESET REPLICA ALL`; records the tablet as primary.
    /// Returns the new primary's position.
    async fn promote_replica(&self, tablet: &TabletAlias, deadline: Duration) -> Result<Position>;

    /// Sets read-only, flushes, and returns the final primary position.
    async fn demote_primary(&self, tablet: &TabletAlias, deadline: Duration) -> Result<Position>;

    /// Restores read-write after an aborted demotion.
    async fn undo_demote_primary(&self, tablet: &TabletAlias, deadline: Duration) -> Result<()>;

    /// Blocks until the local position is at least `target`.
    async fn wait_for_position(
        &self,
        tablet: &TabletAlias,
        target: &Position,
        deadline: Duration,
    ) -> Result<()>;

    /// Appends `(term_counter, primary_alias, position, time)` to the
    /// reparent journal on the (new) primary.
    async fn populate_reparent_journal(
        &self,
        tablet: &TabletAlias,
        term_counter: u64,
        primary_alias: &TabletAlias,
        position: &Position,
        time: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<()>;

    /// Reads the current journal term counter.
    async fn read_reparent_journal_info(&self, tablet: &TabletAlias, deadline: Duration) -> Result<u64>;

    /// Current replication position as reported by a tablet claiming to be
    /// primary.
    async fn primary_status(&self, tablet: &TabletAlias, deadline: Duration) -> Result<Position>;

    /// Position of the tablet acting as primary.
    async fn primary_position(&self, tablet: &TabletAlias, deadline: Duration) -> Result<Position>;
}
