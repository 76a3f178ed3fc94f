//! Caller-supplied knobs for a reparent run (spec §4.8 / §6, component C8).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tablet::TabletAlias;

/// Caller-facing options record (spec §6 `Options`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Prefer this candidate; fail with `ErrExplicitCandidateIneligible` if
    /// it turns out ineligible.
    pub new_primary_alias: Option<TabletAlias>,

    /// Guard: fail with `ErrExpectedPrimaryMismatch` if the shard record's
    /// current primary isn't this alias.
    pub expected_primary_alias: Option<TabletAlias>,

    /// Tablets skipped during stop-replication and `set_source`.
    pub ignore_replicas: HashSet<TabletAlias>,

    /// Per-call deadline applied to the stop and relay-apply phases.
    pub wait_replicas_timeout: Duration,

    /// Restrict candidates to the previous primary's cell.
    pub prevent_cross_cell_promotion: bool,

    /// Durability policy name (spec §4.1).
    pub durability: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            new_primary_alias: None,
            expected_primary_alias: None,
            ignore_replicas: HashSet::new(),
            wait_replicas_timeout: Duration::from_secs(10),
            prevent_cross_cell_promotion: false,
            durability: "none".to_string(),
        }
    }
}
