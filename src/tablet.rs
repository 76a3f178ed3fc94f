//! Data model (spec §3): tablets, shard records, and the records produced by
//! stopping replication and reading the reparent journal.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gtid::Position;

/// `(cell, uid)` identity of a tablet, rendered as `cell-<uid-zero-padded-10>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self { cell: cell.into(), uid }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// Tablet role (spec §3). Only `Replica` is promotion-eligible by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletRole {
    Primary,
    Replica,
    Rdonly,
    Spare,
    Drained,
    Backup,
    Restore,
}

/// Addressable replica endpoint, read-only to the orchestrator except for
/// the role flip that happens on promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub role: TabletRole,
    pub hostname: String,
    pub mysql_port: u16,
    /// True while the tablet-manager agent reports a backup in progress;
    /// consulted only as the §9 Open-Question heuristic in candidate
    /// selection, never as a hard filter.
    pub taking_backup: bool,
}

impl Tablet {
    pub fn new(alias: TabletAlias, keyspace: impl Into<String>, shard: impl Into<String>, role: TabletRole) -> Self {
        Self {
            alias,
            keyspace: keyspace.into(),
            shard: shard.into(),
            role,
            hostname: String::new(),
            mysql_port: 3306,
            taking_backup: false,
        }
    }
}

/// Mapping from tablet alias to tablet record, built once per ERS run and
/// treated immutable for its duration (spec §3 "Tablet map").
pub type TabletMap = HashMap<TabletAlias, Tablet>;

/// Per-shard metadata held in the topology store (spec §3 "Shard record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRecord {
    pub primary_alias: Option<TabletAlias>,
    pub is_primary_serving: bool,
    pub primary_term_start_time: Option<DateTime<Utc>>,
}

impl ShardRecord {
    pub fn empty() -> Self {
        Self {
            primary_alias: None,
            is_primary_serving: false,
            primary_term_start_time: None,
        }
    }
}

/// Replication-running flags observed immediately before `STOP REPLICA`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReplicationRunningFlags {
    pub io_thread_running: bool,
    pub sql_thread_running: bool,
}

/// What replication looked like right after the stop (spec §3
/// "Stop-replication status record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AfterStopStatus {
    pub relay_log_position: Position,
    pub source_uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReplicationStatus {
    pub before: ReplicationRunningFlags,
    pub after: AfterStopStatus,
}

/// An immutable record written to the new primary on promotion (spec §3
/// "Reparent journal entry"); replicas read this on `set_source` to confirm
/// they are attaching to the intended reparent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReparentJournalEntry {
    pub time: DateTime<Utc>,
    pub action_name: String,
    pub primary_alias: TabletAlias,
    pub replication_position: Position,
    pub term_counter: u64,
}
