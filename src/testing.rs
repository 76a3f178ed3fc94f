//! In-memory fakes for the topology store and tablet-manager client. Plain
//! hand-rolled fakes rather than a mocking-framework DSL, matching the
//! teacher's own test-harness style. Shared by `#[cfg(test)]` unit tests and
//! the `tests/` integration suite, which is why this module isn't itself
//! `#[cfg(test)]`-gated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{ErsError, Result};
use crate::gtid::Position;
use crate::tablet::{ShardRecord, StopReplicationStatus, TabletAlias, TabletMap};
use crate::tmc::TabletManagerClient;
use crate::topology::{ShardLock, TopologyStore};

/// A single shard's record and tablet map, held behind a mutex so tests can
/// seed state and the orchestrator can read/write it concurrently.
#[derive(Default)]
pub struct InMemoryTopology {
    shards: Mutex<HashMap<(String, String), ShardRecord>>,
    tablet_maps: Mutex<HashMap<(String, String), TabletMap>>,
    lock_held: Arc<AtomicBool>,
}

impl InMemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_shard(&self, keyspace: &str, shard: &str, record: ShardRecord, tablet_map: TabletMap) {
        self.shards.lock().insert((keyspace.to_string(), shard.to_string()), record);
        self.tablet_maps.lock().insert((keyspace.to_string(), shard.to_string()), tablet_map);
    }

    pub fn current_shard(&self, keyspace: &str, shard: &str) -> Option<ShardRecord> {
        self.shards.lock().get(&(keyspace.to_string(), shard.to_string())).cloned()
    }

    /// Simulates the lease being stolen or expiring mid-run.
    pub fn expire_lock(&self) {
        self.lock_held.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TopologyStore for InMemoryTopology {
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord> {
        self.shards
            .lock()
            .get(&(keyspace.to_string(), shard.to_string()))
            .cloned()
            .ok_or_else(|| ErsError::NoNode { keyspace: keyspace.to_string(), shard: shard.to_string() })
    }

    async fn update_shard(&self, keyspace: &str, shard: &str, record: ShardRecord) -> Result<()> {
        self.shards.lock().insert((keyspace.to_string(), shard.to_string()), record);
        Ok(())
    }

    async fn get_tablet_map_for_shard(&self, keyspace: &str, shard: &str) -> Result<TabletMap> {
        self.tablet_maps
            .lock()
            .get(&(keyspace.to_string(), shard.to_string()))
            .cloned()
            .ok_or_else(|| ErsError::NoNode { keyspace: keyspace.to_string(), shard: shard.to_string() })
    }

    async fn lock_shard(&self, _keyspace: &str, _shard: &str, _reason: &str) -> Result<Box<dyn ShardLock>> {
        self.lock_held.store(true, Ordering::SeqCst);
        Ok(Box::new(InMemoryLock { held: Arc::clone(&self.lock_held) }))
    }
}

pub struct InMemoryLock {
    held: Arc<AtomicBool>,
}

#[async_trait]
impl ShardLock for InMemoryLock {
    async fn check_lock_still_held(&self) -> Result<bool> {
        Ok(self.held.load(Ordering::SeqCst))
    }

    async fn unlock(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

/// Scripted per-tablet behavior for [`ScriptedTabletManagerClient`]. Unset
/// fields fail with [`ErsError::Internal`], which surfaces a missing-script
/// test bug rather than silently returning a zero value.
#[derive(Debug, Clone, Default)]
pub struct TabletScript {
    pub stop_status: Option<StopReplicationStatus>,
    /// When set, `stop_replication_and_get_status` fails with `NotReplica`,
    /// modeling a tablet that still believes it's the primary.
    pub is_primary: bool,
    pub primary_status: Option<Position>,
    pub promote_position: Option<Position>,
    pub journal_term: u64,
    pub fail_set_source: bool,
    pub fail_wait_for_position: bool,
}

/// A fake tablet-manager client driven entirely by pre-set
/// [`TabletScript`]s, with a call log tests can assert against.
#[derive(Default)]
pub struct ScriptedTabletManagerClient {
    scripts: Mutex<HashMap<TabletAlias, TabletScript>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTabletManagerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_script(&self, alias: TabletAlias, script: TabletScript) {
        self.scripts.lock().insert(alias, script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn script(&self, alias: &TabletAlias) -> Option<TabletScript> {
        self.scripts.lock().get(alias).cloned()
    }

    fn missing(alias: &TabletAlias) -> ErsError {
        ErsError::Internal(format!("no script set for tablet {alias}"))
    }
}

#[async_trait]
impl TabletManagerClient for ScriptedTabletManagerClient {
    async fn stop_replication_and_get_status(
        &self,
        tablet: &TabletAlias,
        _deadline: Duration,
    ) -> Result<StopReplicationStatus> {
        self.record(format!("stop_replication_and_get_status({tablet})"));
        let script = self.script(tablet).ok_or_else(|| Self::missing(tablet))?;
        if script.is_primary {
            return Err(ErsError::NotReplica(tablet.to_string()));
        }
        script.stop_status.ok_or_else(|| Self::missing(tablet))
    }

    async fn set_source(
        &self,
        tablet: &TabletAlias,
        source: &TabletAlias,
        _start_replication: bool,
        _force_start: bool,
        _deadline: Duration,
    ) -> Result<()> {
        self.record(format!("set_source({tablet} -> {source})"));
        let script = self.script(tablet).unwrap_or_default();
        if script.fail_set_source {
            Err(ErsError::RpcFailed {
                rpc: "set_source",
                tablet: tablet.to_string(),
                source: "scripted failure".to_string(),
            })
        } else {
            Ok(())
        }
    }

    async fn promote_replica(&self, tablet: &TabletAlias, _deadline: Duration) -> Result<Position> {
        self.record(format!("promote_replica({tablet})"));
        let script = self.script(tablet).ok_or_else(|| Self::missing(tablet))?;
        script.promote_position.ok_or_else(|| Self::missing(tablet))
    }

    async fn demote_primary(&self, tablet: &TabletAlias, _deadline: Duration) -> Result<Position> {
        self.record(format!("demote_primary({tablet})"));
        let script = self.script(tablet).ok_or_else(|| Self::missing(tablet))?;
        script.promote_position.ok_or_else(|| Self::missing(tablet))
    }

    async fn undo_demote_primary(&self, tablet: &TabletAlias, _deadline: Duration) -> Result<()> {
        self.record(format!("undo_demote_primary({tablet})"));
        Ok(())
    }

    async fn wait_for_position(
        &self,
        tablet: &TabletAlias,
        _target: &Position,
        _deadline: Duration,
    ) -> Result<()> {
        self.record(format!("wait_for_position({tablet})"));
        let script = self.script(tablet).unwrap_or_default();
        if script.fail_wait_for_position {
            Err(ErsError::Timeout(tablet.to_string()))
        } else {
            Ok(())
        }
    }

    async fn populate_reparent_journal(
        &self,
        tablet: &TabletAlias,
        term_counter: u64,
        _primary_alias: &TabletAlias,
        _position: &Position,
        _time: DateTime<Utc>,
        _deadline: Duration,
    ) -> Result<()> {
        self.record(format!("populate_reparent_journal({tablet}, term={term_counter})"));
        Ok(())
    }

    async fn read_reparent_journal_info(&self, tablet: &TabletAlias, _deadline: Duration) -> Result<u64> {
        self.record(format!("read_reparent_journal_info({tablet})"));
        Ok(self.script(tablet).map(|s| s.journal_term).unwrap_or(0))
    }

    async fn primary_status(&self, tablet: &TabletAlias, _deadline: Duration) -> Result<Position> {
        self.record(format!("primary_status({tablet})"));
        let script = self.script(tablet).ok_or_else(|| Self::missing(tablet))?;
        script.primary_status.ok_or_else(|| Self::missing(tablet))
    }

    async fn primary_position(&self, tablet: &TabletAlias, _deadline: Duration) -> Result<Position> {
        self.record(format!("primary_position({tablet})"));
        let script = self.script(tablet).ok_or_else(|| Self::missing(tablet))?;
        script.promote_position.ok_or_else(|| Self::missing(tablet))
    }
}
