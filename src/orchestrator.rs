//! Reparent Orchestrator (spec §4.6, component C6): the state machine that
//! drives a full emergency reparent from a locked shard to a new, durably
//! reachable primary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;

use crate::candidate::{self, Selection};
use crate::durability::{self, DurabilityPolicy};
use crate::error::{ErsError, Result};
use crate::gtid::Position;
use crate::options::Options;
use crate::tablet::{ShardRecord, StopReplicationStatus, TabletAlias, TabletMap};
use crate::telemetry::{self, EventLog, OrchestratorState, Outcome, Telemetry};
use crate::tmc::TabletManagerClient;
use crate::topology::{ShardLock, TopologyStore};

/// Deadline for RPCs that are not bounded by `wait_replicas_timeout`
/// (promote/demote/journal calls), independent of the caller's own timeout.
const REMOTE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives `ReparentShard(keyspace, shard, opts)` (spec §6).
pub struct ReparentCoordinator {
    tmc: Arc<dyn TabletManagerClient>,
    topology: Arc<dyn TopologyStore>,
    telemetry: Arc<Telemetry>,
}

impl ReparentCoordinator {
    pub fn new(
        tmc: Arc<dyn TabletManagerClient>,
        topology: Arc<dyn TopologyStore>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self { tmc, topology, telemetry }
    }

    /// Runs one emergency reparent to completion or to its first fatal
    /// error, returning the ordered event log alongside the result.
    pub async fn reparent_shard(&self, keyspace: &str, shard: &str, opts: Options) -> (EventLog, Result<TabletAlias>) {
        let mut rx = self.telemetry.subscribe();
        let result = self.run(keyspace, shard, opts).await;
        self.telemetry.record_outcome(
            keyspace,
            shard,
            if result.is_ok() { Outcome::Success } else { Outcome::Failure },
        );
        (telemetry::drain(&mut rx), result)
    }

    async fn run(&self, keyspace: &str, shard: &str, opts: Options) -> Result<TabletAlias> {
        self.telemetry.emit(keyspace, shard, OrchestratorState::Start, "reparent started");
        let policy = durability::resolve(&opts.durability)?;

        let reason = format!(
            "EmergencyReparentShard({})",
            opts.new_primary_alias.as_ref().map(|a| a.to_string()).unwrap_or_default()
        );
        let lock = self.topology.lock_shard(keyspace, shard, &reason).await?;

        let outcome = self.run_locked(keyspace, shard, &opts, policy.as_ref(), lock.as_ref()).await;

        // Lock release happens on every exit path, success or failure
        // (spec §4.6 Abort, §5 lock-release ordering).
        lock.unlock().await;

        if let Err(e) = &outcome {
            self.telemetry.emit(keyspace, shard, OrchestratorState::Abort, e.to_string());
        }
        outcome
    }

    async fn run_locked(
        &self,
        keyspace: &str,
        shard: &str,
        opts: &Options,
        policy: &dyn DurabilityPolicy,
        lock: &dyn ShardLock,
    ) -> Result<TabletAlias> {
        let shard_record = self.topology.get_shard(keyspace, shard).await?;
        if let Some(expected) = &opts.expected_primary_alias {
            let actual = shard_record.primary_alias.clone();
            if actual.as_ref() != Some(expected) {
                return Err(ErsError::ExpectedPrimaryMismatch {
                    expected: expected.to_string(),
                    actual: actual.map(|a| a.to_string()).unwrap_or_else(|| "none".to_string()),
                });
            }
        }
        let previous_primary_cell = shard_record.primary_alias.as_ref().map(|a| a.cell.clone());

        let tablet_map = self.topology.get_tablet_map_for_shard(keyspace, shard).await?;
        self.telemetry.emit(keyspace, shard, OrchestratorState::Locked, "shard lock acquired");

        // B -> C: stop replication everywhere and snapshot positions.
        let started = Instant::now();
        let (status_map, primary_status_map) = self.stop_all_replicas(&tablet_map, opts).await?;
        self.telemetry
            .record_phase_duration(keyspace, shard, "stop_replication", started.elapsed());
        self.telemetry.emit(
            keyspace,
            shard,
            OrchestratorState::Stopped,
            format!("{} stopped, {} probed as primary", status_map.len(), primary_status_map.len()),
        );
        ensure_lock_held(lock).await?;

        // C -> D: wait for relay logs to apply on the most advanced candidates.
        let started = Instant::now();
        let caught_up = self.wait_for_relay_logs(&status_map, opts).await?;
        self.telemetry
            .record_phase_duration(keyspace, shard, "relay_apply", started.elapsed());
        self.telemetry.emit(
            keyspace,
            shard,
            OrchestratorState::RelaysCaughtUp,
            format!("{} candidates caught up", caught_up.len()),
        );

        // D -> E: select and promote the intermediate source.
        let (selection, max_term) = self
            .select_intermediate(
                keyspace,
                shard,
                &tablet_map,
                &status_map,
                &primary_status_map,
                &caught_up,
                policy,
                previous_primary_cell.as_deref(),
                opts,
            )
            .await?;

        let mut new_primary = selection.primary.clone();
        let mut new_primary_position = self
            .tmc
            .promote_replica(&new_primary, REMOTE_OP_TIMEOUT)
            .await
            .map_err(|e| ErsError::IntermediatePromotionFailed(e.to_string()))?;
        self.telemetry.emit(
            keyspace,
            shard,
            OrchestratorState::IntermediatePromoted,
            format!("promoted intermediate primary {new_primary}"),
        );

        let attached = self.attach_to_source(&tablet_map, &new_primary, &status_map, opts).await?;

        // E -> F: re-run selection among tablets now attached to the
        // intermediate; a rule-preferred tablet may outrank it even though
        // positions are now tied.
        let final_selection = self
            .select_final_primary(
                &tablet_map,
                &new_primary,
                &new_primary_position,
                &attached,
                policy,
                previous_primary_cell.as_deref(),
                opts,
            )
            .await?;

        if final_selection.primary != new_primary {
            let pos = self
                .tmc
                .promote_replica(&final_selection.primary, REMOTE_OP_TIMEOUT)
                .await
                .map_err(|e| ErsError::IntermediatePromotionFailed(e.to_string()))?;
            new_primary = final_selection.primary;
            new_primary_position = pos;
        }
        self.telemetry.emit(
            keyspace,
            shard,
            OrchestratorState::FinalPromoted,
            format!("final primary {new_primary}"),
        );

        // F -> G: journal write happens-before survivors are told, then
        // best-effort fan-out to everyone else.
        let next_term = max_term + 1;
        self.tmc
            .populate_reparent_journal(
                &new_primary,
                next_term,
                &new_primary,
                &new_primary_position,
                Utc::now(),
                REMOTE_OP_TIMEOUT,
            )
            .await
            .map_err(|e| ErsError::JournalWrite(new_primary.to_string(), e.to_string()))?;

        self.reparent_survivors(&tablet_map, &new_primary, &status_map, opts).await?;
        self.telemetry
            .emit(keyspace, shard, OrchestratorState::Reparented, "survivors reparented");

        // G -> H: publish the new primary and release (lock release happens
        // in `run`, after this returns).
        self.topology
            .update_shard(
                keyspace,
                shard,
                ShardRecord {
                    primary_alias: Some(new_primary.clone()),
                    is_primary_serving: true,
                    primary_term_start_time: Some(Utc::now()),
                },
            )
            .await?;
        self.telemetry
            .emit(keyspace, shard, OrchestratorState::Done, format!("new primary {new_primary}"));

        Ok(new_primary)
    }

    /// B -> C: fan out `stop_replication_and_get_status`; tablets that
    /// claim to be primary are re-probed via `primary_status`.
    async fn stop_all_replicas(
        &self,
        tablet_map: &TabletMap,
        opts: &Options,
    ) -> Result<(HashMap<TabletAlias, StopReplicationStatus>, HashMap<TabletAlias, Position>)> {
        let mut tasks = JoinSet::new();
        let mut total = 0usize;
        for alias in tablet_map.keys() {
            if opts.ignore_replicas.contains(alias) {
                continue;
            }
            total += 1;
            let tmc = Arc::clone(&self.tmc);
            let alias = alias.clone();
            let deadline = opts.wait_replicas_timeout;
            tasks.spawn(async move {
                let res = tmc.stop_replication_and_get_status(&alias, deadline).await;
                (alias, res)
            });
        }

        let mut status_map = HashMap::new();
        let mut primary_status_map = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((alias, Ok(status))) => {
                    status_map.insert(alias, status);
                }
                Ok((alias, Err(ErsError::NotReplica(_)))) => {
                    match self.tmc.primary_status(&alias, opts.wait_replicas_timeout).await {
                        Ok(position) => {
                            primary_status_map.insert(alias, position);
                        }
                        Err(e) => tracing::warn!(%alias, error = %e, "primary-status probe failed"),
                    }
                }
                Ok((alias, Err(e))) => tracing::warn!(%alias, error = %e, "stop-replication failed"),
                Err(e) => tracing::warn!(error = %e, "stop-replication task panicked"),
            }
        }

        let needed = (total + 1) / 2;
        if status_map.len() >= needed || !primary_status_map.is_empty() {
            Ok((status_map, primary_status_map))
        } else {
            Err(ErsError::StopReplicationFailed(format!(
                "{} of {total} tablets responded, needed {needed}",
                status_map.len()
            )))
        }
    }

    /// C -> D: wait for the most advanced candidates to apply their relay
    /// logs. Slow tablets drop out of the pool, not the tablet map.
    async fn wait_for_relay_logs(
        &self,
        status_map: &HashMap<TabletAlias, StopReplicationStatus>,
        opts: &Options,
    ) -> Result<HashSet<TabletAlias>> {
        let positions = candidate::collect_positions(status_map, &HashMap::new())?;
        if positions.is_empty() {
            return Err(ErsError::RelayLogsDidNotApply);
        }

        let mut max_position: Option<Position> = None;
        for position in positions.values() {
            max_position = Some(match max_position {
                Some(acc) => Position::union(&acc, position)?,
                None => position.clone(),
            });
        }
        let max_position = max_position.expect("positions checked non-empty above");

        let mut tasks = JoinSet::new();
        for alias in positions.keys() {
            let tmc = Arc::clone(&self.tmc);
            let alias = alias.clone();
            let target = max_position.clone();
            let deadline = opts.wait_replicas_timeout;
            tasks.spawn(async move {
                let res = tmc.wait_for_position(&alias, &target, deadline).await;
                (alias, res)
            });
        }

        let mut caught_up = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((alias, Ok(()))) => {
                    caught_up.insert(alias);
                }
                Ok((alias, Err(e))) => tracing::warn!(%alias, error = %e, "relay log did not apply in time"),
                Err(e) => tracing::warn!(error = %e, "wait_for_position task panicked"),
            }
        }

        if caught_up.is_empty() {
            Err(ErsError::RelayLogsDidNotApply)
        } else {
            Ok(caught_up)
        }
    }

    /// D -> E: candidate selection restricted to tablets that caught up (or
    /// were probed as primary), with the §9 backup-taking heuristic applied.
    /// Position-only: promotion rules are not enforced here, so a `MUST_NOT`
    /// tablet holding the most-advanced position can still become the
    /// intermediate relay rather than lose its data (spec §4.6); a
    /// rule-eligible primary is chosen afterward in `select_final_primary`.
    #[allow(clippy::too_many_arguments)]
    async fn select_intermediate(
        &self,
        keyspace: &str,
        shard: &str,
        tablet_map: &TabletMap,
        status_map: &HashMap<TabletAlias, StopReplicationStatus>,
        primary_status_map: &HashMap<TabletAlias, Position>,
        caught_up: &HashSet<TabletAlias>,
        policy: &dyn DurabilityPolicy,
        previous_primary_cell: Option<&str>,
        opts: &Options,
    ) -> Result<(Selection, u64)> {
        let survived_status: HashMap<_, _> = status_map
            .iter()
            .filter(|(alias, _)| caught_up.contains(*alias))
            .map(|(alias, status)| (alias.clone(), status.clone()))
            .collect();

        let mut positions = candidate::collect_positions(&survived_status, primary_status_map)?;
        exclude_backup_taking_tablets(keyspace, shard, tablet_map, &mut positions, &self.telemetry, &opts.durability);

        let terms = candidate::fetch_journal_terms(self.tmc.as_ref(), positions.keys(), REMOTE_OP_TIMEOUT).await?;
        let max_term = terms.values().copied().max().unwrap_or(0);
        let eligible = candidate::mark_errant(&positions, &terms)?;
        let selection = candidate::select_primary(
            tablet_map,
            &positions,
            &eligible,
            policy,
            opts.prevent_cross_cell_promotion,
            previous_primary_cell,
            opts.new_primary_alias.as_ref(),
            None,
            false,
        )?;
        Ok((selection, max_term))
    }

    /// D -> E (continued): point every other reachable tablet at the newly
    /// promoted intermediate source.
    async fn attach_to_source(
        &self,
        tablet_map: &TabletMap,
        source: &TabletAlias,
        status_map: &HashMap<TabletAlias, StopReplicationStatus>,
        opts: &Options,
    ) -> Result<HashSet<TabletAlias>> {
        let mut tasks = JoinSet::new();
        let mut attempted = 0usize;
        for alias in tablet_map.keys() {
            if alias == source || opts.ignore_replicas.contains(alias) {
                continue;
            }
            attempted += 1;
            let was_running = status_map
                .get(alias)
                .map(|s| s.before.io_thread_running && s.before.sql_thread_running)
                .unwrap_or(false);
            let tmc = Arc::clone(&self.tmc);
            let alias = alias.clone();
            let source = source.clone();
            tasks.spawn(async move {
                let res = tmc.set_source(&alias, &source, true, was_running, REMOTE_OP_TIMEOUT).await;
                (alias, res)
            });
        }

        let mut attached = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((alias, Ok(()))) => {
                    attached.insert(alias);
                }
                Ok((alias, Err(e))) => tracing::warn!(%alias, error = %e, "set_source to intermediate failed"),
                Err(e) => tracing::warn!(error = %e, "set_source task panicked"),
            }
        }

        let needed = (attempted + 1) / 2;
        if attempted == 0 || attached.len() >= needed {
            Ok(attached)
        } else {
            Err(ErsError::IntermediatePromotionFailed(format!(
                "only {} of {attempted} replicas attached to the intermediate primary",
                attached.len()
            )))
        }
    }

    /// E -> F: among tablets now attached (assumed caught up to the
    /// intermediate's position), pick the final primary.
    #[allow(clippy::too_many_arguments)]
    async fn select_final_primary(
        &self,
        tablet_map: &TabletMap,
        intermediate: &TabletAlias,
        intermediate_position: &Position,
        attached: &HashSet<TabletAlias>,
        policy: &dyn DurabilityPolicy,
        previous_primary_cell: Option<&str>,
        opts: &Options,
    ) -> Result<Selection> {
        let mut positions = HashMap::new();
        positions.insert(intermediate.clone(), intermediate_position.clone());
        for alias in attached {
            positions.insert(alias.clone(), intermediate_position.clone());
        }

        let terms = candidate::fetch_journal_terms(self.tmc.as_ref(), positions.keys(), REMOTE_OP_TIMEOUT).await?;
        let eligible = candidate::mark_errant(&positions, &terms)?;
        candidate::select_primary(
            tablet_map,
            &positions,
            &eligible,
            policy,
            opts.prevent_cross_cell_promotion,
            previous_primary_cell,
            opts.new_primary_alias.as_ref(),
            Some(intermediate),
            true,
        )
    }

    /// F -> G: reparent survivors. Individual failures are logged, not
    /// fatal; ERS fails only if every survivor fails.
    ///
    /// Per spec §5, the parent's cancellation must never reach into these
    /// RPCs: each call is `tokio::spawn`ed (detached) rather than tracked in
    /// a `JoinSet`, whose `Drop` would abort still-running tasks. We only
    /// bound how long *this function* waits for the results to come back;
    /// abandoning that wait does not cancel the spawned work.
    async fn reparent_survivors(
        &self,
        tablet_map: &TabletMap,
        new_primary: &TabletAlias,
        status_map: &HashMap<TabletAlias, StopReplicationStatus>,
        opts: &Options,
    ) -> Result<()> {
        let mut handles = Vec::new();
        for alias in tablet_map.keys() {
            if alias == new_primary || opts.ignore_replicas.contains(alias) {
                continue;
            }
            let was_running = status_map
                .get(alias)
                .map(|s| s.before.io_thread_running && s.before.sql_thread_running)
                .unwrap_or(true);
            let tmc = Arc::clone(&self.tmc);
            let alias = alias.clone();
            let new_primary = new_primary.clone();
            handles.push(tokio::spawn(async move {
                let res = tmc.set_source(&alias, &new_primary, true, was_running, REMOTE_OP_TIMEOUT).await;
                (alias, res)
            }));
        }

        let total = handles.len();
        let mut succeeded = 0usize;
        let gather = async {
            for handle in handles {
                match handle.await {
                    Ok((_alias, Ok(()))) => succeeded += 1,
                    Ok((alias, Err(e))) => tracing::warn!(%alias, error = %e, "reparenting survivor failed"),
                    Err(e) => tracing::warn!(error = %e, "reparent task panicked"),
                }
            }
        };
        let _ = tokio::time::timeout(opts.wait_replicas_timeout, gather).await;

        if total > 0 && succeeded == 0 {
            Err(ErsError::AllReplicasFailed)
        } else {
            Ok(())
        }
    }
}

async fn ensure_lock_held(lock: &dyn ShardLock) -> Result<()> {
    match lock.check_lock_still_held().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ErsError::LockLost("lease expired mid-reparent".to_string())),
        Err(e) => Err(e),
    }
}

/// §9 Open Question: drop backup-taking tablets from candidacy, but only if
/// doing so still leaves at least one candidate — otherwise keep them and
/// surface a warning, since excluding the only safe candidate would be worse.
fn exclude_backup_taking_tablets(
    keyspace: &str,
    shard: &str,
    tablet_map: &TabletMap,
    positions: &mut HashMap<TabletAlias, Position>,
    telemetry: &Telemetry,
    durability_name: &str,
) {
    let backup_taking: Vec<TabletAlias> = positions
        .keys()
        .filter(|a| tablet_map.get(*a).map(|t| t.taking_backup).unwrap_or(false))
        .cloned()
        .collect();
    if backup_taking.is_empty() || backup_taking.len() == positions.len() {
        if !backup_taking.is_empty() {
            telemetry.emit_warning(
                keyspace,
                shard,
                format!(
                    "all {} remaining candidates are taking a backup; keeping them eligible under {durability_name}",
                    backup_taking.len()
                ),
            );
        }
        return;
    }
    for alias in backup_taking {
        positions.remove(&alias);
    }
}

