//! Event / Telemetry sink (spec §4.7, component C7): per-call counters,
//! per-phase duration histograms, and a subscribable stream of structured
//! state-transition events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The reparent state machine's states (spec §4.6 diagram), used to tag
/// structured events in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Start,
    Locked,
    Stopped,
    RelaysCaughtUp,
    IntermediatePromoted,
    FinalPromoted,
    Reparented,
    Done,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    Transition(OrchestratorState),
    /// Non-fatal call-outs, e.g. the §9 backup-taking-tablet heuristic.
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub keyspace: String,
    pub shard: String,
    pub kind: EventKind,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Counters and duration histograms keyed by `(keyspace, shard, outcome)` /
/// `(keyspace, shard, phase)`, plus a broadcast sink for the event stream.
/// Uses `dashmap` for lock-free per-key access, matching the teacher's
/// monitoring module (`src/api/monitoring/metrics_core.rs`).
pub struct Telemetry {
    counters: DashMap<(String, String, Outcome), AtomicU64>,
    durations: DashMap<(String, String, &'static str), Mutex<Vec<Duration>>>,
    sink: broadcast::Sender<Event>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        let (sink, _) = broadcast::channel(256);
        Self {
            counters: DashMap::new(),
            durations: DashMap::new(),
            sink,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sink.subscribe()
    }

    pub fn record_outcome(&self, keyspace: &str, shard: &str, outcome: Outcome) {
        self.counters
            .entry((keyspace.to_string(), shard.to_string(), outcome))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter(&self, keyspace: &str, shard: &str, outcome: Outcome) -> u64 {
        self.counters
            .get(&(keyspace.to_string(), shard.to_string(), outcome))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record_phase_duration(&self, keyspace: &str, shard: &str, phase: &'static str, d: Duration) {
        self.durations
            .entry((keyspace.to_string(), shard.to_string(), phase))
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(d);
    }

    pub fn phase_durations(&self, keyspace: &str, shard: &str, phase: &'static str) -> Vec<Duration> {
        self.durations
            .get(&(keyspace.to_string(), shard.to_string(), phase))
            .map(|v| v.lock().clone())
            .unwrap_or_default()
    }

    pub fn emit(&self, keyspace: &str, shard: &str, state: OrchestratorState, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(keyspace, shard, ?state, %message, "ers state transition");
        let event = Event {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            kind: EventKind::Transition(state),
            message,
            time: Utc::now(),
        };
        let _ = self.sink.send(event);
    }

    pub fn emit_warning(&self, keyspace: &str, shard: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(keyspace, shard, %message, "ers warning");
        let event = Event {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            kind: EventKind::Warning,
            message,
            time: Utc::now(),
        };
        let _ = self.sink.send(event);
    }
}

/// A run's full ordered event log, returned to the caller alongside the
/// result (spec §6 `(event_log, err)`).
pub type EventLog = Vec<Event>;

/// Drains everything currently buffered on a subscribed receiver into a
/// plain `Vec`, for callers who just want the final log rather than a live
/// stream.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> EventLog {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
