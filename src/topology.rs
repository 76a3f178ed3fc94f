//! Topology Store interface (spec §4.4, component C4): shard metadata and
//! the per-shard advisory lock ERS holds across the whole reparent.

use async_trait::async_trait;

use crate::error::Result;
use crate::tablet::{ShardRecord, TabletMap};

/// Read/write access to shard metadata and tablet discovery.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// `ErsError::NoNode` if the shard is missing.
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<ShardRecord>;

    async fn update_shard(&self, keyspace: &str, shard: &str, record: ShardRecord) -> Result<()>;

    async fn get_tablet_map_for_shard(&self, keyspace: &str, shard: &str) -> Result<TabletMap>;

    /// Acquire the per-shard advisory lock; `reason` is recorded for
    /// observability (e.g. `EmergencyReparentShard(<alias>)`).
    async fn lock_shard(
        &self,
        keyspace: &str,
        shard: &str,
        reason: &str,
    ) -> Result<Box<dyn ShardLock>>;
}

/// A held, leased advisory lock. The holder is expected to call `unlock` on
/// every exit path, including failure; unlocking an already-lost lock is a
/// no-op (spec §4.4).
#[async_trait]
pub trait ShardLock: Send + Sync {
    /// `Ok(true)` while the lease is still live, `Ok(false)` if it has
    /// expired, `Err(ErsError::LockLost)` if the store can tell the lease
    /// was explicitly stolen or revoked.
    async fn check_lock_still_held(&self) -> Result<bool>;

    async fn unlock(&self);
}
