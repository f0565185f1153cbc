//! Coordinator-assigned per-worker budgets and the fleet-wide block FSM.

use serde::{Deserialize, Serialize};

/// A hard ceiling assigned to exactly one worker, recomputed on every
/// allocation pass. Workers must treat this as authoritative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quota {
    /// Concurrency ceiling (`AIMD.C_max`).
    pub concurrency: u32,
    /// QPS ceiling (`TokenBucket.rate`).
    pub qps: f64,
    /// Unix seconds this quota was computed.
    pub assigned_at: u64,
}

/// Coordinator-side fleet-wide block cooldown state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GlobalBlockState {
    /// Unix seconds the cooldown ends. `0` means never triggered.
    pub block_until: u64,
    /// Monotonic counter of block events. Workers never process the same
    /// epoch twice and never regress.
    pub recovery_epoch: u64,
    /// Worker id whose report triggered the most recent block, if any.
    pub triggered_by: Option<String>,
}

impl GlobalBlockState {
    /// Whether the cooldown is active at `now`.
    #[must_use]
    pub fn is_active(&self, now: u64) -> bool {
        now < self.block_until
    }
}

/// The global-block descriptor a worker receives on sync, plus its own
/// recovery jitter for AIMD rule #5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GlobalBlockDescriptor {
    /// Whether the cooldown is currently active.
    pub active: bool,
    /// Seconds remaining in the cooldown, `0` if inactive.
    pub remaining_s: u64,
    /// Worker id that triggered it, if any.
    pub triggered_by: Option<String>,
    /// Current epoch.
    pub epoch: u64,
    /// This worker's recovery jitter in `[0, 1]`, assigned at block time.
    pub recovery_jitter: f64,
}
