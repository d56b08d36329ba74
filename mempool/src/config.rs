use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::GasPrice;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub account: AccountPoolConfig,
    pub priority: PriorityPoolConfig,
    pub queue: QueueConfig,
    pub proposal: ProposalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountPoolConfig {
    pub capacity: usize,
    /// Fraction of `capacity` above which gapped inserts must displace a
    /// cheaper gapped transaction to get in.
    pub capacity_high_watermark: f64,
    /// Seconds a gapped transaction may wait for its gap to close before it
    /// is evicted during recheck.
    pub queued_lifetime_sec: u64,
    /// Percent by which both fee caps must grow to replace a transaction
    /// occupying the same nonce.
    pub price_bump_percent: u128,
    /// Pending transactions tipping below this never reach iteration.
    pub min_tip: GasPrice,
}

impl AccountPoolConfig {
    pub fn queued_lifetime(&self) -> Duration {
        Duration::from_secs(self.queued_lifetime_sec)
    }

    pub fn high_watermark(&self) -> usize {
        (self.capacity as f64 * self.capacity_high_watermark) as usize
    }
}

impl Default for AccountPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            capacity_high_watermark: 0.9,
            queued_lifetime_sec: 300,
            price_bump_percent: 10,
            min_tip: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPoolConfig {
    pub capacity: usize,
    /// Transactions pricing below this are rejected outright.
    pub min_gas_price: GasPrice,
}

impl Default for PriorityPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            min_gas_price: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Submissions the admission queue buffers before refusing new ones.
    pub depth: usize,
    /// Most submissions the worker hands to the pool in one batch.
    pub batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 1024,
            batch: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalConfig {
    /// Cadence of speculative proposal builds.
    pub interval_ms: u64,
    /// Byte budget of a built proposal.
    pub max_bytes: u64,
    /// How long iteration waits for the pending snapshot of the current
    /// height before falling back to fee-lane transactions only.
    pub snapshot_wait_ms: u64,
}

impl ProposalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.snapshot_wait_ms)
    }
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            interval_ms: 400,
            max_bytes: 2 * 1024 * 1024,
            snapshot_wait_ms: 500,
        }
    }
}
