use std::time::Duration;

use serde::Deserialize;

const DEFAULT_DELIVERY_WORKERS: usize = 4;
const DEFAULT_DELIVERY_BATCH_SIZE: usize = 200;
const DEFAULT_IDLE_DELAY_MS: u64 = 20;
const DEFAULT_EXPIRY_BATCH_SIZE: usize = 100;
const DEFAULT_EXPIRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PIPELINE_CAPACITY: usize = 1024;
const DEFAULT_MAX_BATCH_SIZE: usize = 128;

/// Broker tuning, loaded from `SWITCHMQ_`-prefixed environment variables.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub delivery_workers: Option<usize>,
    pub delivery_batch_size: Option<usize>,
    pub idle_delay_ms: Option<u64>,
    pub expiry_batch_size: Option<usize>,
    pub expiry_interval_ms: Option<u64>,
    pub pipeline_capacity: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub in_memory_mode: Option<bool>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SWITCHMQ_").from_env::<Self>()?)
    }

    pub fn delivery_workers(&self) -> usize {
        self.delivery_workers
            .unwrap_or(DEFAULT_DELIVERY_WORKERS)
            .max(1)
    }

    pub fn delivery_batch_size(&self) -> usize {
        self.delivery_batch_size
            .unwrap_or(DEFAULT_DELIVERY_BATCH_SIZE)
            .max(1)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms.unwrap_or(DEFAULT_IDLE_DELAY_MS))
    }

    pub fn expiry_batch_size(&self) -> usize {
        self.expiry_batch_size
            .unwrap_or(DEFAULT_EXPIRY_BATCH_SIZE)
            .max(1)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(
            self.expiry_interval_ms
                .unwrap_or(DEFAULT_EXPIRY_INTERVAL_MS),
        )
    }

    pub fn pipeline_capacity(&self) -> usize {
        self.pipeline_capacity
            .unwrap_or(DEFAULT_PIPELINE_CAPACITY)
            .max(2)
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE).max(1)
    }

    /// In-memory mode swaps the persistence pipeline for a no-op store.
    pub fn in_memory_mode(&self) -> bool {
        self.in_memory_mode.unwrap_or(false)
    }
}
