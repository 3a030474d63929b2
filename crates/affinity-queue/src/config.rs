//! Runtime configuration for the processing core.
//!
//! Every setting has a default; `AFFINITY_*` environment variables override
//! them. Durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use crate::permit::{DEFAULT_ACQUISITION_TIMEOUT, DEFAULT_SCAN_INTERVAL};
use crate::processor::DEFAULT_TICK;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub const ENV_SLOTS: &str = "AFFINITY_SLOTS";
pub const ENV_WORKERS: &str = "AFFINITY_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "AFFINITY_QUEUE_CAPACITY";
pub const ENV_ACQUISITION_TIMEOUT_MS: &str = "AFFINITY_ACQUISITION_TIMEOUT_MS";
pub const ENV_SCAN_INTERVAL_MS: &str = "AFFINITY_SCAN_INTERVAL_MS";
pub const ENV_TICK_MS: &str = "AFFINITY_TICK_MS";
pub const ENV_DRAIN_TIMEOUT_MS: &str = "AFFINITY_DRAIN_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub total_slots: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub acquisition_timeout: Duration,
    pub scan_interval: Duration,
    /// Length of one simulated job iteration.
    pub tick: Duration,
    pub drain_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        let cores = logical_cores();
        Self {
            total_slots: cores,
            worker_count: cores,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            tick: DEFAULT_TICK,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ProcessorSettings {
    pub fn with_slots(mut self, total_slots: usize) -> Self {
        self.total_slots = total_slots;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Defaults overridden by `AFFINITY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `AFFINITY_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(v) = parse_key(&lookup, ENV_SLOTS)? {
            settings.total_slots = v;
        }
        if let Some(v) = parse_key(&lookup, ENV_WORKERS)? {
            settings.worker_count = v;
        }
        if let Some(v) = parse_key(&lookup, ENV_QUEUE_CAPACITY)? {
            settings.queue_capacity = v;
        }
        if let Some(ms) = parse_key(&lookup, ENV_ACQUISITION_TIMEOUT_MS)? {
            settings.acquisition_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key(&lookup, ENV_SCAN_INTERVAL_MS)? {
            settings.scan_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key(&lookup, ENV_TICK_MS)? {
            settings.tick = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key(&lookup, ENV_DRAIN_TIMEOUT_MS)? {
            settings.drain_timeout = Duration::from_millis(ms);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_slots == 0 {
            return Err(ConfigError::MustBePositive("total_slots"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::MustBePositive("worker_count"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::MustBePositive("queue_capacity"));
        }
        if self.scan_interval.is_zero() {
            return Err(ConfigError::MustBePositive("scan_interval"));
        }
        Ok(())
    }
}

/// Host logical core count, falling back to 1 if it cannot be determined.
pub fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub(crate) fn parse_key<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    trimmed
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
