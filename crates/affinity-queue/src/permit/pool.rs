//! Affinity manager: N exclusive slots with a scan-based "acquire any" search.
//!
//! Each slot is guarded by its own mutex. A scan never holds one slot's lock
//! while looking at another, so a slot freed between two passes may be claimed
//! by whichever waiter scans it first. That race only decides *which* slot a
//! waiter ends up with; each per-slot claim is atomic, so exclusivity holds.
//!
//! Acquisition is not FIFO-fair. Every pass restarts at slot 0, which biases
//! low-numbered slots toward higher utilization under contention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::slot::{SlotId, SlotInfo, SlotState};
use crate::job::JobId;

/// Pause between full scans when no slot was free.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// How long a job may wait for a slot before it is reported busy.
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("Slot ID {slot} is out of range, must be between 0 and {max}")]
    InvalidSlotId { slot: usize, max: usize },
    #[error("Slot pool requires at least one slot")]
    NoSlots,
    #[error("Slot pool has been disposed")]
    Disposed,
}

/// Busy share of `total` slots as a percentage.
pub(crate) fn utilization(busy: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    busy as f64 / total as f64 * 100.0
}

/// Why `try_acquire_any` gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    Timeout,
    Cancelled,
}

impl DenialReason {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Timeout => "No slots available within timeout",
            Self::Cancelled => "Acquisition cancelled",
        }
    }
}

/// Outcome of a bounded search for any free slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Granted { slot_id: SlotId, wait_time: Duration },
    Denied { reason: DenialReason, wait_time: Duration },
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Granted { .. })
    }

    pub fn wait_time(&self) -> Duration {
        match self {
            Acquisition::Granted { wait_time, .. } | Acquisition::Denied { wait_time, .. } => {
                *wait_time
            }
        }
    }
}

/// Owns N exclusive execution slots.
///
/// Shared by handle (`Arc`) between the worker pool and status readers; there
/// is no process-global instance.
pub struct AffinityManager {
    slots: Vec<StdMutex<SlotState>>,
    scan_interval: Duration,
    disposed: AtomicBool,
}

impl AffinityManager {
    pub fn new(total_slots: usize) -> Result<Self, SlotError> {
        if total_slots == 0 {
            return Err(SlotError::NoSlots);
        }

        let slots = (0..total_slots)
            .map(|_| StdMutex::new(SlotState::default()))
            .collect();

        tracing::info!(total_slots, "Slot pool initialized");

        Ok(Self {
            slots,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    /// Non-blocking attempt on exactly one named slot.
    pub fn try_acquire_specific(&self, slot_id: SlotId, job_id: &JobId) -> Result<bool, SlotError> {
        self.ensure_not_disposed()?;
        let index = self.check_range(slot_id)?;

        let acquired = self.lock_slot(index).try_claim(job_id);
        if acquired {
            tracing::debug!(slot = %slot_id, job_id = %job_id, "Slot acquired");
        } else {
            tracing::debug!(slot = %slot_id, job_id = %job_id, "Slot is currently busy");
        }
        Ok(acquired)
    }

    /// Scan slots `0..N` for a free one, sleeping `scan_interval` between passes.
    ///
    /// Reports `Denied` once `timeout` elapses or `cancel` fires. A zero
    /// timeout performs exactly one pass.
    pub async fn try_acquire_any(
        &self,
        job_id: &JobId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, SlotError> {
        self.ensure_not_disposed()?;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let denied = |reason: DenialReason| Acquisition::Denied {
            reason,
            wait_time: started.elapsed(),
        };

        loop {
            for index in 0..self.slots.len() {
                if cancel.is_cancelled() {
                    return Ok(denied(DenialReason::Cancelled));
                }
                self.ensure_not_disposed()?;

                if self.lock_slot(index).try_claim(job_id) {
                    let wait_time = started.elapsed();
                    let slot_id = SlotId::new(index);
                    tracing::info!(
                        slot = %slot_id,
                        job_id = %job_id,
                        wait_ms = wait_time.as_millis() as u64,
                        "Acquired slot"
                    );
                    return Ok(Acquisition::Granted { slot_id, wait_time });
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(denied(DenialReason::Timeout));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(denied(DenialReason::Cancelled)),
                _ = tokio::time::sleep_until(deadline) => return Ok(denied(DenialReason::Timeout)),
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
    }

    /// Mark a slot free. Releasing a slot that is not held is logged, not an error.
    pub fn release(&self, slot_id: SlotId) -> Result<(), SlotError> {
        self.ensure_not_disposed()?;
        let index = self.check_range(slot_id)?;

        match self.lock_slot(index).clear() {
            Some(holder) => {
                let held_ms = (chrono::Utc::now() - holder.acquired_since).num_milliseconds();
                tracing::debug!(slot = %slot_id, job_id = %holder.job_id, held_ms, "Slot released");
            }
            None => {
                tracing::warn!(slot = %slot_id, "Attempted to release slot that was not acquired");
            }
        }
        Ok(())
    }

    /// First free slot at the time of the call, without claiming it.
    pub fn first_available(&self) -> Result<Option<SlotId>, SlotError> {
        self.ensure_not_disposed()?;
        Ok((0..self.slots.len())
            .find(|&index| self.lock_slot(index).is_free())
            .map(SlotId::new))
    }

    pub fn snapshot(&self) -> Result<Vec<SlotInfo>, SlotError> {
        self.ensure_not_disposed()?;
        Ok((0..self.slots.len())
            .map(|index| self.lock_slot(index).info(SlotId::new(index)))
            .collect())
    }

    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    /// Approximate under concurrency; each slot is read under its own lock.
    pub fn available_slots(&self) -> usize {
        (0..self.slots.len())
            .filter(|&index| self.lock_slot(index).is_free())
            .count()
    }

    pub fn busy_slots(&self) -> usize {
        self.total_slots().saturating_sub(self.available_slots())
    }

    pub fn utilization_percentage(&self) -> f64 {
        utilization(self.busy_slots(), self.total_slots())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Tear down the pool. Every slot is forcibly freed regardless of holder;
    /// later operations fail with [`SlotError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let mut state = match slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(holder) = state.clear() {
                tracing::warn!(
                    slot = index,
                    job_id = %holder.job_id,
                    "Slot forcibly freed during disposal"
                );
            }
        }

        tracing::info!("Slot pool disposed");
    }

    fn ensure_not_disposed(&self) -> Result<(), SlotError> {
        if self.is_disposed() {
            return Err(SlotError::Disposed);
        }
        Ok(())
    }

    fn check_range(&self, slot_id: SlotId) -> Result<usize, SlotError> {
        let index = slot_id.index();
        if index >= self.slots.len() {
            return Err(SlotError::InvalidSlotId {
                slot: index,
                max: self.slots.len() - 1,
            });
        }
        Ok(index)
    }

    fn lock_slot(&self, index: usize) -> MutexGuard<'_, SlotState> {
        match self.slots[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(slot = index, "Slot mutex poisoned - recovering state");
                poisoned.into_inner()
            }
        }
    }
}
