//! Per-slot occupancy state.
//!
//! The holder job and the acquired-since timestamp live in one `Option`, so a
//! slot can never be "occupied" without a holder or hold a stale timestamp
//! after release.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::JobId;

/// Dense slot index in `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SlotHolder {
    pub job_id: JobId,
    pub acquired_since: DateTime<Utc>,
}

/// Mutable state of one slot, guarded by its own mutex in the pool.
#[derive(Debug, Default)]
pub(crate) struct SlotState {
    holder: Option<SlotHolder>,
}

impl SlotState {
    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }

    /// Claim the slot for `job_id`. Returns false if already held.
    pub fn try_claim(&mut self, job_id: &JobId) -> bool {
        if self.holder.is_some() {
            return false;
        }
        self.holder = Some(SlotHolder {
            job_id: job_id.clone(),
            acquired_since: Utc::now(),
        });
        true
    }

    /// Clear the holder. Returns the previous holder, if any.
    pub fn clear(&mut self) -> Option<SlotHolder> {
        self.holder.take()
    }

    pub fn info(&self, id: SlotId) -> SlotInfo {
        SlotInfo {
            id,
            is_available: self.holder.is_none(),
            holder: self.holder.as_ref().map(|h| h.job_id.clone()),
            acquired_since: self.holder.as_ref().map(|h| h.acquired_since),
        }
    }
}

/// Read-only view of one slot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub id: SlotId,
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_since: Option<DateTime<Utc>>,
}

impl SlotInfo {
    /// How long the current holder has had the slot.
    pub fn hold_duration(&self) -> Option<chrono::Duration> {
        self.acquired_since.map(|since| Utc::now() - since)
    }
}
