//! In-flight job registry.
//!
//! Lock-free concurrent access via DashMap. An entry exists from the moment a
//! job is accepted until its result has been delivered, and carries the job's
//! cancellation token so it can be cancelled by id from outside the worker.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, JobPhase};
use crate::permit::SlotId;
use crate::worker::WorkerId;

/// Point-in-time view of one tracked job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub phase: JobPhase,
    pub slot_id: Option<SlotId>,
    pub worker_id: Option<WorkerId>,
    pub age: Duration,
}

struct TrackedJob {
    phase: JobPhase,
    slot_id: Option<SlotId>,
    worker_id: Option<WorkerId>,
    accepted_at: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct JobTracker {
    jobs: DashMap<JobId, TrackedJob>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a job in `Queued`. Returns false if the id is already in flight.
    pub fn register(&self, id: JobId, cancel: CancellationToken) -> bool {
        match self.jobs.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(TrackedJob {
                    phase: JobPhase::Queued,
                    slot_id: None,
                    worker_id: None,
                    accepted_at: Instant::now(),
                    cancel,
                });
                true
            }
        }
    }

    /// Move a job to `next`. Illegal transitions are logged and ignored.
    pub fn transition(&self, id: &JobId, next: JobPhase) -> bool {
        let Some(mut entry) = self.jobs.get_mut(id) else {
            return false;
        };

        if !entry.phase.can_transition_to(next) {
            tracing::warn!(
                job_id = %id,
                from = %entry.phase,
                to = %next,
                "Ignoring illegal job phase transition"
            );
            return false;
        }

        entry.phase = next;
        true
    }

    /// `Queued → Dispatched`, recording which worker picked the job up.
    pub fn dispatch(&self, id: &JobId, worker_id: WorkerId) -> bool {
        let moved = self.transition(id, JobPhase::Dispatched);
        if moved && let Some(mut entry) = self.jobs.get_mut(id) {
            entry.worker_id = Some(worker_id);
        }
        moved
    }

    /// `AcquiringSlot → Executing`, recording the granted slot.
    pub fn begin_executing(&self, id: &JobId, slot_id: SlotId) -> bool {
        let moved = self.transition(id, JobPhase::Executing);
        if moved && let Some(mut entry) = self.jobs.get_mut(id) {
            entry.slot_id = Some(slot_id);
        }
        moved
    }

    /// Fire the job's cancellation token. Returns false if the job is not in flight.
    pub fn cancel(&self, id: &JobId) -> bool {
        match self.jobs.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(job_id = %id, phase = %entry.phase, "Job cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &JobId) -> Option<JobSnapshot> {
        self.jobs
            .remove(id)
            .map(|(id, entry)| Self::snapshot_of(id, &entry))
    }

    pub fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        self.jobs
            .get(id)
            .map(|entry| Self::snapshot_of(entry.key().clone(), entry.value()))
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn count_in(&self, phase: JobPhase) -> usize {
        self.jobs.iter().filter(|e| e.phase == phase).count()
    }

    /// Slots currently held by executing jobs.
    pub fn executing_slots(&self) -> Vec<SlotId> {
        self.jobs
            .iter()
            .filter(|e| e.phase == JobPhase::Executing)
            .filter_map(|e| e.slot_id)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs
            .iter()
            .map(|e| Self::snapshot_of(e.key().clone(), e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn snapshot_of(id: JobId, entry: &TrackedJob) -> JobSnapshot {
        JobSnapshot {
            id,
            phase: entry.phase,
            slot_id: entry.slot_id,
            worker_id: entry.worker_id,
            age: entry.accepted_at.elapsed(),
        }
    }
}
