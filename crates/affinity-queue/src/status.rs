//! On-demand status snapshot of the slot pool, queue and workers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::permit::SlotInfo;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub total_slots: usize,
    pub available_slots: usize,
    pub busy_slots: usize,
    pub queued_jobs: usize,
    /// Jobs accepted but not yet answered, in any phase.
    pub active_jobs: usize,
    pub acquiring_jobs: usize,
    pub active_workers: usize,
    pub utilization_percentage: f64,
    pub is_running: bool,
    pub status_time: DateTime<Utc>,
    pub metrics: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<SlotInfo>,
}

impl QueueStatus {
    /// Fill `metrics` from the numeric fields.
    pub fn with_metrics(mut self) -> Self {
        self.metrics = BTreeMap::from([
            (
                "UtilizationPercentage".to_string(),
                format!("{:.2}", self.utilization_percentage),
            ),
            ("QueueLength".to_string(), self.queued_jobs.to_string()),
            ("TotalProcessors".to_string(), self.total_slots.to_string()),
            ("ActiveJobs".to_string(), self.active_jobs.to_string()),
            ("AcquiringJobs".to_string(), self.acquiring_jobs.to_string()),
        ]);
        self
    }
}
