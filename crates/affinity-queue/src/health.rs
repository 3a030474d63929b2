//! Health classification derived from a status snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::QueueStatus;

/// Backlog above which a fully busy pool is reported degraded.
pub const DEGRADED_QUEUE_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
    pub data: BTreeMap<String, serde_json::Value>,
}

impl HealthReport {
    pub fn from_status(status: &QueueStatus) -> Self {
        let (health, description) =
            if status.available_slots == 0 && status.queued_jobs > DEGRADED_QUEUE_THRESHOLD {
                (
                    HealthStatus::Degraded,
                    "All processors busy and queue is growing",
                )
            } else if status.available_slots > 0 {
                (HealthStatus::Healthy, "Service is healthy")
            } else {
                (HealthStatus::Healthy, "Service is operational")
            };

        let data = BTreeMap::from([
            (
                "available_processors".to_string(),
                serde_json::json!(status.available_slots),
            ),
            (
                "total_processors".to_string(),
                serde_json::json!(status.total_slots),
            ),
            (
                "queued_requests".to_string(),
                serde_json::json!(status.queued_jobs),
            ),
            (
                "utilization_percentage".to_string(),
                serde_json::json!(status.utilization_percentage),
            ),
        ]);

        Self {
            status: health,
            description: description.to_string(),
            data,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
