//! Job results delivered through the per-job result conduit.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::JobId;
use crate::permit::SlotId;
use crate::worker::WorkerId;

/// Outcome tag, used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Success,
    Busy,
    Error,
    Cancelled,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success {
        output: String,
        slot_id: SlotId,
        worker_id: WorkerId,
        elapsed: Duration,
    },
    /// No slot within the acquisition timeout. The job body never ran.
    Busy { reason: String },
    Error { reason: String },
    Cancelled { reason: String },
}

/// Final, immutable result of one job.
#[derive(Debug, Clone)]
pub struct JobResult {
    job_id: JobId,
    outcome: JobOutcome,
    completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(
        job_id: JobId,
        output: String,
        slot_id: SlotId,
        worker_id: WorkerId,
        elapsed: Duration,
    ) -> Self {
        Self::new(
            job_id,
            JobOutcome::Success {
                output,
                slot_id,
                worker_id,
                elapsed,
            },
        )
    }

    pub fn busy(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::new(
            job_id,
            JobOutcome::Busy {
                reason: reason.into(),
            },
        )
    }

    pub fn error(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::new(
            job_id,
            JobOutcome::Error {
                reason: reason.into(),
            },
        )
    }

    pub fn cancelled(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::new(
            job_id,
            JobOutcome::Cancelled {
                reason: reason.into(),
            },
        )
    }

    fn new(job_id: JobId, outcome: JobOutcome) -> Self {
        Self {
            job_id,
            outcome,
            completed_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn outcome(&self) -> &JobOutcome {
        &self.outcome
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn kind(&self) -> OutcomeKind {
        match self.outcome {
            JobOutcome::Success { .. } => OutcomeKind::Success,
            JobOutcome::Busy { .. } => OutcomeKind::Busy,
            JobOutcome::Error { .. } => OutcomeKind::Error,
            JobOutcome::Cancelled { .. } => OutcomeKind::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind() == OutcomeKind::Success
    }

    /// Busy and cancelled outcomes are not hard failures; callers may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), OutcomeKind::Busy | OutcomeKind::Cancelled)
    }

    pub fn slot_id(&self) -> Option<SlotId> {
        match self.outcome {
            JobOutcome::Success { slot_id, .. } => Some(slot_id),
            _ => None,
        }
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        match self.outcome {
            JobOutcome::Success { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Success { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.outcome {
            JobOutcome::Success { elapsed, .. } => elapsed,
            _ => Duration::ZERO,
        }
    }

    /// Human-readable reason for non-success outcomes.
    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Success { .. } => None,
            JobOutcome::Busy { reason }
            | JobOutcome::Error { reason }
            | JobOutcome::Cancelled { reason } => Some(reason),
        }
    }

    pub fn to_response(&self) -> serde_json::Value {
        let mut response = serde_json::json!({
            "job_id": self.job_id,
            "status": self.kind(),
            "completed_at": self.completed_at,
        });

        match &self.outcome {
            JobOutcome::Success {
                output,
                slot_id,
                worker_id,
                elapsed,
            } => {
                response["result"] = serde_json::json!(output);
                response["message"] = serde_json::json!(format!(
                    "Completed by worker {} on slot {}",
                    worker_id, slot_id
                ));
                response["slot_id"] = serde_json::json!(slot_id);
                response["worker_id"] = serde_json::json!(worker_id);
                response["processing_time_ms"] = serde_json::json!(elapsed.as_secs_f64() * 1000.0);
            }
            JobOutcome::Busy { reason }
            | JobOutcome::Error { reason }
            | JobOutcome::Cancelled { reason } => {
                response["error"] = serde_json::json!(reason);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_carries_slot_worker_and_elapsed() {
        let result = JobResult::success(
            JobId::from("job-1"),
            "done".to_string(),
            SlotId::new(2),
            WorkerId::new(1),
            Duration::from_millis(40),
        );

        assert!(result.is_success());
        assert!(!result.is_retryable());
        assert_eq!(result.slot_id(), Some(SlotId::new(2)));
        assert_eq!(result.worker_id(), Some(WorkerId::new(1)));
        assert_eq!(result.output(), Some("done"));
        assert_eq!(result.elapsed(), Duration::from_millis(40));
        assert_eq!(result.reason(), None);
    }

    #[test]
    fn busy_and_cancelled_are_retryable_error_is_not() {
        let busy = JobResult::busy(JobId::from("a"), "no slots");
        let cancelled = JobResult::cancelled(JobId::from("b"), "client went away");
        let error = JobResult::error(JobId::from("c"), "boom");

        assert_eq!(busy.kind(), OutcomeKind::Busy);
        assert!(busy.is_retryable());
        assert_eq!(cancelled.kind(), OutcomeKind::Cancelled);
        assert!(cancelled.is_retryable());
        assert_eq!(error.kind(), OutcomeKind::Error);
        assert!(!error.is_retryable());

        assert_eq!(error.reason(), Some("boom"));
        assert_eq!(busy.slot_id(), None);
        assert_eq!(cancelled.elapsed(), Duration::ZERO);
    }

    #[test]
    fn outcome_kind_serializes_lowercase() {
        insta::assert_json_snapshot!(
            [
                OutcomeKind::Success,
                OutcomeKind::Busy,
                OutcomeKind::Error,
                OutcomeKind::Cancelled,
            ],
            @r#"
        [
          "success",
          "busy",
          "error",
          "cancelled"
        ]
        "#
        );
    }

    #[test]
    fn response_shapes() {
        let ok = JobResult::success(
            JobId::from("job-ok"),
            "payload".to_string(),
            SlotId::new(0),
            WorkerId::new(3),
            Duration::from_millis(5),
        )
        .to_response();
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["slot_id"], 0);
        assert_eq!(ok["worker_id"], 3);
        assert_eq!(ok["result"], "payload");
        assert_eq!(ok["message"], "Completed by worker 3 on slot 0");
        assert!(ok.get("error").is_none());

        let busy = JobResult::busy(JobId::from("job-busy"), "No slots available").to_response();
        assert_eq!(busy["job_id"], "job-busy");
        assert_eq!(busy["status"], "busy");
        assert_eq!(busy["error"], "No slots available");
        assert!(busy.get("slot_id").is_none());
    }
}
