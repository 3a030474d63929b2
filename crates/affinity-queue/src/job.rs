//! Job identity and lifecycle phases.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

/// Unique job identifier. Generated as a UUIDv4 when the submitter gives none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work that must run while holding exactly one slot.
///
/// Builder methods consume the job, so once it has been handed to
/// [`ProcessingService::submit`](crate::ProcessingService::submit) it can no
/// longer change.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    data: String,
    iterations: u32,
    submitted_at: DateTime<Utc>,
    priority: Option<String>,
    client_id: Option<String>,
}

impl Job {
    pub const DEFAULT_ITERATIONS: u32 = 10;

    pub fn new(data: impl Into<String>, iterations: u32) -> Self {
        Self {
            id: JobId::new(),
            data: data.into(),
            iterations,
            submitted_at: Utc::now(),
            priority: None,
            client_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// Carried for observability only; never used for ordering.
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn priority(&self) -> Option<&str> {
        self.priority.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Per-job execution state machine.
///
/// `Queued → Dispatched → AcquiringSlot → {Executing | DeniedBusy | CancelledWhileAcquiring}`
/// and from `Executing` to one of `{Succeeded | Failed | CancelledWhileExecuting}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Queued,
    Dispatched,
    AcquiringSlot,
    Executing,
    DeniedBusy,
    CancelledWhileAcquiring,
    Succeeded,
    Failed,
    CancelledWhileExecuting,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DeniedBusy
                | Self::CancelledWhileAcquiring
                | Self::Succeeded
                | Self::Failed
                | Self::CancelledWhileExecuting
        )
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Queued, Dispatched)
                | (Dispatched, AcquiringSlot)
                | (AcquiringSlot, Executing)
                | (AcquiringSlot, DeniedBusy)
                | (AcquiringSlot, CancelledWhileAcquiring)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Executing, CancelledWhileExecuting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::AcquiringSlot => "acquiring_slot",
            Self::Executing => "executing",
            Self::DeniedBusy => "denied_busy",
            Self::CancelledWhileAcquiring => "cancelled_while_acquiring",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::CancelledWhileExecuting => "cancelled_while_executing",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
