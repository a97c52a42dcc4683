//! Persisted records — the core data model for schedules and run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One schedule assignment of a job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique record id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Stable unique key for this schedule (seeded from the definition name).
    pub job_key: String,
    /// Which registered definition runs.
    pub job_type: String,
    /// Cron expression, mutable through the admin surface.
    pub schedule: String,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
    pub enabled: bool,
    /// Opaque per-job configuration; each job defines its own typed view.
    pub config: serde_json::Value,
    /// Persisted targeting lists, resolved to concrete users at dispatch.
    pub targets: TargetSpec,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Earliest future occurrence of `schedule` in `timezone`, or None when
    /// the expression is unschedulable.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Check if this job should be dispatched now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| now >= next)
    }
}

/// Targeting lists persisted on a scheduled job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub include_user_ids: Vec<String>,
    #[serde(default)]
    pub exclude_user_ids: Vec<String>,
    #[serde(default)]
    pub pack_ids: Vec<String>,
}

/// Run status. Transitions are monotonic: pending → running → success|failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

/// One triggered run of a scheduled job. Append-mostly: immutable once
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Human-readable run summary, set at the terminal transition.
    pub result: Option<String>,
    pub error: Option<String>,
    pub users_affected: i64,
    pub metadata: Option<serde_json::Value>,
}
