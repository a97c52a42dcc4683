//! Job definitions and the lifecycle wrapper around handler execution.
//!
//! A job is defined once: identity fields, a default schedule, and an async
//! handler. There is no job class hierarchy — status tracking is composed
//! around the handler by [`run_with_tracking`], so job authors never touch
//! the execution tracker. Handlers must be safe to re-run: the queue
//! delivers at-least-once and will re-execute after transient failures.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use nudge_core::error::{NudgeError, Result};
use nudge_core::types::{OutboundMessage, ParseMode};
use serde::{Deserialize, Serialize};

use crate::persistence::SchedulerDb;
use crate::targets::JobTargets;

/// Boxed async job handler.
pub type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<JobResult>> + Send + Sync>;

/// A named, stateless description of schedulable work. Immutable once
/// registered. Collaborators a handler needs are captured in its closure at
/// construction time; everything per-run arrives through [`JobContext`].
#[derive(Clone)]
pub struct JobDefinition {
    /// Unique registry key.
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// Cron expression used when seeding a missing schedule record.
    pub default_schedule: String,
    pub default_timezone: String,
    /// Opaque config map seeded onto new schedule records.
    pub default_config: serde_json::Value,
    /// Whether boot-time seeding creates a schedule record for this job.
    pub seed_on_startup: bool,
    handler: JobHandler,
}

impl JobDefinition {
    pub fn new<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<JobResult>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            default_schedule: "0 9 * * *".to_string(),
            default_timezone: "UTC".to_string(),
            default_config: serde_json::json!({}),
            seed_on_startup: true,
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }

    pub fn display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_name.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn schedule(mut self, expression: &str, timezone: &str) -> Self {
        self.default_schedule = expression.to_string();
        self.default_timezone = timezone.to_string();
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.default_config = config;
        self
    }

    pub fn seed_on_startup(mut self, seed: bool) -> Self {
        self.seed_on_startup = seed;
        self
    }

    /// Invoke the handler. Errors propagate to the caller — marking the run
    /// failed is the lifecycle wrapper's job, not the definition's.
    pub async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        (self.handler)(ctx).await
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("default_schedule", &self.default_schedule)
            .field("default_timezone", &self.default_timezone)
            .field("seed_on_startup", &self.seed_on_startup)
            .finish()
    }
}

/// Everything one run receives: identity, config, and the resolved audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    /// Scheduled job record id.
    pub job_id: String,
    pub job_key: String,
    /// Execution record this run reports into.
    pub execution_id: i64,
    /// The job's timezone, for day-boundary logic inside handlers.
    pub timezone: String,
    pub config: serde_json::Value,
    pub targets: JobTargets,
    pub triggered_at: DateTime<Utc>,
}

/// What a handler returns. `users_affected` and `notifications.len()` are
/// allowed to diverge (a dry-run job affects users without notifying any).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub users_affected: i64,
    pub summary: String,
    /// Arbitrary structured diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Per-item failures that did not abort the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Handed verbatim to the notification dispatcher.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<JobNotification>,
}

impl JobResult {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            users_affected: 0,
            summary: summary.into(),
            details: None,
            errors: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(summary)
        }
    }

    pub fn users_affected(mut self, count: i64) -> Self {
        self.users_affected = count;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn notifications(mut self, notifications: Vec<JobNotification>) -> Self {
        self.notifications = notifications;
        self
    }
}

/// One message a job wants delivered. Ephemeral: lives only between job
/// completion and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    /// Recipient key in the messaging channel's namespace.
    pub recipient_id: String,
    pub text: String,
    #[serde(default)]
    pub parse_mode: ParseMode,
    #[serde(default)]
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
}

impl JobNotification {
    pub fn text(recipient_id: &str, text: &str) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            text: text.to_string(),
            parse_mode: ParseMode::default(),
            silent: false,
            reply_markup: None,
        }
    }

    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage {
            recipient_id: self.recipient_id.clone(),
            text: self.text.clone(),
            parse_mode: self.parse_mode,
            silent: self.silent,
            reply_markup: self.reply_markup.clone(),
        }
    }
}

/// Execute a job with status tracking composed around it, in fixed order:
///
/// 1. mark the execution record `running` — failure aborts the run before
///    any side effect and is recorded as `failed`;
/// 2. run the handler;
/// 3. on success, mark `success` and store summary/affected counts;
/// 4. on handler error (or a failed success-write), mark `failed` and
///    propagate the error so the queue's retry policy applies.
///
/// The tracker is always the last writer in each step.
pub async fn run_with_tracking(
    tracker: &SchedulerDb,
    definition: &JobDefinition,
    ctx: JobContext,
) -> Result<JobResult> {
    let execution_id = ctx.execution_id;

    if let Err(e) = tracker.mark_running(execution_id) {
        let msg = format!("before-execute: {e}");
        record_failure(tracker, execution_id, &msg);
        return Err(NudgeError::Job(msg));
    }

    match definition.execute(ctx).await {
        Ok(result) if result.success => {
            let metadata = result_metadata(&result);
            if let Err(e) =
                tracker.mark_succeeded(execution_id, &result.summary, result.users_affected, metadata)
            {
                let msg = format!("after-execute: {e}");
                record_failure(tracker, execution_id, &msg);
                return Err(NudgeError::Job(msg));
            }
            Ok(result)
        }
        Ok(result) => {
            // Handler reported failure without throwing.
            let error = if result.errors.is_empty() {
                result.summary.clone()
            } else {
                result.errors.join("; ")
            };
            record_failure(tracker, execution_id, &error);
            Err(NudgeError::Job(error))
        }
        Err(e) => {
            record_failure(tracker, execution_id, &e.to_string());
            Err(e)
        }
    }
}

fn record_failure(tracker: &SchedulerDb, execution_id: i64, error: &str) {
    if let Err(e) = tracker.mark_failed(execution_id, error) {
        tracing::warn!("Could not record failure for execution {execution_id}: {e}");
    }
}

fn result_metadata(result: &JobResult) -> Option<serde_json::Value> {
    if result.details.is_none() && result.errors.is_empty() {
        return None;
    }
    let mut metadata = serde_json::Map::new();
    if let Some(details) = &result.details {
        metadata.insert("details".into(), details.clone());
    }
    if !result.errors.is_empty() {
        metadata.insert("errors".into(), serde_json::json!(result.errors));
    }
    Some(serde_json::Value::Object(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ExecutionStatus;

    fn test_db(name: &str) -> SchedulerDb {
        let dir = std::env::temp_dir().join(format!("nudge-jobs-{name}"));
        std::fs::create_dir_all(&dir).ok();
        SchedulerDb::open(&dir.join("test.db")).unwrap()
    }

    fn context(execution_id: i64) -> JobContext {
        JobContext {
            job_id: "job-1".into(),
            job_key: "test".into(),
            execution_id,
            timezone: "UTC".into(),
            config: serde_json::json!({}),
            targets: JobTargets::default(),
            triggered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_success_marks_record() {
        let db = test_db("success");
        let exec_id = db.create_execution("job-1", None).unwrap();

        let def = JobDefinition::new("noop", |_ctx| async {
            Ok(JobResult::ok("done").users_affected(3))
        });
        let result = run_with_tracking(&db, &def, context(exec_id)).await.unwrap();
        assert!(result.success);

        let exec = db.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.users_affected, 3);
        assert_eq!(exec.result.as_deref(), Some("done"));
        assert!(exec.completed_at.is_some());
        assert!(exec.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_handler_error_marks_failed_and_rethrows() {
        let db = test_db("failure");
        let exec_id = db.create_execution("job-1", None).unwrap();

        let def = JobDefinition::new("boom", |_ctx| async {
            Err(NudgeError::Job("recommendation lookup died".into()))
        });
        let err = run_with_tracking(&db, &def, context(exec_id))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("recommendation lookup died"));

        let exec = db.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(
            exec.error
                .as_deref()
                .unwrap()
                .contains("recommendation lookup died")
        );
    }

    #[tokio::test]
    async fn test_unsuccessful_result_is_recorded_failed() {
        let db = test_db("soft-fail");
        let exec_id = db.create_execution("job-1", None).unwrap();

        let def = JobDefinition::new("soft", |_ctx| async {
            Ok(JobResult::failed("nothing usable").errors(vec!["u1: no data".into()]))
        });
        assert!(run_with_tracking(&db, &def, context(exec_id)).await.is_err());

        let exec = db.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("u1: no data"));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_success() {
        let db = test_db("partial");
        let exec_id = db.create_execution("job-1", None).unwrap();

        let def = JobDefinition::new("partial", |_ctx| async {
            Ok(JobResult::ok("2 of 3 notified")
                .users_affected(2)
                .errors(vec!["u3: lookup failed".into()]))
        });
        let result = run_with_tracking(&db, &def, context(exec_id)).await.unwrap();
        assert!(result.success);

        let exec = db.get_execution(exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        let metadata = exec.metadata.unwrap();
        assert_eq!(metadata["errors"][0], "u3: lookup failed");
    }
}
