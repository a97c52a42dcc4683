//! Scheduler engine — the sweep loop that turns due schedule records into
//! queued runs.
//!
//! Per record the life of a tick is: due check → audience resolution →
//! pending execution record → enqueue → recompute next run. The next run is
//! recomputed at dispatch, not at completion, so a slow run can never cause
//! a double fire. Workers consume the queue and report through the
//! execution tracker; notifications produced by a run go to the
//! caller-supplied sink, decoupling delivery from scheduling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nudge_core::config::{NudgeConfig, QueueConfig, SchedulerConfig};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::Membership;
use serde::Serialize;

use crate::jobs::{JobContext, JobNotification, run_with_tracking};
use crate::persistence::SchedulerDb;
use crate::queue::{ClaimedRun, DurableQueue, QueueDepth, QueuedRun, RunExecutor, WorkerPool,
    start_workers};
use crate::registry::JobRegistry;
use crate::schedule;
use crate::targets::resolve_targets;

/// Receives the notifications a run produced, after the run is recorded.
pub type NotificationSink = Arc<dyn Fn(Vec<JobNotification>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Health snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub active: bool,
    pub queue_ready: bool,
    pub enabled_jobs: i64,
    pub queue: QueueDepth,
}

/// The scheduler. Constructed once at process start with its collaborators
/// injected; no global state.
pub struct SchedulerEngine {
    db: Arc<SchedulerDb>,
    registry: Arc<JobRegistry>,
    membership: Arc<dyn Membership>,
    queue: RwLock<Option<Arc<DurableQueue>>>,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    active: AtomicBool,
    tick_count: AtomicU64,
    scheduler_config: SchedulerConfig,
    queue_config: QueueConfig,
    production: bool,
    data_dir: PathBuf,
}

impl SchedulerEngine {
    pub fn new(
        db: Arc<SchedulerDb>,
        registry: Arc<JobRegistry>,
        membership: Arc<dyn Membership>,
        config: &NudgeConfig,
    ) -> Self {
        Self {
            db,
            registry,
            membership,
            queue: RwLock::new(None),
            workers: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
            scheduler_config: config.scheduler.clone(),
            queue_config: config.queue.clone(),
            production: config.is_production(),
            data_dir: PathBuf::from(&config.data_dir),
        }
    }

    /// Seed default schedules, repair boot-time state, open the queue, and
    /// start the worker pool. In production an unavailable queue is fatal;
    /// elsewhere the engine logs the error and stays disabled so the host
    /// process can keep serving everything else.
    pub async fn initialize(&self, sink: NotificationSink) -> Result<()> {
        for definition in self.registry.seed_defaults() {
            if let Err(e) = self.db.seed_default(&definition) {
                tracing::error!("Could not seed schedule for '{}': {e}", definition.name);
            }
        }

        let now = Utc::now();
        let repaired = self.db.recompute_stale_next_runs(now)?;
        if repaired > 0 {
            tracing::info!("Recomputed next run for {repaired} schedule(s)");
        }
        self.db.reap_stale_running(now - self.stale_cutoff())?;

        let queue = match DurableQueue::open(self.queue_config.clone(), &self.data_dir) {
            Ok(queue) => Arc::new(queue),
            Err(e) if self.production => {
                tracing::error!("Durable queue unavailable in production: {e}");
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Durable queue unavailable, scheduler disabled: {e}");
                return Ok(());
            }
        };
        queue.requeue_abandoned()?;

        let executor = make_executor(self.db.clone(), self.registry.clone(), sink);
        let pool = start_workers(queue.clone(), executor);
        *self.workers.lock().await = Some(pool);
        if let Ok(mut slot) = self.queue.write() {
            *slot = Some(queue);
        }
        self.active.store(true, Ordering::SeqCst);
        tracing::info!(
            "⏰ Scheduler initialized ({} registered job(s))",
            self.registry.count()
        );
        Ok(())
    }

    /// One sweep over due records, evaluated at the current wall clock.
    pub async fn tick(&self) -> Result<Vec<String>> {
        self.tick_at(Utc::now()).await
    }

    /// Sweep with an explicit `now` — the time the due decision and the
    /// next-run recomputation are both evaluated against.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        if !self.is_active() {
            return Ok(Vec::new());
        }
        let Some(queue) = self.queue() else {
            return Ok(Vec::new());
        };

        let mut dispatched = Vec::new();
        for job in self.db.due_jobs(now)? {
            // Audience resolution precedes the execution record so the
            // resolved user set is attributable to exactly this run. On
            // failure the record keeps its next_run_at and is retried on the
            // following sweep.
            let targets = match resolve_targets(&job.targets, self.membership.as_ref()).await {
                Ok(targets) => targets,
                Err(e) => {
                    tracing::warn!(
                        "Audience resolution for '{}' failed, retrying next sweep: {e}",
                        job.job_key
                    );
                    continue;
                }
            };

            let execution_id = self.db.create_execution(
                &job.id,
                Some(&serde_json::json!({"targeted": targets.final_user_ids.len()})),
            )?;
            let run = QueuedRun {
                job_name: job.job_type.clone(),
                job_id: job.id.clone(),
                job_key: job.job_key.clone(),
                timezone: job.timezone.clone(),
                execution_id,
                config: job.config.clone(),
                targets,
            };
            queue.enqueue(&run)?;

            let next = schedule::next_occurrence(&job.schedule, &job.timezone, now);
            self.db.record_dispatch(&job.id, now, next)?;

            tracing::info!(
                "🔔 Dispatched '{}' (execution {execution_id}, {} recipient(s))",
                job.job_key,
                run.targets.final_user_ids.len()
            );
            dispatched.push(job.job_key.clone());
        }

        let ticks = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.scheduler_config.reconcile_every_ticks;
        if every > 0 && ticks % every == 0 {
            self.db.reap_stale_running(now - self.stale_cutoff())?;
        }

        Ok(dispatched)
    }

    fn stale_cutoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue_config.job_timeout_secs as i64 + 60)
    }

    fn queue(&self) -> Option<Arc<DurableQueue>> {
        self.queue.read().ok().and_then(|q| q.clone())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the underlying queue answers queries.
    pub fn is_ready(&self) -> bool {
        self.queue().map(|q| q.is_ready()).unwrap_or(false)
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        let queue = self.queue();
        Ok(SchedulerStatus {
            active: self.is_active(),
            queue_ready: queue.as_ref().map(|q| q.is_ready()).unwrap_or(false),
            enabled_jobs: self.db.count_enabled()?,
            queue: match &queue {
                Some(q) => q.depth()?,
                None => QueueDepth::default(),
            },
        })
    }

    /// Stop accepting ticks and drain in-flight work. Callers needing a hard
    /// deadline should wrap this in their own timeout.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        tracing::info!("Scheduler shutting down, draining workers");
        if let Some(pool) = self.workers.lock().await.take() {
            pool.shutdown().await;
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Build the worker-side callback: look up the definition, run it with
/// status tracking, hand any notifications to the sink. Retries get a fresh
/// execution record (terminal records never regress), linked to the original
/// through metadata.
fn make_executor(
    db: Arc<SchedulerDb>,
    registry: Arc<JobRegistry>,
    sink: NotificationSink,
) -> RunExecutor {
    Arc::new(move |claimed: ClaimedRun| {
        let db = db.clone();
        let registry = registry.clone();
        let sink = sink.clone();
        Box::pin(async move {
            let run = claimed.run;
            let execution_id = if claimed.attempt <= 1 {
                run.execution_id
            } else {
                db.create_execution(
                    &run.job_id,
                    Some(&serde_json::json!({
                        "attempt": claimed.attempt,
                        "retry_of": run.execution_id,
                    })),
                )?
            };

            let Some(definition) = registry.get(&run.job_name) else {
                let msg = format!("Unknown job type: {}", run.job_name);
                if let Err(e) = db.mark_failed(execution_id, &msg) {
                    tracing::warn!("Could not record failure: {e}");
                }
                return Err(NudgeError::Job(msg));
            };

            let ctx = JobContext {
                job_id: run.job_id,
                job_key: run.job_key,
                execution_id,
                timezone: run.timezone,
                config: run.config,
                targets: run.targets,
                triggered_at: Utc::now(),
            };
            let result = run_with_tracking(&db, &definition, ctx).await?;

            if !result.notifications.is_empty() {
                sink(result.notifications).await;
            }
            Ok(())
        })
    })
}

/// Run the sweep loop until the engine is shut down.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>) {
    let tick_secs = engine.scheduler_config.tick_interval_secs.max(1);
    tracing::info!("⏰ Scheduler loop started (sweep every {tick_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));

    loop {
        interval.tick().await;
        if !engine.is_active() {
            tracing::info!("Scheduler loop exiting");
            break;
        }
        match engine.tick().await {
            Ok(dispatched) if !dispatched.is_empty() => {
                tracing::debug!("Sweep dispatched: {}", dispatched.join(", "));
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobDefinition, JobResult};
    use crate::records::{ExecutionStatus, ScheduledJob, TargetSpec};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    struct NoPacks;

    #[async_trait]
    impl Membership for NoPacks {
        async fn members_of(&self, _pack_ids: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn collecting_sink() -> (NotificationSink, Arc<Mutex<Vec<JobNotification>>>) {
        let collected: Arc<Mutex<Vec<JobNotification>>> = Arc::new(Mutex::new(Vec::new()));
        let store = collected.clone();
        let sink: NotificationSink = Arc::new(move |notifications| {
            let store = store.clone();
            Box::pin(async move {
                store.lock().unwrap().extend(notifications);
            })
        });
        (sink, collected)
    }

    fn test_config(name: &str) -> NudgeConfig {
        let dir = std::env::temp_dir().join(format!("nudge-engine-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let mut config = NudgeConfig::default();
        config.data_dir = dir.to_string_lossy().into_owned();
        config.queue.poll_interval_ms = 10;
        config.queue.jitter_ms = 0;
        config.queue.backoff_base_secs = 0;
        config
    }

    fn due_record(job_type: &str, include: &[&str]) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: job_type.into(),
            job_key: job_type.into(),
            job_type: job_type.into(),
            schedule: "0 22 * * *".into(),
            timezone: "Asia/Tehran".into(),
            enabled: true,
            config: serde_json::json!({}),
            targets: TargetSpec {
                include_user_ids: include.iter().map(|s| s.to_string()).collect(),
                ..TargetSpec::default()
            },
            last_run_at: None,
            next_run_at: Some(now - Duration::minutes(1)),
            created_at: now,
            updated_at: now,
        }
    }

    async fn engine_with(
        name: &str,
        registry: JobRegistry,
        sink: NotificationSink,
    ) -> (Arc<SchedulerEngine>, Arc<SchedulerDb>) {
        let config = test_config(name);
        let db = Arc::new(
            SchedulerDb::open(&PathBuf::from(&config.data_dir).join("scheduler.db")).unwrap(),
        );
        let engine = Arc::new(SchedulerEngine::new(
            db.clone(),
            Arc::new(registry),
            Arc::new(NoPacks),
            &config,
        ));
        engine.initialize(sink).await.unwrap();
        (engine, db)
    }

    #[tokio::test]
    async fn test_dispatch_executes_job_and_delivers_notifications() {
        let mut registry = JobRegistry::new();
        registry.register(
            JobDefinition::new("greeter", |ctx: JobContext| async move {
                let notifications = ctx
                    .targets
                    .final_user_ids
                    .iter()
                    .map(|uid| JobNotification::text(uid, "hello"))
                    .collect::<Vec<_>>();
                let count = notifications.len() as i64;
                Ok(JobResult::ok("greeted everyone")
                    .users_affected(count)
                    .notifications(notifications))
            })
            .seed_on_startup(false),
        );
        let (sink, collected) = collecting_sink();
        let (engine, db) = engine_with("greet", registry, sink).await;

        let record = due_record("greeter", &["u1", "u2"]);
        db.insert_job(&record).unwrap();

        let now = Utc::now();
        let dispatched = engine.tick_at(now).await.unwrap();
        assert_eq!(dispatched, vec!["greeter"]);

        // Next run was recomputed strictly past `now` at dispatch time
        let reloaded = db.get_job(&record.id).unwrap().unwrap();
        assert!(reloaded.next_run_at.unwrap() > now);
        assert_eq!(reloaded.last_run_at.unwrap().timestamp_millis(), now.timestamp_millis());

        // A second sweep at the same instant must not double-fire
        assert!(engine.tick_at(now).await.unwrap().is_empty());

        // Let a worker pick it up
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let executions = db.executions_for_job(&record.id, 10).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(executions[0].users_affected, 2);

        let delivered = collected.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].recipient_id, "u1");
        assert_eq!(delivered[1].recipient_id, "u2");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_job_is_retried_per_queue_policy() {
        let mut registry = JobRegistry::new();
        registry.register(
            JobDefinition::new("always-fails", |_ctx| async {
                Err(NudgeError::Job("synthetic failure".into()))
            })
            .seed_on_startup(false),
        );
        let (sink, collected) = collecting_sink();
        let (engine, db) = engine_with("retry", registry, sink).await;

        let record = due_record("always-fails", &["u1"]);
        db.insert_job(&record).unwrap();
        engine.tick().await.unwrap();

        // Backoff base is 0 in the test config: all 3 attempts drain quickly
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        engine.shutdown().await;

        let executions = db.executions_for_job(&record.id, 10).unwrap();
        assert_eq!(executions.len(), 3, "one execution record per attempt");
        for execution in &executions {
            assert_eq!(execution.status, ExecutionStatus::Failed);
            assert!(execution.error.as_deref().unwrap().contains("synthetic failure"));
        }
        // Retry records link back to the original
        let retry_meta = executions[0].metadata.as_ref().unwrap();
        assert_eq!(retry_meta["attempt"], 3);

        assert!(collected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_job_never_dispatches() {
        let registry = JobRegistry::new();
        let (sink, _) = collecting_sink();
        let (engine, db) = engine_with("disabled", registry, sink).await;

        let mut record = due_record("ghost", &["u1"]);
        record.enabled = false;
        db.insert_job(&record).unwrap();

        assert!(engine.tick().await.unwrap().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_seeding_creates_missing_records_once() {
        let mut registry = JobRegistry::new();
        registry.register(
            JobDefinition::new("seeded-job", |_ctx| async { Ok(JobResult::ok("noop")) })
                .schedule("0 9 * * *", "UTC"),
        );
        let (sink, _) = collecting_sink();
        let (engine, db) = engine_with("seed", registry, sink).await;

        let record = db.get_job_by_key("seeded-job").unwrap().unwrap();
        assert!(record.enabled);
        assert!(record.next_run_at.unwrap() > Utc::now());
        assert_eq!(db.load_jobs().unwrap().len(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let registry = JobRegistry::new();
        let (sink, _) = collecting_sink();
        let (engine, _db) = engine_with("status", registry, sink).await;

        let status = engine.status().unwrap();
        assert!(status.active);
        assert!(status.queue_ready);
        assert_eq!(status.queue.queued, 0);

        engine.shutdown().await;
        assert!(!engine.is_active());
    }
}
