//! Durable queue — persistent job broker with retry/backoff and retention.
//!
//! SQLite-backed, no external broker: a queued run survives process restarts
//! and is claimed by one of a bounded pool of workers. Delivery is
//! at-least-once — a run that fails transiently (or whose process dies
//! mid-flight) is re-attempted, so handlers must tolerate re-execution.
//! The worker pool size is the concurrency boundary for job execution.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use nudge_core::config::QueueConfig;
use nudge_core::error::{NudgeError, Result};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::targets::JobTargets;

/// Payload for one triggered run, serialized into the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRun {
    /// Definition name to execute.
    pub job_name: String,
    /// Scheduled job record id.
    pub job_id: String,
    pub job_key: String,
    pub timezone: String,
    /// Execution record created at dispatch time.
    pub execution_id: i64,
    pub config: serde_json::Value,
    pub targets: JobTargets,
}

/// A run a worker has claimed, with its attempt number (1-based).
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub id: i64,
    pub attempt: u32,
    pub run: QueuedRun,
}

/// Row counts per queue state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepth {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// The persistent queue. One logical namespace per deployment lets several
/// share a file.
pub struct DurableQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
}

impl DurableQueue {
    /// Open or create the queue database.
    pub fn open(config: QueueConfig, data_dir: &Path) -> Result<Self> {
        let path = if config.path.is_empty() {
            data_dir.join("queue.db")
        } else {
            PathBuf::from(&config.path)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| NudgeError::Queue(format!("Queue open: {e}")))?;
        let queue = Self {
            conn: Mutex::new(conn),
            config,
        };
        queue.migrate()?;
        Ok(queue)
    }

    /// In-memory queue, for tests.
    pub fn open_in_memory(config: QueueConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NudgeError::Queue(format!("Queue open: {e}")))?;
        let queue = Self {
            conn: Mutex::new(conn),
            config,
        };
        queue.migrate()?;
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NudgeError::Queue("queue lock poisoned".into()))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                job_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff_base_secs INTEGER NOT NULL,
                run_at INTEGER NOT NULL,
                locked_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_queue_ready
                ON queue_jobs(namespace, status, run_at);
         ",
            )
            .map_err(|e| NudgeError::Queue(format!("Queue migration: {e}")))?;
        Ok(())
    }

    /// Enqueue a run with the configured retry policy. Ready immediately.
    pub fn enqueue(&self, run: &QueuedRun) -> Result<i64> {
        let payload = serde_json::to_string(run)
            .map_err(|e| NudgeError::Queue(format!("Serialize run: {e}")))?;
        let now = Utc::now().timestamp_millis();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queue_jobs
             (namespace, job_name, payload, max_attempts, backoff_base_secs, run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![
                self.config.namespace,
                run.job_name,
                payload,
                self.config.max_attempts,
                self.config.backoff_base_secs,
                now,
            ],
        )
        .map_err(|e| NudgeError::Queue(format!("Enqueue: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest ready run, if any, bumping its attempt counter.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ClaimedRun>> {
        let conn = self.conn()?;
        let row: Option<(i64, String, u32)> = conn
            .query_row(
                "SELECT id, payload, attempts FROM queue_jobs
                 WHERE namespace = ?1 AND status = 'queued' AND run_at <= ?2
                 ORDER BY id LIMIT 1",
                rusqlite::params![self.config.namespace, now.timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| NudgeError::Queue(format!("Claim: {e}")))?;

        let Some((id, payload, attempts)) = row else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE queue_jobs SET status = 'active', attempts = ?1, locked_at = ?2 WHERE id = ?3",
            rusqlite::params![attempts + 1, now.timestamp_millis(), id],
        )
        .map_err(|e| NudgeError::Queue(format!("Claim lock: {e}")))?;

        let run: QueuedRun = serde_json::from_str(&payload)
            .map_err(|e| NudgeError::Queue(format!("Corrupt payload for queue job {id}: {e}")))?;
        Ok(Some(ClaimedRun {
            id,
            attempt: attempts + 1,
            run,
        }))
    }

    /// Mark a claimed run completed.
    pub fn complete(&self, id: i64) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE queue_jobs SET status = 'completed', completed_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().timestamp_millis(), id],
            )
            .map_err(|e| NudgeError::Queue(format!("Complete: {e}")))?;
        Ok(())
    }

    /// Report a failed attempt. Reschedules with exponential backoff
    /// (`backoff_base * 2^(attempt-1)`) until attempts are exhausted, then
    /// parks the row as `failed` for inspection.
    pub fn fail(&self, id: i64, attempt: u32, error: &str) -> Result<()> {
        let conn = self.conn()?;
        let (max_attempts, backoff_base): (u32, u64) = conn
            .query_row(
                "SELECT max_attempts, backoff_base_secs FROM queue_jobs WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| NudgeError::Queue(format!("Fail lookup: {e}")))?;

        let now = Utc::now();
        if attempt < max_attempts {
            let delay_secs = backoff_base.saturating_mul(1 << (attempt.saturating_sub(1)));
            let next_try = now + chrono::Duration::seconds(delay_secs as i64);
            conn.execute(
                "UPDATE queue_jobs
                 SET status = 'queued', run_at = ?1, last_error = ?2, locked_at = NULL
                 WHERE id = ?3",
                rusqlite::params![next_try.timestamp_millis(), error, id],
            )
            .map_err(|e| NudgeError::Queue(format!("Requeue: {e}")))?;
            tracing::warn!(
                "Queue job {id} failed (attempt {attempt}/{max_attempts}), retrying in {delay_secs}s: {error}"
            );
        } else {
            conn.execute(
                "UPDATE queue_jobs
                 SET status = 'failed', last_error = ?1, completed_at = ?2
                 WHERE id = ?3",
                rusqlite::params![error, now.timestamp_millis(), id],
            )
            .map_err(|e| NudgeError::Queue(format!("Park failed: {e}")))?;
            tracing::error!("Queue job {id} failed permanently after {attempt} attempt(s): {error}");
        }
        Ok(())
    }

    /// Return crash-orphaned `active` rows to the queue (boot-time repair).
    pub fn requeue_abandoned(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let requeued = self
            .conn()?
            .execute(
                "UPDATE queue_jobs
                 SET status = 'queued', run_at = ?1, locked_at = NULL
                 WHERE namespace = ?2 AND status = 'active'",
                rusqlite::params![now, self.config.namespace],
            )
            .map_err(|e| NudgeError::Queue(format!("Requeue abandoned: {e}")))?;
        if requeued > 0 {
            tracing::warn!("Requeued {requeued} abandoned queue job(s) from a previous run");
        }
        Ok(requeued)
    }

    /// Drop completed/failed rows beyond the configured retention counts.
    pub fn prune(&self) -> Result<()> {
        let conn = self.conn()?;
        for (status, keep) in [
            ("completed", self.config.keep_completed),
            ("failed", self.config.keep_failed),
        ] {
            conn.execute(
                "DELETE FROM queue_jobs
                 WHERE namespace = ?1 AND status = ?2 AND id NOT IN (
                     SELECT id FROM queue_jobs
                     WHERE namespace = ?1 AND status = ?2
                     ORDER BY id DESC LIMIT ?3
                 )",
                rusqlite::params![self.config.namespace, status, keep as i64],
            )
            .map_err(|e| NudgeError::Queue(format!("Prune: {e}")))?;
        }
        Ok(())
    }

    /// Health probe: the backing store answers queries.
    pub fn is_ready(&self) -> bool {
        self.conn()
            .and_then(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(|e| NudgeError::Queue(e.to_string()))
            })
            .is_ok()
    }

    /// Row counts per state, for the status snapshot.
    pub fn depth(&self) -> Result<QueueDepth> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM queue_jobs WHERE namespace = ?1 GROUP BY status",
            )
            .map_err(|e| NudgeError::Queue(format!("Depth: {e}")))?;
        let rows = stmt
            .query_map([&self.config.namespace], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| NudgeError::Queue(format!("Depth: {e}")))?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let (status, count) = row.map_err(|e| NudgeError::Queue(format!("Depth: {e}")))?;
            match status.as_str() {
                "queued" => depth.queued = count,
                "active" => depth.active = count,
                "completed" => depth.completed = count,
                "failed" => depth.failed = count,
                _ => {}
            }
        }
        Ok(depth)
    }
}

/// Callback a worker invokes for each claimed run.
pub type RunExecutor = Arc<dyn Fn(ClaimedRun) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle to the running worker pool.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// Spawn the configured number of workers against the queue.
pub fn start_workers(queue: Arc<DurableQueue>, executor: RunExecutor) -> WorkerPool {
    let stop = Arc::new(AtomicBool::new(false));
    let concurrency = queue.config().concurrency.max(1);
    let mut handles = Vec::with_capacity(concurrency);
    for i in 1..=concurrency {
        handles.push(tokio::spawn(worker_loop(
            i,
            queue.clone(),
            executor.clone(),
            stop.clone(),
        )));
    }
    tracing::info!("Queue workers started ({concurrency}x)");
    WorkerPool { handles, stop }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<DurableQueue>,
    executor: RunExecutor,
    stop: Arc<AtomicBool>,
) {
    let config = queue.config().clone();
    let job_timeout = Duration::from_secs(config.job_timeout_secs);

    while !stop.load(Ordering::Relaxed) {
        match queue.claim_next(Utc::now()) {
            Ok(Some(claimed)) => {
                let id = claimed.id;
                let attempt = claimed.attempt;
                tracing::debug!(
                    "worker-{worker}: running '{}' (attempt {attempt})",
                    claimed.run.job_name
                );
                let outcome = tokio::time::timeout(job_timeout, executor(claimed)).await;
                let report = match outcome {
                    Ok(Ok(())) => queue.complete(id),
                    Ok(Err(e)) => queue.fail(id, attempt, &e.to_string()),
                    Err(_) => queue.fail(
                        id,
                        attempt,
                        &format!("timed out after {}s", config.job_timeout_secs),
                    ),
                };
                if let Err(e) = report {
                    tracing::error!("worker-{worker}: could not record outcome for {id}: {e}");
                }
                if let Err(e) = queue.prune() {
                    tracing::warn!("Queue prune failed: {e}");
                }
            }
            Ok(None) => tokio::time::sleep(poll_with_jitter(&config)).await,
            Err(e) => {
                tracing::error!("worker-{worker}: queue poll failed: {e}");
                tokio::time::sleep(poll_with_jitter(&config)).await;
            }
        }
    }
    tracing::debug!("worker-{worker}: stopped");
}

fn poll_with_jitter(config: &QueueConfig) -> Duration {
    let jitter = if config.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.jitter_ms)
    };
    Duration::from_millis(config.poll_interval_ms + jitter)
}

impl WorkerPool {
    pub fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// Stop claiming new runs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(e) = result {
                tracing::warn!("Worker task panicked: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue(max_attempts: u32) -> DurableQueue {
        DurableQueue::open_in_memory(QueueConfig {
            max_attempts,
            backoff_base_secs: 5,
            keep_completed: 2,
            keep_failed: 2,
            ..QueueConfig::default()
        })
        .unwrap()
    }

    fn sample_run(name: &str) -> QueuedRun {
        QueuedRun {
            job_name: name.into(),
            job_id: "job-1".into(),
            job_key: name.into(),
            timezone: "UTC".into(),
            execution_id: 1,
            config: serde_json::json!({}),
            targets: JobTargets::default(),
        }
    }

    #[test]
    fn test_enqueue_claim_complete() {
        let queue = test_queue(3);
        queue.enqueue(&sample_run("a")).unwrap();

        let claimed = queue.claim_next(Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.run.job_name, "a");

        // An active run cannot be claimed twice
        assert!(queue.claim_next(Utc::now()).unwrap().is_none());

        queue.complete(claimed.id).unwrap();
        let depth = queue.depth().unwrap();
        assert_eq!(depth.completed, 1);
        assert_eq!(depth.queued, 0);
    }

    #[test]
    fn test_retry_with_exponential_backoff() {
        let queue = test_queue(3);
        queue.enqueue(&sample_run("flaky")).unwrap();
        let now = Utc::now();

        let first = queue.claim_next(now).unwrap().unwrap();
        queue.fail(first.id, first.attempt, "boom").unwrap();

        // Backoff of base*2^0 = 5s: not ready yet, ready afterwards
        assert!(queue.claim_next(now).unwrap().is_none());
        let second = queue
            .claim_next(now + chrono::Duration::seconds(6))
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);
        queue.fail(second.id, second.attempt, "boom").unwrap();

        // Second backoff is base*2^1 = 10s
        assert!(
            queue
                .claim_next(now + chrono::Duration::seconds(12))
                .unwrap()
                .is_none()
        );
        let third = queue
            .claim_next(now + chrono::Duration::seconds(20))
            .unwrap()
            .unwrap();
        assert_eq!(third.attempt, 3);

        // Attempts exhausted: parked as failed
        queue.fail(third.id, third.attempt, "boom").unwrap();
        assert!(
            queue
                .claim_next(now + chrono::Duration::days(1))
                .unwrap()
                .is_none()
        );
        let depth = queue.depth().unwrap();
        assert_eq!(depth.failed, 1);
    }

    #[test]
    fn test_requeue_abandoned() {
        let queue = test_queue(3);
        queue.enqueue(&sample_run("orphan")).unwrap();
        let claimed = queue.claim_next(Utc::now()).unwrap().unwrap();

        // Simulated crash: the active row is still locked
        assert_eq!(queue.requeue_abandoned().unwrap(), 1);
        let reclaimed = queue.claim_next(Utc::now()).unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.attempt, 2);
    }

    #[test]
    fn test_prune_respects_retention() {
        let queue = test_queue(1);
        for i in 0..5 {
            queue.enqueue(&sample_run(&format!("job-{i}"))).unwrap();
            let claimed = queue.claim_next(Utc::now()).unwrap().unwrap();
            queue.complete(claimed.id).unwrap();
        }
        queue.prune().unwrap();
        assert_eq!(queue.depth().unwrap().completed, 2);
    }

    #[test]
    fn test_is_ready() {
        let queue = test_queue(3);
        assert!(queue.is_ready());
    }

    #[tokio::test]
    async fn test_worker_pool_runs_and_drains() {
        use std::sync::atomic::AtomicUsize;

        let queue = Arc::new(DurableQueue::open_in_memory(QueueConfig {
            concurrency: 2,
            poll_interval_ms: 10,
            jitter_ms: 0,
            ..QueueConfig::default()
        })
        .unwrap());
        for i in 0..4 {
            queue.enqueue(&sample_run(&format!("w-{i}"))).unwrap();
        }

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let executor: RunExecutor = Arc::new(move |_claimed| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let pool = start_workers(queue.clone(), executor);
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown().await;

        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(queue.depth().unwrap().completed, 4);
    }
}
