//! SQLite-backed persistence for schedule records and execution history.
//!
//! The tracker is the single source of truth for run status. Status
//! transitions are guarded in SQL (`WHERE status = ...`), so a record that
//! already reached `success` or `failed` can never regress — the update
//! simply matches zero rows and the caller gets an error.
//!
//! Timestamps are stored as epoch milliseconds.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use nudge_core::error::{NudgeError, Result};
use rusqlite::Connection;
use uuid::Uuid;

use crate::jobs::JobDefinition;
use crate::records::{ExecutionStatus, JobExecution, ScheduledJob, TargetSpec};
use crate::schedule;

/// Persistence store for scheduled jobs and their execution trail.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| NudgeError::Database(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NudgeError::Database(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NudgeError::Database("connection lock poisoned".into()))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                job_key TEXT NOT NULL UNIQUE,
                job_type TEXT NOT NULL,
                schedule TEXT NOT NULL,
                timezone TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                config TEXT NOT NULL DEFAULT '{}',
                targets TEXT NOT NULL DEFAULT '{}',
                last_run_at INTEGER,
                next_run_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                duration_ms INTEGER,
                result TEXT,
                error TEXT,
                users_affected INTEGER NOT NULL DEFAULT 0,
                metadata TEXT,
                FOREIGN KEY (job_id) REFERENCES scheduled_jobs(id)
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_due
                ON scheduled_jobs(enabled, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_executions_job
                ON job_executions(job_id, id);
            CREATE INDEX IF NOT EXISTS idx_executions_status
                ON job_executions(status, started_at);
         ",
            )
            .map_err(|e| NudgeError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Scheduled jobs ──────────────────────────────────────

    /// Create a schedule record from a definition's defaults unless one with
    /// that job key already exists. Operator edits to existing records are
    /// never overwritten. Returns true if a record was created.
    pub fn seed_default(&self, definition: &JobDefinition) -> Result<bool> {
        if self.get_job_by_key(&definition.name)?.is_some() {
            return Ok(false);
        }
        schedule::validate(&definition.default_schedule, &definition.default_timezone)?;

        let now = Utc::now();
        let next_run =
            schedule::next_occurrence(&definition.default_schedule, &definition.default_timezone, now);
        let record = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            name: definition.display_name.clone(),
            job_key: definition.name.clone(),
            job_type: definition.name.clone(),
            schedule: definition.default_schedule.clone(),
            timezone: definition.default_timezone.clone(),
            enabled: true,
            config: definition.default_config.clone(),
            targets: TargetSpec::default(),
            last_run_at: None,
            next_run_at: next_run,
            created_at: now,
            updated_at: now,
        };
        self.insert_job(&record)?;
        tracing::info!(
            "📅 Seeded schedule '{}' ({} {})",
            record.job_key,
            record.schedule,
            record.timezone
        );
        Ok(true)
    }

    /// Insert a schedule record as-is.
    pub fn insert_job(&self, job: &ScheduledJob) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO scheduled_jobs
                 (id, name, job_key, job_type, schedule, timezone, enabled, config, targets,
                  last_run_at, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    job.id,
                    job.name,
                    job.job_key,
                    job.job_type,
                    job.schedule,
                    job.timezone,
                    job.enabled as i32,
                    job.config.to_string(),
                    serde_json::to_string(&job.targets).unwrap_or_else(|_| "{}".into()),
                    job.last_run_at.map(|t| t.timestamp_millis()),
                    job.next_run_at.map(|t| t.timestamp_millis()),
                    job.created_at.timestamp_millis(),
                    job.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| NudgeError::Database(format!("Insert job: {e}")))?;
        Ok(())
    }

    /// Load all schedule records.
    pub fn load_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.query_jobs("SELECT * FROM scheduled_jobs ORDER BY created_at", &[])
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self
            .query_jobs("SELECT * FROM scheduled_jobs WHERE id = ?1", &[&id])?
            .into_iter()
            .next())
    }

    pub fn get_job_by_key(&self, job_key: &str) -> Result<Option<ScheduledJob>> {
        Ok(self
            .query_jobs("SELECT * FROM scheduled_jobs WHERE job_key = ?1", &[&job_key])?
            .into_iter()
            .next())
    }

    /// Enabled records whose next run is at or before `now`.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let millis = now.timestamp_millis();
        self.query_jobs(
            "SELECT * FROM scheduled_jobs
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at",
            &[&millis],
        )
    }

    fn query_jobs(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| NudgeError::Database(format!("Query jobs: {e}")))?;
        let rows = stmt
            .query_map(params, |row| {
                let config_str: String = row.get("config")?;
                let targets_str: String = row.get("targets")?;
                Ok(ScheduledJob {
                    id: row.get("id")?,
                    name: row.get("name")?,
                    job_key: row.get("job_key")?,
                    job_type: row.get("job_type")?,
                    schedule: row.get("schedule")?,
                    timezone: row.get("timezone")?,
                    enabled: row.get::<_, i32>("enabled")? != 0,
                    config: serde_json::from_str(&config_str).unwrap_or_default(),
                    targets: serde_json::from_str(&targets_str).unwrap_or_default(),
                    last_run_at: row.get::<_, Option<i64>>("last_run_at")?.map(from_millis),
                    next_run_at: row.get::<_, Option<i64>>("next_run_at")?.map(from_millis),
                    created_at: from_millis(row.get("created_at")?),
                    updated_at: from_millis(row.get("updated_at")?),
                })
            })
            .map_err(|e| NudgeError::Database(format!("Query jobs: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NudgeError::Database(format!("Query jobs: {e}")))
    }

    /// Record a dispatch: advance `last_run_at` and persist the already
    /// recomputed `next_run_at`.
    pub fn record_dispatch(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE scheduled_jobs
                 SET last_run_at = ?1, next_run_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![
                    last_run.timestamp_millis(),
                    next_run.map(|t| t.timestamp_millis()),
                    Utc::now().timestamp_millis(),
                    id,
                ],
            )
            .map_err(|e| NudgeError::Database(format!("Record dispatch: {e}")))?;
        Ok(())
    }

    /// Change a record's schedule/timezone. Malformed input is rejected here,
    /// at write time, never persisted.
    pub fn update_schedule(&self, id: &str, expression: &str, timezone: &str) -> Result<()> {
        schedule::validate(expression, timezone)?;
        let next_run = schedule::next_occurrence(expression, timezone, Utc::now());
        self.conn()?
            .execute(
                "UPDATE scheduled_jobs
                 SET schedule = ?1, timezone = ?2, next_run_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    expression,
                    timezone,
                    next_run.map(|t| t.timestamp_millis()),
                    Utc::now().timestamp_millis(),
                    id,
                ],
            )
            .map_err(|e| NudgeError::Database(format!("Update schedule: {e}")))?;
        Ok(())
    }

    /// Enable or disable a record. Enabling recomputes the next occurrence
    /// from now so a long-disabled job does not fire for missed runs.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let next_run = if enabled {
            self.get_job(id)?
                .and_then(|job| schedule::next_occurrence(&job.schedule, &job.timezone, Utc::now()))
                .map(|t| t.timestamp_millis())
        } else {
            self.get_job(id)?
                .and_then(|job| job.next_run_at)
                .map(|t| t.timestamp_millis())
        };
        self.conn()?
            .execute(
                "UPDATE scheduled_jobs SET enabled = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![
                    enabled as i32,
                    next_run,
                    Utc::now().timestamp_millis(),
                    id,
                ],
            )
            .map_err(|e| NudgeError::Database(format!("Set enabled: {e}")))?;
        Ok(())
    }

    pub fn update_targets(&self, id: &str, targets: &TargetSpec) -> Result<()> {
        let json = serde_json::to_string(targets)
            .map_err(|e| NudgeError::Database(format!("Serialize targets: {e}")))?;
        self.conn()?
            .execute(
                "UPDATE scheduled_jobs SET targets = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![json, Utc::now().timestamp_millis(), id],
            )
            .map_err(|e| NudgeError::Database(format!("Update targets: {e}")))?;
        Ok(())
    }

    pub fn update_config(&self, id: &str, config: &serde_json::Value) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE scheduled_jobs SET config = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![config.to_string(), Utc::now().timestamp_millis(), id],
            )
            .map_err(|e| NudgeError::Database(format!("Update config: {e}")))?;
        Ok(())
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", [id])
            .map_err(|e| NudgeError::Database(format!("Delete job: {e}")))?;
        Ok(())
    }

    /// Recompute next runs that are missing or stale (boot-time repair;
    /// occurrences missed while the process was down are skipped, not
    /// replayed). Returns how many records were touched.
    pub fn recompute_stale_next_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<ScheduledJob> = self
            .load_jobs()?
            .into_iter()
            .filter(|job| {
                job.enabled
                    && match job.next_run_at {
                        None => true,
                        Some(next) => next < now,
                    }
            })
            .collect();
        let count = stale.len();
        for job in stale {
            let next = schedule::next_occurrence(&job.schedule, &job.timezone, now);
            self.conn()?
                .execute(
                    "UPDATE scheduled_jobs SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![
                        next.map(|t| t.timestamp_millis()),
                        now.timestamp_millis(),
                        job.id,
                    ],
                )
                .map_err(|e| NudgeError::Database(format!("Recompute next run: {e}")))?;
        }
        Ok(count)
    }

    pub fn count_enabled(&self) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM scheduled_jobs WHERE enabled = 1",
                [],
                |row| row.get(0),
            )
            .map_err(|e| NudgeError::Database(format!("Count enabled: {e}")))
    }

    // ─── Executions ──────────────────────────────────────

    /// Create a `pending` execution record. Returns its id.
    pub fn create_execution(
        &self,
        job_id: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_executions (job_id, status, started_at, metadata)
             VALUES (?1, 'pending', ?2, ?3)",
            rusqlite::params![
                job_id,
                Utc::now().timestamp_millis(),
                metadata.map(|m| m.to_string()),
            ],
        )
        .map_err(|e| NudgeError::Database(format!("Create execution: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// pending → running. Resets `started_at` so duration measures the run,
    /// not the queue wait.
    pub fn mark_running(&self, execution_id: i64) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE job_executions SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![Utc::now().timestamp_millis(), execution_id],
            )
            .map_err(|e| NudgeError::Database(format!("Mark running: {e}")))?;
        if changed == 0 {
            return Err(NudgeError::Database(format!(
                "execution {execution_id}: illegal transition to running"
            )));
        }
        Ok(())
    }

    /// running → success. Terminal fields are written exactly once.
    pub fn mark_succeeded(
        &self,
        execution_id: i64,
        summary: &str,
        users_affected: i64,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let changed = self
            .conn()?
            .execute(
                "UPDATE job_executions
                 SET status = 'success', completed_at = ?1, duration_ms = ?1 - started_at,
                     result = ?2, users_affected = ?3,
                     metadata = COALESCE(?4, metadata)
                 WHERE id = ?5 AND status = 'running'",
                rusqlite::params![
                    now,
                    summary,
                    users_affected,
                    metadata.map(|m| m.to_string()),
                    execution_id,
                ],
            )
            .map_err(|e| NudgeError::Database(format!("Mark succeeded: {e}")))?;
        if changed == 0 {
            return Err(NudgeError::Database(format!(
                "execution {execution_id}: illegal transition to success"
            )));
        }
        Ok(())
    }

    /// pending|running → failed. A before-execute failure goes straight from
    /// pending; a terminal record never changes again.
    pub fn mark_failed(&self, execution_id: i64, error: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let changed = self
            .conn()?
            .execute(
                "UPDATE job_executions
                 SET status = 'failed', completed_at = ?1, duration_ms = ?1 - started_at,
                     error = ?2
                 WHERE id = ?3 AND status IN ('pending', 'running')",
                rusqlite::params![now, error, execution_id],
            )
            .map_err(|e| NudgeError::Database(format!("Mark failed: {e}")))?;
        if changed == 0 {
            return Err(NudgeError::Database(format!(
                "execution {execution_id}: illegal transition to failed"
            )));
        }
        Ok(())
    }

    pub fn get_execution(&self, execution_id: i64) -> Result<JobExecution> {
        self.query_executions(
            "SELECT * FROM job_executions WHERE id = ?1",
            &[&execution_id],
        )?
        .into_iter()
        .next()
        .ok_or_else(|| NudgeError::Database(format!("execution {execution_id} not found")))
    }

    /// Most recent executions across all jobs.
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<JobExecution>> {
        let limit = limit as i64;
        self.query_executions(
            "SELECT * FROM job_executions ORDER BY id DESC LIMIT ?1",
            &[&limit],
        )
    }

    /// Run history for one job.
    pub fn executions_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<JobExecution>> {
        let limit = limit as i64;
        self.query_executions(
            "SELECT * FROM job_executions WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
            &[&job_id, &limit],
        )
    }

    /// Mark runs abandoned by a crash: `running` records started before
    /// `cutoff` become `failed`. Records that meanwhile reached a terminal
    /// state are untouched by the status guard.
    pub fn reap_stale_running(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let reaped = self
            .conn()?
            .execute(
                "UPDATE job_executions
                 SET status = 'failed', completed_at = ?1, duration_ms = ?1 - started_at,
                     error = 'abandoned: reconciled after restart'
                 WHERE status = 'running' AND started_at < ?2",
                rusqlite::params![now, cutoff.timestamp_millis()],
            )
            .map_err(|e| NudgeError::Database(format!("Reap stale: {e}")))?;
        if reaped > 0 {
            tracing::warn!("Reaped {reaped} stale running execution(s)");
        }
        Ok(reaped)
    }

    fn query_executions(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<JobExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| NudgeError::Database(format!("Query executions: {e}")))?;
        let rows = stmt
            .query_map(params, |row| {
                let status: String = row.get("status")?;
                let metadata: Option<String> = row.get("metadata")?;
                Ok(JobExecution {
                    id: row.get("id")?,
                    job_id: row.get("job_id")?,
                    status: ExecutionStatus::parse(&status),
                    started_at: from_millis(row.get("started_at")?),
                    completed_at: row.get::<_, Option<i64>>("completed_at")?.map(from_millis),
                    duration_ms: row.get("duration_ms")?,
                    result: row.get("result")?,
                    error: row.get("error")?,
                    users_affected: row.get("users_affected")?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                })
            })
            .map_err(|e| NudgeError::Database(format!("Query executions: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NudgeError::Database(format!("Query executions: {e}")))
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
