//! # Nudge Scheduler
//!
//! Notification-driven job scheduler: recurring jobs on cron schedules,
//! tracked durably, delivered through a rate-limited channel.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval sweep)
//!   ├── due record → resolve audience → pending execution → enqueue
//!   └── recompute next_run_at at dispatch (no double fire)
//!
//! DurableQueue (SQLite, survives restarts)
//!   └── worker pool (bounded concurrency, retry w/ backoff, retention)
//!         └── JobRegistry → handler → lifecycle wrapper → tracker
//!               └── notifications → Dispatcher (25 msg/s, typed retry)
//! ```
//!
//! Execution is at-least-once: handlers must be safe to re-run. Running
//! several engines against one schedule database will double-dispatch;
//! cross-process exclusion is deliberately not implemented here.

pub mod builtin;
pub mod dispatch;
pub mod engine;
pub mod jobs;
pub mod persistence;
pub mod queue;
pub mod records;
pub mod registry;
pub mod schedule;
pub mod targets;

pub use builtin::{DAILY_SELECTION_REMINDER, SelectionLedger, daily_selection_reminder};
pub use dispatch::{BatchOutcome, DeliveryOutcome, Dispatcher, MESSAGES_PER_SECOND};
pub use engine::{NotificationSink, SchedulerEngine, SchedulerStatus, spawn_scheduler};
pub use jobs::{JobContext, JobDefinition, JobNotification, JobResult, run_with_tracking};
pub use persistence::SchedulerDb;
pub use queue::{DurableQueue, QueueDepth, QueuedRun, WorkerPool};
pub use records::{ExecutionStatus, JobExecution, ScheduledJob, TargetSpec};
pub use registry::JobRegistry;
pub use targets::{JobTargets, resolve_targets};
