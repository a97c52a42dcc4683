//! Job Registry — in-process catalog of job definitions.

use std::collections::HashMap;
use std::sync::Arc;

use nudge_core::error::{NudgeError, Result};

use crate::jobs::{JobContext, JobDefinition, JobResult};

/// Registry mapping job name → definition. Built once at process start and
/// passed by reference — no global singleton.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Register a definition. Idempotent by name: re-registering overwrites
    /// and logs a warning (last writer wins, which permits hot-reload during
    /// development; two modules racing for one name is a latent bug).
    pub fn register(&mut self, definition: JobDefinition) {
        let name = definition.name.clone();
        if self.jobs.contains_key(&name) {
            tracing::warn!("Job '{name}' re-registered, previous definition replaced");
        } else {
            tracing::info!("Job registered: '{name}'");
        }
        self.jobs.insert(name, Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// All definitions, sorted by name.
    pub fn all(&self) -> Vec<Arc<JobDefinition>> {
        let mut jobs: Vec<_> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    /// Look up and invoke a handler. Errors propagate to the caller — the
    /// scheduler, not the registry, marks the run failed.
    pub async fn execute(&self, name: &str, ctx: JobContext) -> Result<JobResult> {
        let definition = self
            .get(name)
            .ok_or_else(|| NudgeError::Job(format!("Unknown job type: {name}")))?;
        definition.execute(ctx).await
    }

    /// Seed data for boot-time schedule creation: definitions that opted in.
    pub fn seed_defaults(&self) -> Vec<Arc<JobDefinition>> {
        self.all()
            .into_iter()
            .filter(|d| d.seed_on_startup)
            .collect()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> JobDefinition {
        JobDefinition::new(name, |_ctx| async { Ok(JobResult::ok("noop")) })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = JobRegistry::new();
        registry.register(noop("a"));
        registry.register(noop("b"));
        assert_eq!(registry.count(), 2);
        assert!(registry.has("a"));
        assert!(!registry.has("c"));
        let names: Vec<_> = registry.all().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_reregister_overwrites() {
        let mut registry = JobRegistry::new();
        registry.register(noop("a").display_name("first"));
        registry.register(noop("a").display_name("second"));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("a").unwrap().display_name, "second");
    }

    #[test]
    fn test_seed_defaults_filters_opt_outs() {
        let mut registry = JobRegistry::new();
        registry.register(noop("seeded"));
        registry.register(noop("manual").seed_on_startup(false));
        let seeds: Vec<_> = registry
            .seed_defaults()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(seeds, vec!["seeded"]);
    }

    #[tokio::test]
    async fn test_execute_unknown_job_errors() {
        let registry = JobRegistry::new();
        let ctx = crate::jobs::JobContext {
            job_id: "j".into(),
            job_key: "j".into(),
            execution_id: 1,
            timezone: "UTC".into(),
            config: serde_json::json!({}),
            targets: crate::targets::JobTargets::default(),
            triggered_at: chrono::Utc::now(),
        };
        let err = registry.execute("ghost", ctx).await.unwrap_err();
        assert!(err.to_string().contains("Unknown job type"));
    }
}
