//! Built-in jobs shipped with the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use nudge_core::error::Result;
use serde::Deserialize;

use crate::jobs::{JobDefinition, JobNotification, JobResult};

/// Selection lookup: which of these users have made no selection on `day`.
#[async_trait]
pub trait SelectionLedger: Send + Sync {
    async fn unselected_on(&self, user_ids: &[String], day: NaiveDate) -> Result<Vec<String>>;
}

pub const DAILY_SELECTION_REMINDER: &str = "daily-selection-reminder";

/// Typed view over the job's opaque config map.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ReminderConfig {
    message: String,
    silent: bool,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            message: "You haven't made your selection today. Don't miss it!".into(),
            silent: false,
        }
    }
}

/// Query-and-notify reminder: asks the ledger which targeted users still
/// have no selection for the current day (in the job's timezone) and emits
/// one notification per user. Re-running it recomputes the same question
/// against current state, so at-least-once execution is harmless.
pub fn daily_selection_reminder(ledger: Arc<dyn SelectionLedger>) -> JobDefinition {
    JobDefinition::new(DAILY_SELECTION_REMINDER, move |ctx| {
        let ledger = ledger.clone();
        async move {
            let config: ReminderConfig =
                serde_json::from_value(ctx.config.clone()).unwrap_or_default();
            let tz: Tz = ctx.timezone.parse().unwrap_or(chrono_tz::UTC);
            let today = ctx.triggered_at.with_timezone(&tz).date_naive();

            let targeted = ctx.targets.final_user_ids.len();
            let missing = ledger
                .unselected_on(&ctx.targets.final_user_ids, today)
                .await?;

            let notifications: Vec<JobNotification> = missing
                .iter()
                .map(|user_id| {
                    let mut notification = JobNotification::text(user_id, &config.message);
                    notification.silent = config.silent;
                    notification
                })
                .collect();
            let count = notifications.len() as i64;

            Ok(JobResult::ok(format!(
                "{count} of {targeted} targeted user(s) reminded"
            ))
            .users_affected(count)
            .notifications(notifications))
        }
    })
    .display_name("Daily selection reminder")
    .description("Reminds targeted users who have not made today's selection")
    .schedule("0 20 * * *", "UTC")
    .config(serde_json::json!({
        "message": ReminderConfig::default().message,
        "silent": false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobContext;
    use crate::targets::JobTargets;
    use chrono::Utc;
    use std::collections::HashSet;

    /// Ledger where a fixed set of users already selected.
    struct FakeLedger {
        selected: HashSet<String>,
    }

    #[async_trait]
    impl SelectionLedger for FakeLedger {
        async fn unselected_on(&self, user_ids: &[String], _day: NaiveDate) -> Result<Vec<String>> {
            Ok(user_ids
                .iter()
                .filter(|id| !self.selected.contains(*id))
                .cloned()
                .collect())
        }
    }

    fn context(user_ids: &[&str], config: serde_json::Value) -> JobContext {
        JobContext {
            job_id: "job-1".into(),
            job_key: DAILY_SELECTION_REMINDER.into(),
            execution_id: 1,
            timezone: "Asia/Tehran".into(),
            config,
            targets: JobTargets {
                final_user_ids: user_ids.iter().map(|s| s.to_string()).collect(),
                ..JobTargets::default()
            },
            triggered_at: Utc::now(),
        }
    }

    fn ledger(selected: &[&str]) -> Arc<dyn SelectionLedger> {
        Arc::new(FakeLedger {
            selected: selected.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_only_unselected_users_are_notified() {
        let def = daily_selection_reminder(ledger(&["u2"]));
        let result = def
            .execute(context(&["u1", "u2", "u3"], serde_json::json!({})))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.users_affected, 2);
        assert_eq!(result.notifications.len(), 2);
        let recipients: Vec<_> = result
            .notifications
            .iter()
            .map(|n| n.recipient_id.as_str())
            .collect();
        assert_eq!(recipients, vec!["u1", "u3"]);
        assert_eq!(result.summary, "2 of 3 targeted user(s) reminded");
    }

    #[tokio::test]
    async fn test_config_overrides_message_and_silence() {
        let def = daily_selection_reminder(ledger(&[]));
        let result = def
            .execute(context(
                &["u1"],
                serde_json::json!({"message": "Pick now!", "silent": true}),
            ))
            .await
            .unwrap();

        assert_eq!(result.notifications[0].text, "Pick now!");
        assert!(result.notifications[0].silent);
    }

    #[tokio::test]
    async fn test_everyone_selected_means_quiet_success() {
        let def = daily_selection_reminder(ledger(&["u1", "u2"]));
        let result = def
            .execute(context(&["u1", "u2"], serde_json::json!({})))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.users_affected, 0);
        assert!(result.notifications.is_empty());
    }
}
