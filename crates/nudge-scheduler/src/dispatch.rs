//! Notification dispatch — delivers job notifications through a messaging
//! channel without exceeding its rate limit.
//!
//! Delivery is sequential with a fixed inter-send delay rather than a token
//! bucket: the limit can never be exceeded, at the cost of batch latency
//! growing linearly with size. Callers needing more throughput must shard
//! across dispatchers with their own rate budget.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use nudge_core::config::DispatcherConfig;
use nudge_core::traits::Messenger;
use nudge_core::types::DeliveryReceipt;
use nudge_core::error::SendError;
use serde::Serialize;

use crate::jobs::JobNotification;

/// Default outbound rate. Telegram documents ~30 msg/s for bots; 25 leaves
/// a safety margin.
pub const MESSAGES_PER_SECOND: u32 = 25;

/// Outcome of one delivery attempt chain. Never an Err — failures are data.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub recipient_id: String,
    pub success: bool,
    pub message_id: Option<i64>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    fn delivered(recipient_id: &str, receipt: DeliveryReceipt) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            success: true,
            message_id: Some(receipt.message_id),
            error: None,
        }
    }

    fn failed(recipient_id: &str, error: String) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            success: false,
            message_id: None,
            error: Some(error),
        }
    }
}

/// Aggregate result of a batch delivery.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
}

/// Rate-limited, retrying notification dispatcher.
///
/// Must be initialized with a live [`Messenger`] before it is ready; sends
/// before initialization degrade to failure outcomes (logged), never a
/// panic — a misconfigured deployment loses notifications, not job runs.
pub struct Dispatcher {
    messenger: RwLock<Option<Arc<dyn Messenger>>>,
    messages_per_second: u32,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            messenger: RwLock::new(None),
            messages_per_second: config.messages_per_second.max(1),
            max_retries: config.max_retries.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms,
        }
    }

    /// Wire the live messaging channel.
    pub fn initialize(&self, messenger: Arc<dyn Messenger>) {
        tracing::info!("📣 Dispatcher initialized with '{}' channel", messenger.name());
        if let Ok(mut slot) = self.messenger.write() {
            *slot = Some(messenger);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.messenger.read().map(|m| m.is_some()).unwrap_or(false)
    }

    fn messenger(&self) -> Option<Arc<dyn Messenger>> {
        self.messenger.read().ok().and_then(|m| m.clone())
    }

    /// Fixed gap inserted between consecutive sends.
    pub fn inter_send_delay(&self) -> Duration {
        Duration::from_millis(1000 / self.messages_per_second as u64)
    }

    async fn try_send(
        &self,
        notification: &JobNotification,
    ) -> std::result::Result<DeliveryReceipt, SendError> {
        match self.messenger() {
            Some(messenger) => messenger.send(notification.to_message()).await,
            None => Err(SendError::NotReady),
        }
    }

    /// Deliver one message. All failures are captured into the outcome.
    pub async fn send(&self, notification: &JobNotification) -> DeliveryOutcome {
        match self.try_send(notification).await {
            Ok(receipt) => DeliveryOutcome::delivered(&notification.recipient_id, receipt),
            Err(e) => {
                tracing::warn!("Delivery to {} failed: {e}", notification.recipient_id);
                DeliveryOutcome::failed(&notification.recipient_id, e.to_string())
            }
        }
    }

    /// Deliver a batch sequentially, pausing `1000 / messages_per_second` ms
    /// before every send except the first. One recipient failing never stops
    /// the batch; `outcomes.len()` always equals the input length.
    pub async fn send_batch(&self, notifications: &[JobNotification]) -> BatchOutcome {
        let delay = self.inter_send_delay();
        let mut outcomes = Vec::with_capacity(notifications.len());

        for (i, notification) in notifications.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            outcomes.push(self.send_with_retry_inner(notification).await);
        }

        let successful = outcomes.iter().filter(|o| o.success).count();
        let batch = BatchOutcome {
            total: notifications.len(),
            successful,
            failed: notifications.len() - successful,
            outcomes,
        };
        if batch.failed > 0 {
            tracing::warn!(
                "Batch delivered {}/{} messages ({} failed)",
                batch.successful,
                batch.total,
                batch.failed
            );
        } else if batch.total > 0 {
            tracing::info!("✅ Batch delivered {} message(s)", batch.total);
        }
        batch
    }

    async fn send_with_retry_inner(&self, notification: &JobNotification) -> DeliveryOutcome {
        self.send_with_retry(notification, self.max_retries, self.retry_base_delay_ms)
            .await
    }

    /// Deliver with retry on transient failures only. Attempt `n` is followed
    /// by a `base_delay_ms * 2^(n-1)` pause (a larger server-supplied
    /// retry-after hint wins); permanent errors return after one attempt.
    pub async fn send_with_retry(
        &self,
        notification: &JobNotification,
        max_retries: u32,
        base_delay_ms: u64,
    ) -> DeliveryOutcome {
        let max_retries = max_retries.max(1);
        let mut last_error = SendError::NotReady;

        for attempt in 1..=max_retries {
            match self.try_send(notification).await {
                Ok(receipt) => {
                    if attempt > 1 {
                        tracing::info!(
                            "Delivered to {} on attempt {attempt}",
                            notification.recipient_id
                        );
                    }
                    return DeliveryOutcome::delivered(&notification.recipient_id, receipt);
                }
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let mut delay_ms = base_delay_ms.saturating_mul(1 << (attempt - 1));
                    if let Some(hint) = e.retry_after_secs() {
                        delay_ms = delay_ms.max(hint.saturating_mul(1000));
                    }
                    tracing::warn!(
                        "Transient delivery failure to {} (attempt {attempt}/{max_retries}), \
                         retrying in {delay_ms}ms: {e}",
                        notification.recipient_id
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    last_error = e;
                }
                Err(e) => {
                    tracing::warn!("Delivery to {} failed: {e}", notification.recipient_id);
                    return DeliveryOutcome::failed(&notification.recipient_id, e.to_string());
                }
            }
        }
        DeliveryOutcome::failed(&notification.recipient_id, last_error.to_string())
    }
}
