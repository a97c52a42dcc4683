//! Telegram Bot channel — message sending via Bot API.

use async_trait::async_trait;
use nudge_core::error::{NudgeError, Result, SendError};
use nudge_core::traits::Messenger;
use nudge_core::types::{DeliveryReceipt, OutboundMessage};
use serde::{Deserialize, Serialize};

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    10
}

/// Telegram Bot channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{}",
            self.config.bot_token, method
        )
    }

    /// Get bot info.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("getMe failed: {e}")))?;
        let body: TelegramApiResponse<TelegramUser> = response
            .json()
            .await
            .map_err(|e| NudgeError::Channel(format!("Invalid getMe response: {e}")))?;
        body.result
            .ok_or_else(|| NudgeError::Channel("No bot info".into()))
    }

    /// Send a message, returning the message id Telegram assigned.
    pub async fn send_message(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<DeliveryReceipt, SendError> {
        let chat_id: i64 = message
            .recipient_id
            .parse()
            .map_err(|_| SendError::Rejected(format!("Invalid chat_id: {}", message.recipient_id)))?;

        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": message.text,
        });
        if let Some(mode) = message.parse_mode.api_value() {
            body["parse_mode"] = mode.into();
        }
        if message.silent {
            body["disable_notification"] = true.into();
        }
        if let Some(markup) = &message.reply_markup {
            body["reply_markup"] = markup.clone();
        }

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .timeout(std::time::Duration::from_secs(
                self.config.request_timeout_secs,
            ))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let api: TelegramApiResponse<TelegramMessage> = match response.json().await {
            Ok(api) => api,
            Err(_) if status.is_server_error() => return Err(SendError::Server(status.as_u16())),
            Err(e) => return Err(SendError::Network(format!("Invalid send response: {e}"))),
        };

        if api.ok {
            let message_id = api.result.map(|m| m.message_id).unwrap_or_default();
            return Ok(DeliveryReceipt { message_id });
        }

        Err(classify_api_error(status, &api))
    }
}

/// Map a reqwest transport failure onto a typed send error.
fn classify_transport_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() {
        SendError::Timeout
    } else if e.is_connect() {
        SendError::Network(format!("connect: {e}"))
    } else {
        SendError::Network(e.to_string())
    }
}

/// Map a Bot API `ok=false` envelope onto a typed send error.
fn classify_api_error(
    status: reqwest::StatusCode,
    api: &TelegramApiResponse<TelegramMessage>,
) -> SendError {
    let code = api.error_code.unwrap_or_else(|| status.as_u16() as i64);
    match code {
        429 => SendError::RateLimited {
            retry_after_secs: api
                .parameters
                .as_ref()
                .and_then(|p| p.retry_after)
                .map(|s| s as u64),
        },
        500..=599 => SendError::Server(code as u16),
        _ => SendError::Rejected(api.description.clone().unwrap_or_else(|| {
            format!("Telegram API error {code}")
        })),
    }
}

#[async_trait]
impl Messenger for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn probe(&self) -> Result<()> {
        let me = self.get_me().await?;
        tracing::info!(
            "✅ Telegram bot: @{} ({})",
            me.username.as_deref().unwrap_or("unknown"),
            me.first_name
        );
        Ok(())
    }

    async fn send(
        &self,
        message: OutboundMessage,
    ) -> std::result::Result<DeliveryReceipt, SendError> {
        self.send_message(&message).await
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

/// Extra hints Telegram attaches to some errors.
#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}
