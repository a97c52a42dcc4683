//! Wire types exchanged with messaging channels.

use serde::{Deserialize, Serialize};

/// Text formatting the channel should apply to a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    #[default]
    Markdown,
    Html,
    /// No formatting — send the body verbatim.
    Plain,
}

impl ParseMode {
    /// Telegram Bot API value, None for plain text.
    pub fn api_value(&self) -> Option<&'static str> {
        match self {
            ParseMode::Markdown => Some("Markdown"),
            ParseMode::Html => Some("HTML"),
            ParseMode::Plain => None,
        }
    }
}

/// One outbound message, addressed in the channel's own namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient key (for Telegram: the chat id as a string).
    pub recipient_id: String,
    pub text: String,
    #[serde(default)]
    pub parse_mode: ParseMode,
    /// Deliver without a client-side notification sound.
    #[serde(default)]
    pub silent: bool,
    /// Channel-specific keyboard/buttons payload, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<serde_json::Value>,
}

impl OutboundMessage {
    pub fn text(recipient_id: &str, text: &str) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            text: text.to_string(),
            parse_mode: ParseMode::default(),
            silent: false,
            reply_markup: None,
        }
    }
}

/// Proof of delivery returned by a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Channel-assigned message id.
    pub message_id: i64,
}
