//! # Nudge Channels
//!
//! Messaging channel implementations. Each channel implements
//! [`nudge_core::Messenger`] and owns its transport handshake and error
//! classification.

pub mod telegram;

pub use telegram::{TelegramChannel, TelegramConfig};
