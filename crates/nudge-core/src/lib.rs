//! # Nudge Core
//!
//! Shared foundation for the Nudge scheduler: configuration, typed errors,
//! wire types, and the traits that external collaborators implement
//! (messaging channel, membership lookup).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NudgeConfig;
pub use error::{NudgeError, Result, SendError};
pub use traits::{Membership, Messenger};
pub use types::{DeliveryReceipt, OutboundMessage, ParseMode};
