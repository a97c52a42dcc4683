//! Collaborator traits — the narrow seams to the rest of the product.

use async_trait::async_trait;

use crate::error::{Result, SendError};
use crate::types::{DeliveryReceipt, OutboundMessage};

/// A messaging channel capable of delivering one message to one recipient.
///
/// Implementations own the transport handshake and must map their failures
/// onto [`SendError`] so callers can classify retryability.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Channel name ("telegram").
    fn name(&self) -> &str;

    /// Verify the channel is reachable and credentials work.
    async fn probe(&self) -> Result<()>;

    /// Deliver one message and return the channel's receipt.
    async fn send(&self, message: OutboundMessage)
    -> std::result::Result<DeliveryReceipt, SendError>;
}

/// Membership lookup — expands audience packs to concrete user ids.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Return the member user ids of the given packs, in any order.
    /// Unknown pack ids resolve to no members, not an error.
    async fn members_of(&self, pack_ids: &[String]) -> Result<Vec<String>>;
}
