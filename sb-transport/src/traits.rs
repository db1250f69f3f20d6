use crate::types::{ConversationId, InboundEvent, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique transport identifier: "whatsapp", "loopback".
    fn transport_id(&self) -> &str;

    /// Start receiving traffic. Push to tx for every event seen on the
    /// account, in both directions.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send a message to a conversation. Returns the provider message id,
    /// which callers record so the outgoing-event feed can recognize the
    /// send as our own.
    async fn send(&self, conversation: &ConversationId, message: OutboundMessage)
    -> Result<MessageId>;

    /// Signal "composing" presence where supported. Best-effort: failures
    /// are logged by callers, never fatal.
    async fn set_composing(
        &self,
        _conversation: &ConversationId,
        _in_reply_to: Option<&MessageId>,
    ) -> Result<()> {
        Err(anyhow::anyhow!(
            "composing presence is not supported by this transport"
        ))
    }

    fn supports_composing(&self) -> bool {
        false
    }
}
