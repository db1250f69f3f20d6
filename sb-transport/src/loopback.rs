use crate::traits::Transport;
use crate::types::{ConversationId, InboundEvent, MessageId, OutboundMessage};
use anyhow::Result;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// In-memory transport used by tests and local development.
///
/// Records every send and presence signal instead of talking to a network.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<SentRecord>>,
    composing_signals: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub conversation: ConversationId,
    pub message_id: MessageId,
    pub content: String,
    pub reply_to_message_id: Option<MessageId>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().expect("loopback sent lock").clone()
    }

    pub fn sent_to(&self, conversation: &ConversationId) -> Vec<SentRecord> {
        self.sent()
            .into_iter()
            .filter(|record| &record.conversation == conversation)
            .collect()
    }

    pub fn composing_signals(&self) -> usize {
        self.composing_signals.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    fn transport_id(&self) -> &str {
        "loopback"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        // Tests inject events directly on the gateway channel.
        Ok(())
    }

    async fn send(
        &self,
        conversation: &ConversationId,
        message: OutboundMessage,
    ) -> Result<MessageId> {
        let message_id = MessageId::new(format!("loopback-{}", Uuid::new_v4()));
        self.sent.lock().expect("loopback sent lock").push(SentRecord {
            conversation: conversation.clone(),
            message_id: message_id.clone(),
            content: message.content,
            reply_to_message_id: message.reply_to_message_id,
        });
        Ok(message_id)
    }

    async fn set_composing(
        &self,
        _conversation: &ConversationId,
        _in_reply_to: Option<&MessageId>,
    ) -> Result<()> {
        self.composing_signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_composing(&self) -> bool {
        true
    }
}
