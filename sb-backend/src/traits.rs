use crate::error::Result;
use crate::types::{AskReply, MessageRole, ThreadRef};
use async_trait::async_trait;

#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Run one combined user turn against the backend.
    ///
    /// An absent thread means the backend creates a new one; the reply
    /// always carries the thread reference to bind for the next turn.
    async fn ask(&self, thread: Option<&ThreadRef>, text: &str) -> Result<AskReply>;

    /// Append a message to an existing thread without running the model.
    /// Used to keep backend history consistent with operator interventions.
    /// Returns the backend message id.
    async fn append_message(
        &self,
        thread: &ThreadRef,
        role: MessageRole,
        text: &str,
    ) -> Result<String>;
}
