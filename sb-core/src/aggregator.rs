//! Inbound burst aggregation.
//!
//! Consecutive messages from one conversation are buffered until the
//! conversation goes quiet for the debounce window, then flushed as a
//! single combined dispatch task. Each conversation runs its own timer;
//! a new message supersedes the pending one.

use crate::coalesce::CoalesceMap;
use crate::dispatcher::{DispatchTask, Dispatcher, TaskPayload};
use sb_transport::{ConversationId, MessageId};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Quiet period after which a buffered burst is flushed.
    pub debounce: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(6),
        }
    }
}

pub struct InboundAggregator {
    coalesce: Arc<CoalesceMap>,
    dispatcher: Arc<Dispatcher>,
    debounce: Duration,
}

impl InboundAggregator {
    pub fn new(cfg: AggregatorConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            coalesce: Arc::new(CoalesceMap::new()),
            dispatcher,
            debounce: cfg.debounce,
        }
    }

    /// Buffer one inbound message and (re)start the conversation's
    /// debounce timer.
    pub fn on_message(&self, conversation: &ConversationId, text: String, message_id: MessageId) {
        let epoch = self
            .coalesce
            .append(conversation, text, Some(message_id));
        tracing::debug!(
            conversation = %conversation,
            epoch,
            debounce_ms = self.debounce.as_millis() as u64,
            "inbound message buffered"
        );

        let coalesce = self.coalesce.clone();
        let dispatcher = self.dispatcher.clone();
        let conversation_key = conversation.clone();
        let debounce = self.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(burst) = coalesce.take_if_current(&conversation_key, epoch) else {
                return;
            };
            tracing::info!(
                conversation = %conversation_key,
                messages = burst.messages.len(),
                buffered_ms = burst.buffered_for.as_millis() as u64,
                "inbound burst flushed"
            );
            let reply_to = burst.reply_to.clone();
            dispatcher
                .enqueue(DispatchTask {
                    conversation: conversation_key,
                    payload: TaskPayload::UserTurn {
                        text: burst.combined_text(),
                        reply_to,
                    },
                })
                .await;
        });
        self.coalesce.store_timer(conversation, epoch, timer);
    }
}
