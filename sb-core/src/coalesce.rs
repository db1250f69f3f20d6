//! Debounced per-conversation message buffers.
//!
//! Shared by the inbound aggregator and the manual-message correlator,
//! which run the same coalescing pattern over independent maps. Appends
//! and flushes go through the entry lock of the backing map, so a flush
//! can never capture a buffer while an append for the same conversation
//! is mid-mutation.

use dashmap::DashMap;
use sb_transport::{ConversationId, MessageId};
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct PendingBuffer {
    messages: Vec<String>,
    reply_to: Option<MessageId>,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    created_at: Instant,
}

/// One flushed burst: the buffered messages in arrival order plus the most
/// recent reply context.
pub(crate) struct FlushedBurst {
    pub messages: Vec<String>,
    pub reply_to: Option<MessageId>,
    pub buffered_for: std::time::Duration,
}

impl FlushedBurst {
    pub fn combined_text(&self) -> String {
        self.messages.join("\n\n")
    }
}

#[derive(Default)]
pub(crate) struct CoalesceMap {
    buffers: DashMap<ConversationId, PendingBuffer>,
}

impl CoalesceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the conversation's buffer, replacing the stored
    /// reply context and superseding any armed timer. Returns the epoch a
    /// timer must present to `take_if_current` for its flush to count.
    pub fn append(
        &self,
        conversation: &ConversationId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> u64 {
        let mut buffer = self
            .buffers
            .entry(conversation.clone())
            .or_insert_with(|| PendingBuffer {
                messages: Vec::new(),
                reply_to: None,
                epoch: 0,
                timer: None,
                created_at: Instant::now(),
            });
        buffer.messages.push(text);
        if reply_to.is_some() {
            buffer.reply_to = reply_to;
        }
        buffer.epoch += 1;
        if let Some(previous) = buffer.timer.take() {
            previous.abort();
        }
        buffer.epoch
    }

    /// Attach the debounce timer armed for `epoch`. If a newer append has
    /// already superseded that epoch the handle is aborted on the spot.
    pub fn store_timer(&self, conversation: &ConversationId, epoch: u64, timer: JoinHandle<()>) {
        let Some(mut buffer) = self.buffers.get_mut(conversation) else {
            timer.abort();
            return;
        };
        if buffer.epoch == epoch {
            buffer.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Remove and return the buffer if `epoch` is still current. A stale
    /// epoch means another append restarted the window; the caller's timer
    /// simply gives up.
    pub fn take_if_current(
        &self,
        conversation: &ConversationId,
        epoch: u64,
    ) -> Option<FlushedBurst> {
        let (_, buffer) = self
            .buffers
            .remove_if(conversation, |_, buffer| buffer.epoch == epoch)?;
        Some(FlushedBurst {
            messages: buffer.messages,
            reply_to: buffer.reply_to,
            buffered_for: buffer.created_at.elapsed(),
        })
    }

    #[cfg(test)]
    pub fn pending_conversations(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> ConversationId {
        ConversationId::new(id)
    }

    #[tokio::test]
    async fn stale_epoch_does_not_flush() {
        let map = CoalesceMap::new();
        let first = map.append(&conv("c1"), "one".to_string(), None);
        let second = map.append(&conv("c1"), "two".to_string(), None);

        assert!(map.take_if_current(&conv("c1"), first).is_none());
        let burst = map
            .take_if_current(&conv("c1"), second)
            .expect("current epoch flushes");
        assert_eq!(burst.messages, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(map.pending_conversations(), 0);
    }

    #[tokio::test]
    async fn combined_text_joins_in_arrival_order() {
        let map = CoalesceMap::new();
        map.append(&conv("c1"), "Hola".to_string(), None);
        let epoch = map.append(&conv("c1"), "Quiero info".to_string(), None);

        let burst = map
            .take_if_current(&conv("c1"), epoch)
            .expect("flush current epoch");
        assert_eq!(burst.combined_text(), "Hola\n\nQuiero info");
    }

    #[tokio::test]
    async fn latest_reply_context_wins() {
        let map = CoalesceMap::new();
        map.append(&conv("c1"), "a".to_string(), Some(MessageId::new("m1")));
        let epoch = map.append(&conv("c1"), "b".to_string(), Some(MessageId::new("m2")));

        let burst = map
            .take_if_current(&conv("c1"), epoch)
            .expect("flush current epoch");
        assert_eq!(burst.reply_to, Some(MessageId::new("m2")));
    }

    #[tokio::test]
    async fn conversations_buffer_independently() {
        let map = CoalesceMap::new();
        let e1 = map.append(&conv("c1"), "uno".to_string(), None);
        let e2 = map.append(&conv("c2"), "dos".to_string(), None);

        assert!(map.take_if_current(&conv("c1"), e1).is_some());
        assert!(map.take_if_current(&conv("c2"), e2).is_some());
    }
}
