use dashmap::DashMap;
use sb_backend::ThreadRef;
use sb_transport::ConversationId;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ThreadBinding {
    pub thread: ThreadRef,
    pub last_bound_at: Instant,
}

/// Conversation → backend-thread bindings.
///
/// Overwritten on every successful backend call, read by the dispatcher
/// before each turn and by the correlator before injecting manual messages.
/// Bindings idle longer than the TTL are pruned opportunistically on write;
/// an evicted conversation simply starts a fresh thread on its next turn.
pub struct ThreadBindingRegistry {
    entries: DashMap<ConversationId, ThreadBinding>,
    idle_ttl: Duration,
}

impl ThreadBindingRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl,
        }
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<ThreadRef> {
        let binding = self.entries.get(conversation)?;
        if binding.last_bound_at.elapsed() > self.idle_ttl {
            return None;
        }
        Some(binding.thread.clone())
    }

    pub fn bind(&self, conversation: &ConversationId, thread: ThreadRef) {
        self.prune_expired();
        self.entries.insert(
            conversation.clone(),
            ThreadBinding {
                thread,
                last_bound_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune_expired(&self) {
        self.entries
            .retain(|_, binding| binding.last_bound_at.elapsed() <= self.idle_ttl);
    }
}
