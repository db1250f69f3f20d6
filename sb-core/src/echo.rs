use dashmap::DashMap;
use sb_transport::MessageId;
use std::time::Duration;
use tokio::time::Instant;

/// Outbound message ids recently emitted by this process.
///
/// The outgoing-event feed carries every send on the account; ids recorded
/// here identify our own sends so the manual-message correlator only reacts
/// to operator-authored traffic. Entries expire after a bounded retention
/// window and are evicted eagerly on both record and lookup.
pub struct SelfEchoRegistry {
    entries: DashMap<MessageId, Instant>,
    retention: Duration,
}

impl SelfEchoRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    pub fn record(&self, message_id: MessageId) {
        self.prune();
        self.entries.insert(message_id, Instant::now());
    }

    /// Whether `message_id` was one of our own sends. A hit consumes the
    /// entry; each outbound id is echoed back by the transport at most once.
    pub fn observe(&self, message_id: &MessageId) -> bool {
        match self.entries.remove(message_id) {
            Some((_, recorded_at)) => recorded_at.elapsed() <= self.retention,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&self) {
        self.entries
            .retain(|_, recorded_at| recorded_at.elapsed() <= self.retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorded_ids_are_observed_once() {
        let registry = SelfEchoRegistry::new(Duration::from_secs(300));
        registry.record(MessageId::new("m1"));

        assert!(registry.observe(&MessageId::new("m1")));
        assert!(!registry.observe(&MessageId::new("m1")));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_self_echoes() {
        let registry = SelfEchoRegistry::new(Duration::from_secs(300));
        assert!(!registry.observe(&MessageId::new("m-unknown")));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_retention_window() {
        let registry = SelfEchoRegistry::new(Duration::from_secs(300));
        registry.record(MessageId::new("m1"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!registry.observe(&MessageId::new("m1")));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_pruned_on_record() {
        let registry = SelfEchoRegistry::new(Duration::from_secs(300));
        registry.record(MessageId::new("m1"));

        tokio::time::advance(Duration::from_secs(301)).await;
        registry.record(MessageId::new("m2"));
        assert_eq!(registry.len(), 1);
    }
}
