//! Manual-message correlation.
//!
//! The transport's outgoing-event feed carries every send on the account:
//! this process's own replies and anything a human operator sends from a
//! paired device. Self echoes are filtered through the echo registry; what
//! remains is operator traffic, which is debounced like inbound bursts and
//! injected into the conversation's backend thread so history reflects the
//! intervention.

use crate::bindings::ThreadBindingRegistry;
use crate::coalesce::CoalesceMap;
use crate::dispatcher::{DispatchTask, Dispatcher, TaskPayload};
use crate::echo::SelfEchoRegistry;
use sb_transport::{InboundEvent, InboundEventKind, TargetKind};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Quiet period after which buffered operator messages are injected.
    pub debounce: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(6),
        }
    }
}

pub struct ManualCorrelator {
    coalesce: Arc<CoalesceMap>,
    bindings: Arc<ThreadBindingRegistry>,
    dispatcher: Arc<Dispatcher>,
    echoes: Arc<SelfEchoRegistry>,
    debounce: Duration,
}

impl ManualCorrelator {
    pub fn new(
        cfg: CorrelatorConfig,
        bindings: Arc<ThreadBindingRegistry>,
        dispatcher: Arc<Dispatcher>,
        echoes: Arc<SelfEchoRegistry>,
    ) -> Self {
        Self {
            coalesce: Arc::new(CoalesceMap::new()),
            bindings,
            dispatcher,
            echoes,
            debounce: cfg.debounce,
        }
    }

    /// Handle one event from the outgoing side of the account feed.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %event.conversation))]
    pub fn on_outgoing_event(&self, event: &InboundEvent) {
        if event.kind != InboundEventKind::Message {
            return;
        }
        if self.echoes.observe(&event.message_id) {
            tracing::debug!(message_id = %event.message_id, "own send echoed back, ignoring");
            return;
        }
        if event.target != TargetKind::Direct {
            tracing::debug!(target = ?event.target, "outgoing event to non-conversation target, ignoring");
            return;
        }
        if event.content.trim().is_empty() {
            return;
        }
        if self.bindings.get(&event.conversation).is_none() {
            // In-memory bindings only exist after a first user exchange, so
            // earlier manual messages cannot be correlated to a thread.
            tracing::warn!(
                message_id = %event.message_id,
                "manual message before any user exchange, dropping"
            );
            return;
        }

        let epoch = self
            .coalesce
            .append(&event.conversation, event.content.clone(), None);
        tracing::debug!(epoch, "manual message buffered");

        let coalesce = self.coalesce.clone();
        let dispatcher = self.dispatcher.clone();
        let conversation = event.conversation.clone();
        let debounce = self.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(burst) = coalesce.take_if_current(&conversation, epoch) else {
                return;
            };
            tracing::info!(
                conversation = %conversation,
                messages = burst.messages.len(),
                buffered_ms = burst.buffered_for.as_millis() as u64,
                "manual burst flushed"
            );
            dispatcher
                .enqueue(DispatchTask {
                    conversation,
                    payload: TaskPayload::ManualNote {
                        text: burst.combined_text(),
                    },
                })
                .await;
        });
        self.coalesce.store_timer(&event.conversation, epoch, timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::emitter::{EmitterConfig, ResponseEmitter};
    use chrono::Utc;
    use sb_backend::{AskReply, ConversationBackend, MessageRole, ThreadRef};
    use sb_transport::{ConversationId, LoopbackTransport, MessageId, OutboundMessage, Transport};
    use std::sync::Mutex;

    struct RecordingBackend {
        appends: Mutex<Vec<(ThreadRef, MessageRole, String)>>,
    }

    #[async_trait::async_trait]
    impl ConversationBackend for RecordingBackend {
        async fn ask(
            &self,
            _thread: Option<&ThreadRef>,
            _text: &str,
        ) -> sb_backend::Result<AskReply> {
            Ok(AskReply {
                text: "ok".to_string(),
                thread: ThreadRef::new("thread-1"),
            })
        }

        async fn append_message(
            &self,
            thread: &ThreadRef,
            role: MessageRole,
            text: &str,
        ) -> sb_backend::Result<String> {
            self.appends
                .lock()
                .expect("appends lock")
                .push((thread.clone(), role, text.to_string()));
            Ok("backend-msg-1".to_string())
        }
    }

    struct Harness {
        correlator: ManualCorrelator,
        bindings: Arc<ThreadBindingRegistry>,
        echoes: Arc<SelfEchoRegistry>,
        backend: Arc<RecordingBackend>,
        transport: Arc<LoopbackTransport>,
        emitter: Arc<ResponseEmitter>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(RecordingBackend {
            appends: Mutex::new(Vec::new()),
        });
        let transport = Arc::new(LoopbackTransport::new());
        let echoes = Arc::new(SelfEchoRegistry::new(Duration::from_secs(300)));
        let emitter = Arc::new(ResponseEmitter::new(
            EmitterConfig::default(),
            transport.clone(),
            echoes.clone(),
        ));
        let bindings = Arc::new(ThreadBindingRegistry::new(Duration::from_secs(3600)));
        let dispatcher = Dispatcher::new(
            DispatcherConfig::default(),
            bindings.clone(),
            backend.clone(),
            emitter.clone(),
        );
        Harness {
            correlator: ManualCorrelator::new(
                CorrelatorConfig::default(),
                bindings.clone(),
                dispatcher,
                echoes.clone(),
            ),
            bindings,
            echoes,
            backend,
            transport,
            emitter,
        }
    }

    fn outgoing(conversation: &str, message_id: &str, content: &str) -> InboundEvent {
        InboundEvent {
            kind: InboundEventKind::Message,
            message_id: MessageId::new(message_id),
            conversation: ConversationId::new(conversation),
            target: TargetKind::Direct,
            sender_is_self: true,
            content: content.to_string(),
            received_at: Utc::now(),
        }
    }

    fn appends(h: &Harness) -> Vec<(ThreadRef, MessageRole, String)> {
        h.backend.appends.lock().expect("appends lock").clone()
    }

    #[tokio::test(start_paused = true)]
    async fn manual_burst_is_appended_to_the_bound_thread() {
        let h = harness();
        h.bindings
            .bind(&ConversationId::new("c1"), ThreadRef::new("thread-1"));

        h.correlator
            .on_outgoing_event(&outgoing("c1", "op-1", "checking in personally"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.correlator
            .on_outgoing_event(&outgoing("c1", "op-2", "will call you tomorrow"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        let appends = appends(&h);
        assert_eq!(appends.len(), 1);
        assert_eq!(appends[0].0, ThreadRef::new("thread-1"));
        assert_eq!(appends[0].1, MessageRole::Assistant);
        assert_eq!(
            appends[0].2,
            "checking in personally\n\nwill call you tomorrow"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_message_before_any_exchange_is_dropped() {
        let h = harness();

        h.correlator
            .on_outgoing_event(&outgoing("c1", "op-1", "hello?"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(appends(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn own_emitted_sends_are_never_treated_as_manual() {
        let h = harness();
        let conversation = ConversationId::new("c1");
        h.bindings.bind(&conversation, ThreadRef::new("thread-1"));

        // Emit a reply, then replay its transport record through the
        // correlator the way the outgoing-event feed would.
        h.emitter.emit(&conversation, "automated reply", None).await;
        let sent = h.transport.sent_to(&conversation);
        assert_eq!(sent.len(), 1);

        h.correlator.on_outgoing_event(&outgoing(
            "c1",
            sent[0].message_id.as_str(),
            "automated reply",
        ));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(appends(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_conversation_targets_are_ignored() {
        let h = harness();
        h.bindings
            .bind(&ConversationId::new("status"), ThreadRef::new("thread-1"));

        let mut event = outgoing("status", "op-1", "story update");
        event.target = TargetKind::Broadcast;
        h.correlator.on_outgoing_event(&event);

        let mut group = outgoing("group-1", "op-2", "hi all");
        group.target = TargetKind::Group;
        h.correlator.on_outgoing_event(&group);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(appends(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bodies_are_ignored() {
        let h = harness();
        h.bindings
            .bind(&ConversationId::new("c1"), ThreadRef::new("thread-1"));

        h.correlator.on_outgoing_event(&outgoing("c1", "op-1", "   "));
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(appends(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn echo_suppression_consumes_the_recorded_id() {
        let h = harness();
        let conversation = ConversationId::new("c1");
        h.bindings.bind(&conversation, ThreadRef::new("thread-1"));

        let message_id = h
            .transport
            .send(
                &conversation,
                OutboundMessage {
                    content: "hola".to_string(),
                    reply_to_message_id: None,
                },
            )
            .await
            .expect("loopback send");
        h.echoes.record(message_id.clone());

        h.correlator
            .on_outgoing_event(&outgoing("c1", message_id.as_str(), "hola"));
        assert!(h.echoes.is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(appends(&h).is_empty());
    }
}
