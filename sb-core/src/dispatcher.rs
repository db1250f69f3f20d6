//! Per-conversation dispatch lanes.
//!
//! Each conversation gets a FIFO queue drained by at most one task at a
//! time; cross-conversation lanes run fully independently. Manual-message
//! injections ride the same lanes as automated turns, which is what gives
//! the correlator the dispatcher's lock discipline.

use crate::bindings::ThreadBindingRegistry;
use crate::emitter::ResponseEmitter;
use dashmap::DashMap;
use sb_backend::{ConversationBackend, MessageRole};
use sb_transport::{ConversationId, MessageId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pause between successive backend calls on the same conversation.
    pub cooldown: Duration,
    /// Total tries per task, first attempt included.
    pub max_attempts: u32,
    /// Queued tasks per conversation before new bursts are rejected.
    pub max_queue: usize,
    /// Notice sent when a user burst is rejected for backpressure.
    pub busy_notice: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3),
            max_attempts: 3,
            max_queue: 8,
            busy_notice:
                "Still working through your previous messages, one moment please.".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// An aggregated user burst: ask the backend and emit the reply.
    UserTurn {
        text: String,
        reply_to: Option<MessageId>,
    },
    /// An operator message to append to backend history. Single attempt,
    /// no reply expected.
    ManualNote { text: String },
}

#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub conversation: ConversationId,
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Rejected,
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<DispatchTask>,
    locked: bool,
}

pub struct Dispatcher {
    lanes: DashMap<ConversationId, Lane>,
    bindings: Arc<ThreadBindingRegistry>,
    backend: Arc<dyn ConversationBackend>,
    emitter: Arc<ResponseEmitter>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatcherConfig,
        bindings: Arc<ThreadBindingRegistry>,
        backend: Arc<dyn ConversationBackend>,
        emitter: Arc<ResponseEmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            lanes: DashMap::new(),
            bindings,
            backend,
            emitter,
            cfg,
        })
    }

    /// Append a task to its conversation's lane and start draining if no
    /// drain task currently holds the lane.
    pub async fn enqueue(self: Arc<Self>, task: DispatchTask) -> EnqueueOutcome {
        let conversation = task.conversation.clone();
        let rejected_reply_to = match &task.payload {
            TaskPayload::UserTurn { reply_to, .. } => reply_to.clone(),
            TaskPayload::ManualNote { .. } => None,
        };
        let is_user_turn = matches!(task.payload, TaskPayload::UserTurn { .. });

        let start_drain = {
            let mut lane = self.lanes.entry(conversation.clone()).or_default();
            if lane.queue.len() >= self.cfg.max_queue {
                drop(lane);
                tracing::warn!(
                    conversation = %conversation,
                    max_queue = self.cfg.max_queue,
                    is_user_turn,
                    "lane full, rejecting task"
                );
                if is_user_turn {
                    self.emitter
                        .emit(
                            &conversation,
                            &self.cfg.busy_notice,
                            rejected_reply_to.as_ref(),
                        )
                        .await;
                }
                return EnqueueOutcome::Rejected;
            }
            lane.queue.push_back(task);
            if lane.locked {
                false
            } else {
                lane.locked = true;
                true
            }
        };

        if start_drain {
            let this = self.clone();
            tokio::spawn(async move {
                this.drain(conversation).await;
            });
        }
        EnqueueOutcome::Accepted
    }

    /// Drain the conversation's lane while holding its lock. Exactly one
    /// drain task runs per conversation at any instant.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation = %conversation))]
    async fn drain(self: Arc<Self>, conversation: ConversationId) {
        loop {
            let next = {
                let Some(mut lane) = self.lanes.get_mut(&conversation) else {
                    return;
                };
                match lane.queue.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        // Unlock atomically with observing the empty queue;
                        // a concurrent enqueue now starts its own drain.
                        lane.locked = false;
                        None
                    }
                }
            };

            let Some(task) = next else {
                self.lanes
                    .remove_if(&conversation, |_, lane| {
                        !lane.locked && lane.queue.is_empty()
                    });
                return;
            };

            self.process(task).await;

            let more_queued = self
                .lanes
                .get(&conversation)
                .map(|lane| !lane.queue.is_empty())
                .unwrap_or(false);
            if more_queued {
                tokio::time::sleep(self.cfg.cooldown).await;
            }
        }
    }

    async fn process(&self, task: DispatchTask) {
        match task.payload {
            TaskPayload::UserTurn { text, reply_to } => {
                self.process_user_turn(&task.conversation, &text, reply_to.as_ref())
                    .await;
            }
            TaskPayload::ManualNote { text } => {
                self.process_manual_note(&task.conversation, &text).await;
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation = %conversation))]
    async fn process_user_turn(
        &self,
        conversation: &ConversationId,
        text: &str,
        reply_to: Option<&MessageId>,
    ) {
        let mut attempt = 0u32;
        loop {
            let thread = self.bindings.get(conversation);
            match self.backend.ask(thread.as_ref(), text).await {
                Ok(reply) => {
                    self.bindings.bind(conversation, reply.thread);
                    self.emitter.emit(conversation, &reply.text, reply_to).await;
                    return;
                }
                Err(error) if error.is_retryable() && attempt + 1 < self.cfg.max_attempts => {
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        %error,
                        attempt,
                        max_attempts = self.cfg.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "backend call failed; retrying same task"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::error!(
                        %error,
                        attempts = attempt + 1,
                        "backend call failed; dropping task"
                    );
                    return;
                }
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation = %conversation))]
    async fn process_manual_note(&self, conversation: &ConversationId, text: &str) {
        let Some(thread) = self.bindings.get(conversation) else {
            tracing::warn!("manual note has no thread binding; dropping");
            return;
        };
        match self
            .backend
            .append_message(&thread, MessageRole::Assistant, text)
            .await
        {
            Ok(message_id) => {
                tracing::debug!(%message_id, "manual note appended to backend thread");
            }
            Err(error) => {
                tracing::warn!(%error, "manual note append failed; dropping");
            }
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

/// Backoff before retry `attempt`: 2^n seconds, shift-capped so the delay
/// can never overflow however the attempt cap is configured.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::SelfEchoRegistry;
    use crate::emitter::EmitterConfig;
    use sb_backend::{AskReply, BackendError, ThreadRef};
    use sb_transport::LoopbackTransport;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBackend {
        ask_outcomes: Mutex<VecDeque<sb_backend::Result<AskReply>>>,
        asks: AtomicUsize,
        appends: Mutex<Vec<(ThreadRef, String)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedBackend {
        fn new(outcomes: Vec<sb_backend::Result<AskReply>>) -> Arc<Self> {
            Arc::new(Self {
                ask_outcomes: Mutex::new(outcomes.into()),
                asks: AtomicUsize::new(0),
                appends: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                latency: Duration::from_millis(200),
            })
        }

        fn reply(thread: &str, text: &str) -> sb_backend::Result<AskReply> {
            Ok(AskReply {
                text: text.to_string(),
                thread: ThreadRef::new(thread),
            })
        }
    }

    #[async_trait::async_trait]
    impl ConversationBackend for ScriptedBackend {
        async fn ask(
            &self,
            _thread: Option<&ThreadRef>,
            _text: &str,
        ) -> sb_backend::Result<AskReply> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.asks.fetch_add(1, Ordering::SeqCst);
            self.ask_outcomes
                .lock()
                .expect("ask outcomes lock")
                .pop_front()
                .unwrap_or_else(|| Self::reply("thread-default", "ok"))
        }

        async fn append_message(
            &self,
            thread: &ThreadRef,
            _role: MessageRole,
            text: &str,
        ) -> sb_backend::Result<String> {
            self.appends
                .lock()
                .expect("appends lock")
                .push((thread.clone(), text.to_string()));
            Ok(format!("backend-msg-{}", text.len()))
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        backend: Arc<ScriptedBackend>,
        bindings: Arc<ThreadBindingRegistry>,
        transport: Arc<LoopbackTransport>,
    }

    fn harness(cfg: DispatcherConfig, backend: Arc<ScriptedBackend>) -> Harness {
        let bindings = Arc::new(ThreadBindingRegistry::new(Duration::from_secs(3600)));
        let transport = Arc::new(LoopbackTransport::new());
        let echoes = Arc::new(SelfEchoRegistry::new(Duration::from_secs(300)));
        let emitter = Arc::new(ResponseEmitter::new(
            EmitterConfig::default(),
            transport.clone(),
            echoes,
        ));
        let dispatcher = Dispatcher::new(cfg, bindings.clone(), backend.clone(), emitter);
        Harness {
            dispatcher,
            backend,
            bindings,
            transport,
        }
    }

    fn user_turn(conversation: &str, text: &str) -> DispatchTask {
        DispatchTask {
            conversation: ConversationId::new(conversation),
            payload: TaskPayload::UserTurn {
                text: text.to_string(),
                reply_to: None,
            },
        }
    }

    fn manual_note(conversation: &str, text: &str) -> DispatchTask {
        DispatchTask {
            conversation: ConversationId::new(conversation),
            payload: TaskPayload::ManualNote {
                text: text.to_string(),
            },
        }
    }

    async fn settle() {
        // Paused-clock runs: sleeping walks every pending timer forward.
        tokio::time::sleep(Duration::from_secs(120)).await;
    }

    #[test]
    fn retry_delays_strictly_increase_and_cap() {
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(3), Duration::from_secs(8));
        assert!(retry_delay(1) < retry_delay(2));
        assert!(retry_delay(2) < retry_delay(3));
        assert_eq!(retry_delay(100), retry_delay(6));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_turn_binds_thread_and_emits_reply() {
        let backend = ScriptedBackend::new(vec![ScriptedBackend::reply("thread-1", "respuesta")]);
        let h = harness(DispatcherConfig::default(), backend);

        h.dispatcher
            .clone()
            .enqueue(user_turn("c1", "Hola\n\nQuiero info"))
            .await;
        settle().await;

        assert_eq!(
            h.bindings.get(&ConversationId::new("c1")),
            Some(ThreadRef::new("thread-1"))
        );
        let sent = h.transport.sent_to(&ConversationId::new("c1"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "respuesta");
        assert_eq!(h.dispatcher.lane_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_conversation_tasks_never_overlap() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::reply("thread-1", "uno"),
            ScriptedBackend::reply("thread-1", "dos"),
            ScriptedBackend::reply("thread-1", "tres"),
        ]);
        let h = harness(DispatcherConfig::default(), backend);

        for text in ["a", "b", "c"] {
            h.dispatcher.clone().enqueue(user_turn("c1", text)).await;
        }
        settle().await;

        assert_eq!(h.backend.asks.load(Ordering::SeqCst), 3);
        assert_eq!(h.backend.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.sent_to(&ConversationId::new("c1")).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_conversations_run_concurrently() {
        let backend = ScriptedBackend::new(vec![
            ScriptedBackend::reply("t", "r1"),
            ScriptedBackend::reply("t", "r2"),
            ScriptedBackend::reply("t", "r3"),
        ]);
        let h = harness(DispatcherConfig::default(), backend);

        h.dispatcher.clone().enqueue(user_turn("c1", "a")).await;
        h.dispatcher.clone().enqueue(user_turn("c2", "b")).await;
        h.dispatcher.clone().enqueue(user_turn("c3", "c")).await;
        settle().await;

        assert!(h.backend.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_retry_same_task_until_capped() {
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::ConcurrentRunActive),
            Err(BackendError::ConcurrentRunActive),
            ScriptedBackend::reply("thread-1", "finally"),
        ]);
        let h = harness(DispatcherConfig::default(), backend);

        h.dispatcher.clone().enqueue(user_turn("c1", "hola")).await;
        settle().await;

        assert_eq!(h.backend.asks.load(Ordering::SeqCst), 3);
        let sent = h.transport.sent_to(&ConversationId::new("c1"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "finally");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_the_task_and_move_on() {
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::ConcurrentRunActive),
            Err(BackendError::ConcurrentRunActive),
            Err(BackendError::ConcurrentRunActive),
            ScriptedBackend::reply("thread-1", "next task"),
        ]);
        let h = harness(DispatcherConfig::default(), backend);

        h.dispatcher.clone().enqueue(user_turn("c1", "first")).await;
        h.dispatcher.clone().enqueue(user_turn("c1", "second")).await;
        settle().await;

        // Three tries for the first task, one for the second.
        assert_eq!(h.backend.asks.load(Ordering::SeqCst), 4);
        let sent = h.transport.sent_to(&ConversationId::new("c1"));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "next task");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failures_are_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Unclassified(
            "assistant missing".to_string(),
        ))]);
        let h = harness(DispatcherConfig::default(), backend);

        h.dispatcher.clone().enqueue(user_turn("c1", "hola")).await;
        settle().await;

        assert_eq!(h.backend.asks.load(Ordering::SeqCst), 1);
        assert!(h.transport.sent_to(&ConversationId::new("c1")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_lane_rejects_user_turns_with_notice() {
        let cfg = DispatcherConfig {
            max_queue: 1,
            ..DispatcherConfig::default()
        };
        let backend = ScriptedBackend::new(vec![]);
        let h = harness(cfg, backend);

        // First task locks the lane and starts processing; the second
        // fills the queue; the third must be rejected.
        h.dispatcher.clone().enqueue(user_turn("c1", "a")).await;
        tokio::task::yield_now().await;
        let second = h.dispatcher.clone().enqueue(user_turn("c1", "b")).await;
        let third = h.dispatcher.clone().enqueue(user_turn("c1", "c")).await;
        assert_eq!(second, EnqueueOutcome::Accepted);
        assert_eq!(third, EnqueueOutcome::Rejected);
        settle().await;

        let sent = h.transport.sent_to(&ConversationId::new("c1"));
        assert!(
            sent.iter()
                .any(|record| record.content.contains("one moment")),
            "busy notice should be sent"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_note_appends_to_bound_thread() {
        let backend = ScriptedBackend::new(vec![]);
        let h = harness(DispatcherConfig::default(), backend);
        h.bindings
            .bind(&ConversationId::new("c1"), ThreadRef::new("thread-1"));

        h.dispatcher
            .clone()
            .enqueue(manual_note("c1", "operator says hi"))
            .await;
        settle().await;

        let appends = h.backend.appends.lock().expect("appends lock");
        assert_eq!(appends.len(), 1);
        assert_eq!(appends[0].0, ThreadRef::new("thread-1"));
        assert_eq!(appends[0].1, "operator says hi");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_note_without_binding_is_dropped() {
        let backend = ScriptedBackend::new(vec![]);
        let h = harness(DispatcherConfig::default(), backend);

        h.dispatcher
            .clone()
            .enqueue(manual_note("c1", "too early"))
            .await;
        settle().await;

        assert!(h.backend.appends.lock().expect("appends lock").is_empty());
        assert_eq!(h.dispatcher.lane_count(), 0);
    }
}
