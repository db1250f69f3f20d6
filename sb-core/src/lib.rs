//! Burst correlation and per-conversation serialization core.
//!
//! Turns bursty inbound traffic into single combined backend requests,
//! guarantees at most one in-flight request per conversation, and
//! correlates operator-sent messages with the same conversation threads so
//! backend history stays consistent. Transport and backend I/O live behind
//! the collaborator traits in `sb-transport` / `sb-backend`.

mod aggregator;
mod bindings;
mod coalesce;
mod correlator;
mod dispatcher;
mod echo;
mod emitter;

pub use aggregator::{AggregatorConfig, InboundAggregator};
pub use bindings::{ThreadBinding, ThreadBindingRegistry};
pub use correlator::{CorrelatorConfig, ManualCorrelator};
pub use dispatcher::{DispatchTask, Dispatcher, DispatcherConfig, EnqueueOutcome, TaskPayload};
pub use echo::SelfEchoRegistry;
pub use emitter::{EmitterConfig, ResponseEmitter};
