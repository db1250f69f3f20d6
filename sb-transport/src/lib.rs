//! Chat-transport collaborator for Switchboard.
//!
//! Adapters are pure I/O: they convert platform traffic to/from
//! `InboundEvent` / `OutboundMessage` and know nothing about buffering,
//! queueing, or the AI backend.

mod loopback;
mod traits;
mod types;
mod whatsapp;

pub use loopback::{LoopbackTransport, SentRecord};
pub use traits::Transport;
pub use types::{
    ConversationId, InboundEvent, InboundEventKind, MessageId, OutboundMessage, TargetKind,
};
pub use whatsapp::{WebhookPayload, WhatsAppCloudTransport, build_inbound_events};
