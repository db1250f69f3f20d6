use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ConversationId);

impl ConversationId {
    /// Canonicalize a raw transport address.
    ///
    /// WhatsApp-style JIDs carry a server suffix and, on multi-device
    /// accounts, a device part: `4915112345678:12@s.whatsapp.net`. Every
    /// registry in the core is keyed on the short form (`4915112345678`),
    /// so all variants of one counterpart land in the same conversation.
    pub fn from_address(raw: &str) -> Self {
        let local = raw.split('@').next().unwrap_or(raw);
        let local = local.split(':').next().unwrap_or(local);
        Self::new(local.trim())
    }
}

/// Classification of a raw transport address.
///
/// Only `Direct` targets participate in aggregation and manual-message
/// correlation; group and broadcast/status traffic is dropped at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Direct,
    Group,
    Broadcast,
}

impl TargetKind {
    pub fn classify(raw_address: &str) -> Self {
        let addr = raw_address.trim();
        if addr.ends_with("@g.us") {
            return Self::Group;
        }
        if addr.ends_with("@broadcast") {
            return Self::Broadcast;
        }
        Self::Direct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundEventKind {
    Message,
    Reaction,
}

/// One message observed on the account, in either direction.
///
/// `sender_is_self` is true for traffic sent from the account itself: both
/// this process's own sends and anything a human operator sends through a
/// paired device. Telling those two apart is the self-echo registry's job,
/// not the transport's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: InboundEventKind,
    pub message_id: MessageId,
    pub conversation: ConversationId,
    pub target: TargetKind,
    pub sender_is_self: bool,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}
