use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle the backend uses to retain conversation history.
///
/// Issued by the backend, stored by the thread-binding registry, and never
/// inspected by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadRef(String);

impl ThreadRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadRef {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ThreadRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskReply {
    pub text: String,
    pub thread: ThreadRef,
}
