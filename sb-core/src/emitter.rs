//! Response delivery: split a completed backend reply into bounded chunks
//! and pace them through the transport like a human typing.

use crate::echo::SelfEchoRegistry;
use sb_transport::{ConversationId, MessageId, OutboundMessage, Transport};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Maximum characters per outbound chunk.
    pub max_chunk_chars: usize,
    /// Maximum lines per outbound chunk.
    pub max_chunk_lines: usize,
    /// Pause between consecutive chunks.
    pub pacing: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1000,
            max_chunk_lines: 12,
            pacing: Duration::from_millis(150),
        }
    }
}

pub struct ResponseEmitter {
    transport: Arc<dyn Transport>,
    echoes: Arc<SelfEchoRegistry>,
    cfg: EmitterConfig,
}

impl ResponseEmitter {
    pub fn new(
        cfg: EmitterConfig,
        transport: Arc<dyn Transport>,
        echoes: Arc<SelfEchoRegistry>,
    ) -> Self {
        Self {
            transport,
            echoes,
            cfg,
        }
    }

    /// Send `text` to the conversation in paced chunks.
    ///
    /// Every id the transport mints is recorded in the self-echo registry
    /// before the next chunk goes out, so the outgoing-event feed can never
    /// observe one of our sends ahead of its registration. Send failures
    /// are logged and the remaining chunks continue.
    #[tracing::instrument(level = "info", skip_all, fields(conversation = %conversation))]
    pub async fn emit(
        &self,
        conversation: &ConversationId,
        text: &str,
        in_reply_to: Option<&MessageId>,
    ) {
        let chunks = split_for_delivery(text, self.cfg.max_chunk_chars, self.cfg.max_chunk_lines);
        if chunks.is_empty() {
            tracing::debug!("empty response, nothing to emit");
            return;
        }

        if self.transport.supports_composing() {
            if let Err(error) = self.transport.set_composing(conversation, in_reply_to).await {
                tracing::warn!(%error, "composing signal failed; continuing");
            }
        }

        let chunk_count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.cfg.pacing).await;
            }
            let message = OutboundMessage {
                content: chunk,
                reply_to_message_id: if index == 0 {
                    in_reply_to.cloned()
                } else {
                    None
                },
            };
            match self.transport.send(conversation, message).await {
                Ok(message_id) => {
                    self.echoes.record(message_id);
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        chunk_index = index,
                        chunk_count,
                        "chunk send failed; continuing with remaining chunks"
                    );
                }
            }
        }
    }
}

/// Split a reply on paragraph boundaries first, then break any paragraph
/// over budget at sentence boundaries, falling back to a hard cut when a
/// single sentence exceeds the budget on its own. Within one paragraph the
/// produced chunks concatenate back to the original text.
fn split_for_delivery(text: &str, max_chars: usize, max_lines: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for paragraph in text.split("\n\n") {
        if paragraph.trim().is_empty() {
            continue;
        }
        if !over_budget(paragraph, max_chars, max_lines) {
            chunks.push(paragraph.to_string());
            continue;
        }
        split_paragraph(paragraph, max_chars, max_lines, &mut chunks);
    }
    chunks
}

fn over_budget(text: &str, max_chars: usize, max_lines: usize) -> bool {
    text.chars().count() > max_chars || text.lines().count() > max_lines
}

fn split_paragraph(paragraph: &str, max_chars: usize, max_lines: usize, out: &mut Vec<String>) {
    let mut current = String::new();
    let mut current_chars = 0usize;
    let mut current_newlines = 0usize;

    for segment in sentence_segments(paragraph) {
        let segment_chars = segment.chars().count();
        let segment_newlines = segment.matches('\n').count();

        if segment_chars > max_chars || segment_newlines >= max_lines {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
                current_chars = 0;
                current_newlines = 0;
            }
            hard_split(segment, max_chars, max_lines, out);
            continue;
        }

        let fits = current_chars + segment_chars <= max_chars
            && current_newlines + segment_newlines < max_lines;
        if !current.is_empty() && !fits {
            out.push(std::mem::take(&mut current));
            current_chars = 0;
            current_newlines = 0;
        }
        current.push_str(segment);
        current_chars += segment_chars;
        current_newlines += segment_newlines;
    }

    if !current.is_empty() {
        out.push(current);
    }
}

/// Cut sentence boundaries after `.`, `!`, `?` or `…` followed by
/// whitespace; the whitespace stays attached to the preceding segment so
/// concatenating the segments reproduces the input exactly.
fn sentence_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut saw_terminator = false;
    let mut saw_whitespace = false;

    for (index, ch) in text.char_indices() {
        if saw_terminator && saw_whitespace && !ch.is_whitespace() {
            segments.push(&text[start..index]);
            start = index;
            saw_terminator = false;
            saw_whitespace = false;
        }
        if matches!(ch, '.' | '!' | '?' | '…') {
            saw_terminator = true;
            saw_whitespace = false;
        } else if ch.is_whitespace() {
            if saw_terminator {
                saw_whitespace = true;
            }
        } else {
            saw_terminator = false;
            saw_whitespace = false;
        }
    }
    if start < text.len() {
        segments.push(&text[start..]);
    }
    segments
}

/// Last resort for a single oversized sentence: cut at character
/// boundaries, also breaking when the line budget fills up.
fn hard_split(text: &str, max_chars: usize, max_lines: usize, out: &mut Vec<String>) {
    let mut current = String::new();
    let mut current_chars = 0usize;
    let mut current_newlines = 0usize;

    for ch in text.chars() {
        current.push(ch);
        current_chars += 1;
        if ch == '\n' {
            current_newlines += 1;
        }
        if current_chars >= max_chars || current_newlines >= max_lines {
            out.push(std::mem::take(&mut current));
            current_chars = 0;
            current_newlines = 0;
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
}
