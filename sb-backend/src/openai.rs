use crate::error::{BackendError, Result};
use crate::traits::ConversationBackend;
use crate::types::{AskReply, MessageRole, ThreadRef};
use serde::Deserialize;
use std::time::{Duration, Instant};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const ASSISTANTS_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// OpenAI Assistants-style backend: one remote thread per conversation,
/// `ask` = add message + run + poll + fetch reply.
#[derive(Clone)]
pub struct AssistantBackend {
    http: reqwest::Client,
    api_key: String,
    assistant_id: String,
    base_url: String,
    run_timeout: Duration,
    poll_interval: Duration,
}

impl AssistantBackend {
    pub fn new(api_key: &str, assistant_id: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(BackendError::Unclassified(
                "backend api key is required".to_string(),
            ));
        }
        let assistant_id = assistant_id.trim();
        if assistant_id.is_empty() {
            return Err(BackendError::Unclassified(
                "backend assistant id is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            assistant_id: assistant_id.to_string(),
            base_url: OPENAI_API_BASE.to_string(),
            run_timeout: DEFAULT_RUN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<String> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_api_error(status, &text));
        }
        Ok(text)
    }

    async fn get_json(&self, path: &str) -> Result<String> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_api_error(status, &text));
        }
        Ok(text)
    }

    async fn create_thread(&self) -> Result<ThreadRef> {
        let body = self.post_json("/threads", &serde_json::json!({})).await?;
        let created: ObjectWithId = serde_json::from_str(&body)?;
        Ok(ThreadRef::new(created.id))
    }

    async fn add_message(&self, thread: &ThreadRef, role: MessageRole, text: &str) -> Result<String> {
        let body = self
            .post_json(
                &format!("/threads/{thread}/messages"),
                &serde_json::json!({
                    "role": role.as_str(),
                    "content": text,
                }),
            )
            .await?;
        let created: ObjectWithId = serde_json::from_str(&body)?;
        Ok(created.id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread = %thread))]
    async fn run_to_completion(&self, thread: &ThreadRef) -> Result<()> {
        let body = self
            .post_json(
                &format!("/threads/{thread}/runs"),
                &serde_json::json!({ "assistant_id": self.assistant_id }),
            )
            .await?;
        let run: RunObject = serde_json::from_str(&body)?;

        let deadline = Instant::now() + self.run_timeout;
        let started = Instant::now();
        let mut polls = 0usize;
        let mut status = run.status;
        loop {
            match status.as_str() {
                "completed" => {
                    tracing::debug!(
                        run_id = %run.id,
                        polls,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "run completed"
                    );
                    return Ok(());
                }
                "queued" | "in_progress" | "cancelling" => {}
                other => {
                    return Err(BackendError::Unclassified(format!(
                        "run {} ended in status {other}",
                        run.id
                    )));
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    run_id = %run.id,
                    polls,
                    timeout_ms = self.run_timeout.as_millis() as u64,
                    "run poll deadline exceeded"
                );
                return Err(BackendError::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
            polls = polls.saturating_add(1);
            let body = self
                .get_json(&format!("/threads/{thread}/runs/{}", run.id))
                .await?;
            let polled: RunObject = serde_json::from_str(&body)?;
            status = polled.status;
        }
    }

    async fn latest_assistant_text(&self, thread: &ThreadRef) -> Result<String> {
        let body = self
            .get_json(&format!("/threads/{thread}/messages?order=desc&limit=1"))
            .await?;
        let listed: MessageList = serde_json::from_str(&body)?;
        let text = listed
            .data
            .into_iter()
            .next()
            .and_then(extract_message_text)
            .ok_or_else(|| {
                BackendError::Unclassified("thread has no assistant reply".to_string())
            })?;
        Ok(text)
    }
}

#[async_trait::async_trait]
impl ConversationBackend for AssistantBackend {
    #[tracing::instrument(level = "info", skip_all)]
    async fn ask(&self, thread: Option<&ThreadRef>, text: &str) -> Result<AskReply> {
        let thread = match thread {
            Some(existing) => existing.clone(),
            None => {
                let created = self.create_thread().await?;
                tracing::info!(thread = %created, "created backend thread");
                created
            }
        };

        self.add_message(&thread, MessageRole::User, text).await?;
        self.run_to_completion(&thread).await?;
        let reply = self.latest_assistant_text(&thread).await?;
        Ok(AskReply {
            text: reply,
            thread,
        })
    }

    #[tracing::instrument(level = "info", skip_all, fields(thread = %thread, role = role.as_str()))]
    async fn append_message(
        &self,
        thread: &ThreadRef,
        role: MessageRole,
        text: &str,
    ) -> Result<String> {
        self.add_message(thread, role, text).await
    }
}

/// Map provider HTTP failures onto the structured error kinds the
/// dispatcher classifies on. The active-run conflict has no stable error
/// code, so the documented message text is matched here, at the client
/// boundary, and nowhere else.
fn classify_api_error(status: reqwest::StatusCode, body: &str) -> BackendError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return BackendError::RateLimited;
    }

    let parsed: std::result::Result<ApiErrorBody, _> = serde_json::from_str(body);
    if let Ok(parsed) = parsed {
        let message = parsed.error.message;
        if message.contains("already has an active run") {
            return BackendError::ConcurrentRunActive;
        }
        return BackendError::Unclassified(format!("status={status} message={message}"));
    }
    BackendError::Unclassified(format!("status={status} body={body}"))
}

fn extract_message_text(message: MessageObject) -> Option<String> {
    let parts: Vec<String> = message
        .content
        .into_iter()
        .filter_map(|part| part.text.map(|t| t.value))
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n"))
}

#[derive(Debug, Deserialize)]
struct ObjectWithId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    #[serde(default)]
    content: Vec<MessageContentPart>,
}

#[derive(Debug, Deserialize)]
struct MessageContentPart {
    #[serde(default)]
    text: Option<MessageContentText>,
}

#[derive(Debug, Deserialize)]
struct MessageContentText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}
