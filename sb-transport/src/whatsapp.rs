use crate::traits::Transport;
use crate::types::{
    ConversationId, InboundEvent, InboundEventKind, MessageId, OutboundMessage, TargetKind,
};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct WhatsAppCloudTransport {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
}

impl WhatsAppCloudTransport {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
        })
    }

    fn messages_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "https://graph.facebook.com/v20.0/{}/messages",
            self.phone_number_id
        ))
        .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }
}

#[async_trait::async_trait]
impl Transport for WhatsAppCloudTransport {
    fn transport_id(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        // Inbound events are delivered via webhook route wiring in sb-app.
        Ok(())
    }

    async fn send(
        &self,
        conversation: &ConversationId,
        message: OutboundMessage,
    ) -> Result<MessageId> {
        let to = conversation.as_str().trim();
        if to.is_empty() {
            return Err(anyhow!("conversation id (E.164 phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.messages_url()?;
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text,
            }
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp send failed: status={} body={}",
                status,
                body
            ));
        }

        let parsed: SendResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("whatsapp send response parse failed: {e} body={body}"))?;
        let id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| anyhow!("whatsapp send response carried no message id"))?;
        tracing::debug!(message_id = %id, content_len = text.len(), "whatsapp message sent");
        Ok(MessageId::new(id))
    }

    async fn set_composing(
        &self,
        _conversation: &ConversationId,
        in_reply_to: Option<&MessageId>,
    ) -> Result<()> {
        // The Cloud API signals typing as part of the read receipt for the
        // message being answered; without one there is nothing to mark.
        let Some(message_id) = in_reply_to else {
            return Ok(());
        };

        let url = self.messages_url()?;
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id.as_str(),
            "typing_indicator": { "type": "text" },
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "whatsapp typing indicator failed: status={status} body={body}"
            ));
        }
        Ok(())
    }

    fn supports_composing(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SendResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct SendResponseMessage {
    id: String,
}

/// Graph webhook payload, trimmed to the fields the gateway consumes.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub value: WebhookValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookValue {
    /// Messages sent to the account by counterparts.
    #[serde(default)]
    messages: Vec<WebhookMessage>,
    /// Echoes of messages sent from the account itself, by this process or
    /// by a human operator on a paired device.
    #[serde(default)]
    message_echoes: Vec<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    text: Option<WebhookText>,
}

#[derive(Debug, Deserialize)]
struct WebhookText {
    #[serde(default)]
    body: String,
}

/// Convert one webhook delivery into inbound events.
///
/// Non-text messages carry no extractable body and are skipped here rather
/// than forwarded as placeholders.
pub fn build_inbound_events(payload: &WebhookPayload) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    for entry in &payload.entry {
        for change in &entry.changes {
            for message in &change.value.messages {
                if let Some(event) = build_event(message, false) {
                    events.push(event);
                }
            }
            for echo in &change.value.message_echoes {
                if let Some(event) = build_event(echo, true) {
                    events.push(event);
                }
            }
        }
    }
    events
}

fn build_event(message: &WebhookMessage, sender_is_self: bool) -> Option<InboundEvent> {
    let body = message.text.as_ref().map(|t| t.body.clone())?;
    // Echoes address the counterpart; inbound traffic names it as sender.
    let counterpart = if sender_is_self {
        message.to.as_deref()?
    } else {
        message.from.as_deref()?
    };
    Some(InboundEvent {
        kind: InboundEventKind::Message,
        message_id: MessageId::new(message.id.clone()),
        conversation: ConversationId::from_address(counterpart),
        target: TargetKind::classify(counterpart),
        sender_is_self,
        content: body,
        received_at: parse_timestamp(message.timestamp.as_deref()),
    })
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json).expect("parse webhook payload")
    }

    #[test]
    fn maps_user_messages_to_events() {
        let payload = payload(serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "id": "wamid.user-1",
                            "from": "4915112345678",
                            "timestamp": "1700000000",
                            "text": { "body": "Hola" }
                        }]
                    }
                }]
            }]
        }));

        let events = build_inbound_events(&payload);
        assert_eq!(events.len(), 1);
        assert!(!events[0].sender_is_self);
        assert_eq!(events[0].conversation.as_str(), "4915112345678");
        assert_eq!(events[0].content, "Hola");
        assert_eq!(events[0].target, TargetKind::Direct);
    }

    #[test]
    fn maps_echoes_as_self_sends_keyed_by_recipient() {
        let payload = payload(serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "message_echoes": [{
                            "id": "wamid.echo-1",
                            "from": "4900000000000",
                            "to": "4915112345678",
                            "timestamp": "1700000060",
                            "text": { "body": "manual follow-up" }
                        }]
                    }
                }]
            }]
        }));

        let events = build_inbound_events(&payload);
        assert_eq!(events.len(), 1);
        assert!(events[0].sender_is_self);
        assert_eq!(events[0].conversation.as_str(), "4915112345678");
    }

    #[test]
    fn skips_messages_without_text_body() {
        let payload = payload(serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "id": "wamid.img-1",
                            "from": "4915112345678",
                            "timestamp": "1700000000"
                        }]
                    }
                }]
            }]
        }));

        assert!(build_inbound_events(&payload).is_empty());
    }
}
