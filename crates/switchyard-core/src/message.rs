use crate::error::SwitchyardError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What a [`Message`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Work for an agent.
    Request,
    /// Successful result of a request.
    Response,
    /// Failed result of a request, or a system error report.
    Error,
    /// Health or lifecycle report.
    Status,
    /// Shared context changed.
    ContextUpdate,
    /// Liveness ping.
    Heartbeat,
    /// Control-plane instruction (drain, stop, ...).
    Control,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
            MessageKind::ContextUpdate => "context_update",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Control => "control",
        };
        f.write_str(s)
    }
}

/// A unit of inter-agent communication.
///
/// Messages are built by producers and become immutable once published: the
/// bus stores them behind `Arc` and never hands out mutable access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Topic subscribers listen on.
    pub topic: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Producer identifier (agent id, "orchestrator", ...).
    pub sender: String,
    /// Intended consumer, if any.
    #[serde(default)]
    pub recipient: Option<String>,
    /// Opaque structured payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Higher values are delivered first.
    #[serde(default)]
    pub priority: i32,
    /// UTC timestamp of when the message was created.
    pub created_at: DateTime<Utc>,
    /// Id of the message this one answers.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Topic the response should be published on.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Seconds after `created_at` at which the message is dropped undelivered.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Arbitrary key-value metadata attached to the message.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a new message with the given topic, kind, sender, and payload.
    pub fn new(
        topic: impl Into<String>,
        kind: MessageKind,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            kind,
            sender: sender.into(),
            recipient: None,
            payload,
            priority: 0,
            created_at: Utc::now(),
            correlation_id: None,
            reply_to: None,
            ttl_secs: None,
            metadata: HashMap::new(),
        }
    }

    /// Creates a [`MessageKind::Request`] message.
    pub fn request(
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(topic, MessageKind::Request, sender, payload)
    }

    /// Creates a [`MessageKind::Status`] message.
    pub fn status(
        topic: impl Into<String>,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(topic, MessageKind::Status, sender, payload)
    }

    /// Creates a [`MessageKind::Response`] answering `request`.
    ///
    /// The response goes to the request's `reply_to` topic (or its own topic
    /// when none was given) and inherits its priority.
    pub fn response_to(
        request: &Message,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(reply_topic(request), MessageKind::Response, sender, payload);
        msg.correlation_id = Some(request.id);
        msg.recipient = Some(request.sender.clone());
        msg.priority = request.priority;
        msg
    }

    /// Creates a [`MessageKind::Error`] answering `request`.
    pub fn error_to(request: &Message, sender: impl Into<String>, error: &SwitchyardError) -> Self {
        let payload = serde_json::json!({
            "code": error.code(),
            "message": error.detail(),
        });
        let mut msg = Self::new(reply_topic(request), MessageKind::Error, sender, payload);
        msg.correlation_id = Some(request.id);
        msg.recipient = Some(request.sender.clone());
        msg.priority = request.priority;
        msg
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the reply topic.
    pub fn with_reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    /// Set the recipient.
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Link this message to an earlier one.
    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set a time-to-live in seconds.
    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            Some(ttl) => {
                let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
                now.signed_duration_since(self.created_at).num_seconds() > ttl
            }
            None => false,
        }
    }

    /// Serialized JSON size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// For error-kind messages, rebuild the carried error.
    pub fn as_error(&self) -> Option<SwitchyardError> {
        if self.kind != MessageKind::Error {
            return None;
        }
        let code = self.payload["code"].as_str().unwrap_or("handler");
        let message = self.payload["message"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string();
        Some(SwitchyardError::from_code(code, message))
    }
}

fn reply_topic(request: &Message) -> String {
    request
        .reply_to
        .clone()
        .unwrap_or_else(|| request.topic.clone())
}
