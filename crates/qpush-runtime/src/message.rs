//! Message types for queue operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Default prefix applied to queue names when building backend resource names
pub const DEFAULT_PREFIX: &str = "qpush";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Stable identity of a queue: its logical name and the backend resource name
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueIdentity {
    name: String,
    prefix: String,
    explicit_name: Option<String>,
}

impl QueueIdentity {
    /// Create new queue identity with validation
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        explicit_name: Option<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        Self::validate("queue_name", &name)?;

        let prefix = prefix.into();
        if !prefix.is_empty() {
            Self::validate("prefix", &prefix)?;
        }

        if let Some(ref explicit) = explicit_name {
            Self::validate("options.queue_name", explicit)?;
        }

        Ok(Self {
            name,
            prefix,
            explicit_name,
        })
    }

    fn validate(field: &str, value: &str) -> Result<(), ValidationError> {
        if value.is_empty() || value.len() > 80 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                message: "must be 1-80 characters".to_string(),
            });
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and dots allowed"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Logical queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix used for generated resource names
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backend resource name.
    ///
    /// An explicitly configured name is used verbatim so existing backend
    /// resources can be reused; otherwise `<prefix>_<name>`.
    pub fn name_with_prefix(&self) -> String {
        match (&self.explicit_name, self.prefix.is_empty()) {
            (Some(explicit), _) => explicit.clone(),
            (None, true) => self.name.clone(),
            (None, false) => format!("{}_{}", self.prefix, self.name),
        }
    }

    /// Cache key for a resource handle of this queue
    pub fn cache_key(&self, kind: HandleKind) -> String {
        format!("{}{}", self.name_with_prefix(), kind.suffix())
    }
}

impl std::fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Kinds of backend resource handles memoized per queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Queue URL
    QueueUrl,
    /// Queue ARN, needed for policies and subscriptions
    QueueArn,
    /// Fan-out topic ARN
    TopicArn,
}

impl HandleKind {
    fn suffix(&self) -> &'static str {
        match self {
            Self::QueueUrl => "_url",
            Self::QueueArn => "_queue_arn",
            Self::TopicArn => "_arn",
        }
    }
}

/// Identifier of a message: backend-assigned text or a store row number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Integer(i64),
    Text(String),
}

impl MessageId {
    /// Generate new random message ID
    pub fn generate() -> Self {
        Self::Text(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Integer value, for store-backed ids
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(text) => text.parse().ok(),
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{}", value),
            Self::Text(text) => write!(f, "{}", text),
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self::Text(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// RFC 3339 representation used in persisted rows and metadata
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Free-form metadata attached to messages and notifications.
///
/// Insertion order is preserved.
pub type Metadata = serde_json::Map<String, Value>;

/// Body of a message: exactly one of a string or a structured JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum MessageBody {
    Text(String),
    Structured(Value),
}

impl MessageBody {
    /// Create a text body
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a structured body; only JSON objects and arrays are accepted
    pub fn structured(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(_) | Value::Array(_) => Ok(Self::Structured(value)),
            other => Err(ValidationError::InvalidFormat {
                field: "body".to_string(),
                message: format!(
                    "structured body must be an object or array, got {}",
                    json_kind(&other)
                ),
            }),
        }
    }

    /// Decode a body as it travels over the wire.
    ///
    /// JSON strings, objects and arrays decode to their value; anything that
    /// is not one of those is kept as raw text.
    pub fn from_wire(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::String(text)) => Self::Text(text),
            Ok(value @ (Value::Object(_) | Value::Array(_))) => Self::Structured(value),
            _ => Self::Text(raw.to_string()),
        }
    }

    /// Encode the body for transport (JSON document)
    pub fn to_wire(&self) -> Result<String, SerializationError> {
        let encoded = match self {
            Self::Text(text) => serde_json::to_string(text)?,
            Self::Structured(value) => serde_json::to_string(value)?,
        };
        Ok(encoded)
    }

    /// Text content, if this is a text body
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    /// Structured content, if this is a structured body
    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Text(_) => None,
            Self::Structured(value) => Some(value),
        }
    }

    /// Length in bytes of the wire encoding
    pub fn wire_len(&self) -> Result<usize, SerializationError> {
        Ok(self.to_wire()?.len())
    }
}

impl TryFrom<Value> for MessageBody {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            other => Self::structured(other),
        }
    }
}

impl From<MessageBody> for Value {
    fn from(body: MessageBody) -> Self {
        match body {
            MessageBody::Text(text) => Value::String(text),
            MessageBody::Structured(value) => value,
        }
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn metadata_from_json(value: Value) -> Result<Metadata, ValidationError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::InvalidFormat {
            field: "metadata".to_string(),
            message: format!("metadata must be a map, got {}", json_kind(&other)),
        }),
    }
}

/// A unit of work obtained from a queue.
///
/// Immutable once constructed. The metadata carries whatever backend token is
/// needed to delete the message later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    id: MessageId,
    body: MessageBody,
    metadata: Metadata,
}

impl Message {
    /// Create new message
    pub fn new(id: impl Into<MessageId>, body: MessageBody, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            body,
            metadata,
        }
    }

    /// Create message from untyped JSON parts, rejecting non-map metadata
    pub fn from_json(
        id: impl Into<MessageId>,
        body: Value,
        metadata: Value,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(
            id,
            MessageBody::try_from(body)?,
            metadata_from_json(metadata)?,
        ))
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Metadata entry as a string slice, when present and textual
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Kind of asynchronous push delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Subscription confirmation handshake
    Subscription,
    /// A queued message announced by push
    Message,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Message => "message",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SubscriptionConfirmation" => Ok(Self::Subscription),
            "Notification" => Ok(Self::Message),
            other if other.eq_ignore_ascii_case("subscription") => Ok(Self::Subscription),
            other if other.eq_ignore_ascii_case("message") => Ok(Self::Message),
            other => Err(ValidationError::InvalidFormat {
                field: "notification_type".to_string(),
                message: format!("unrecognized notification type '{}'", other),
            }),
        }
    }
}

/// A push delivery, consumed once by the owning provider and never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    id: MessageId,
    body: MessageBody,
    metadata: Metadata,
}

impl Notification {
    /// Create new notification
    pub fn new(id: impl Into<MessageId>, body: MessageBody, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            body,
            metadata,
        }
    }

    /// Create notification from untyped JSON parts, rejecting non-map metadata
    pub fn from_json(
        id: impl Into<MessageId>,
        body: Value,
        metadata: Value,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(
            id,
            MessageBody::try_from(body)?,
            metadata_from_json(metadata)?,
        ))
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Metadata entry as a string slice, when present and textual
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// Publish and Receive Options
// ============================================================================

/// Per-call options for publishing a message
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Delay before the message becomes visible; overrides `message_delay`
    pub delay: Option<Duration>,
    /// Message group for FIFO queues; defaults to the queue name
    pub message_group_id: Option<String>,
    /// Deduplication id for FIFO queues without content-based deduplication
    pub deduplication_id: Option<String>,
}

impl PublishOptions {
    /// Create new publish options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set delivery delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set FIFO message group
    pub fn with_message_group_id(mut self, group: impl Into<String>) -> Self {
        self.message_group_id = Some(group.into());
        self
    }

    /// Set FIFO deduplication id
    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }
}

/// Per-call options for receiving messages.
///
/// Unset values fall back to the queue's configured options.
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Maximum number of messages to receive in a batch
    pub max_messages: Option<u32>,
    /// Longest time to wait for messages to arrive
    pub wait_time: Option<Duration>,
    /// How long received messages stay hidden from other consumers
    pub visibility_timeout: Option<Duration>,
}

impl ReceiveOptions {
    /// Create new receive options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of messages to receive
    pub fn with_max_messages(mut self, max: u32) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// Set long-poll wait time
    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = Some(wait);
        self
    }

    /// Set visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
