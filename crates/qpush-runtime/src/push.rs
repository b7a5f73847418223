//! Inbound SNS HTTP push payloads.
//!
//! [`parse_sns_request`] turns the `x-amz-sns-message-type` header and JSON
//! body of an SNS delivery into an [`InboundNotification`]; [`route`] hands it
//! to the queue that owns the topic. Mounting these on an HTTP server is left
//! to the host application.

use crate::error::{QueueError, SerializationError, ValidationError};
use crate::events::{DispatchOutcome, EventDispatcher, NotificationEvent};
use crate::message::{MessageBody, Metadata, Notification, NotificationType};
use crate::registry::ProviderRegistry;
use serde_json::{Map, Value};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "push_tests.rs"]
mod tests;

/// Header carrying the SNS message type
pub const MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";

const SUBSCRIPTION_FIELDS: &[&str] = &["Type", "TopicArn", "Token", "SubscribeURL", "Timestamp"];
const NOTIFICATION_FIELDS: &[&str] = &["Type", "TopicArn", "Subject", "Timestamp"];

/// A parsed push delivery, not yet routed to a queue
#[derive(Debug, Clone, PartialEq)]
pub struct InboundNotification {
    /// Topic name: the last segment of the topic ARN
    pub topic_name: String,
    pub notification_type: NotificationType,
    pub notification: Notification,
}

fn required<'a>(payload: &'a Map<String, Value>, field: &str) -> Result<&'a str, ValidationError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::Required {
            field: field.to_string(),
        })
}

fn copy_fields(payload: &Map<String, Value>, fields: &[&str]) -> Metadata {
    let mut metadata = Metadata::new();
    for field in fields {
        if let Some(value) = payload.get(*field) {
            metadata.insert(field.to_string(), value.clone());
        }
    }
    metadata
}

/// Parse an SNS HTTP push.
///
/// The header, when present, must agree with the body's `Type`. Only
/// `SubscriptionConfirmation` and `Notification` deliveries are accepted.
pub fn parse_sns_request(
    message_type_header: Option<&str>,
    body: &str,
) -> Result<InboundNotification, QueueError> {
    let payload: Value = serde_json::from_str(body).map_err(SerializationError::from)?;
    let Value::Object(payload) = payload else {
        return Err(ValidationError::InvalidFormat {
            field: "body".to_string(),
            message: "push payload must be a JSON object".to_string(),
        }
        .into());
    };

    let body_type = required(&payload, "Type")?;
    let message_type = message_type_header.unwrap_or(body_type);
    if message_type != body_type {
        return Err(ValidationError::InvalidFormat {
            field: MESSAGE_TYPE_HEADER.to_string(),
            message: format!("header '{}' does not match body type '{}'", message_type, body_type),
        }
        .into());
    }

    let (notification_type, fields) = match message_type {
        "SubscriptionConfirmation" => (NotificationType::Subscription, SUBSCRIPTION_FIELDS),
        "Notification" => (NotificationType::Message, NOTIFICATION_FIELDS),
        other => {
            return Err(ValidationError::InvalidFormat {
                field: MESSAGE_TYPE_HEADER.to_string(),
                message: format!("unsupported SNS message type '{}'", other),
            }
            .into())
        }
    };

    let topic_arn = required(&payload, "TopicArn")?;
    let message_id = required(&payload, "MessageId")?;
    if notification_type == NotificationType::Subscription {
        required(&payload, "Token")?;
    }

    let raw = payload.get("Message").and_then(Value::as_str).unwrap_or_default();
    let body = match notification_type {
        NotificationType::Subscription => MessageBody::text(raw),
        NotificationType::Message => MessageBody::from_wire(raw),
    };

    let topic_name = topic_arn.rsplit(':').next().unwrap_or(topic_arn).to_string();
    let notification = Notification::new(message_id, body, copy_fields(&payload, fields));

    debug!(topic = %topic_name, notification_type = %notification_type, "push payload parsed");
    Ok(InboundNotification {
        topic_name,
        notification_type,
        notification,
    })
}

/// Dispatch a parsed push to the queue owning its topic
pub async fn route(
    registry: &ProviderRegistry,
    dispatcher: &EventDispatcher,
    inbound: InboundNotification,
) -> Result<DispatchOutcome, QueueError> {
    let Some(queue) = registry.resolve_topic(&inbound.topic_name) else {
        warn!(topic = %inbound.topic_name, "push for unknown topic");
        return Err(QueueError::ProviderNotFound {
            name: inbound.topic_name,
        });
    };

    let event = NotificationEvent::new(queue, inbound.notification_type, inbound.notification);
    dispatcher.dispatch_notification(&event).await
}
