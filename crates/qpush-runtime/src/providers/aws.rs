//! AWS provider: an SQS queue, optionally fanned out through an SNS topic.
//!
//! Backend access goes through the [`SqsApi`] and [`SnsApi`] traits. The HTTP
//! implementations in [`super::aws_http`] sign Query API requests with AWS
//! Signature V4; [`super::aws_memory`] holds in-process fakes for tests.
//!
//! ## Resource lifecycle
//!
//! Handles (queue URL, queue ARN, topic ARN) resolve through memory, then the
//! shared [`Cache`], then the backend. `create` provisions the queue and, when
//! push notifications are enabled, the topic plus its subscriptions:
//!
//! 1. queue: `GetQueueUrl`, falling back to `CreateQueue`. A fresh queue with
//!    push enabled gets a policy that lets the topic send into it.
//! 2. topic: `CreateTopic` (idempotent on the backend).
//! 3. subscriptions: reconciled against the live `ListSubscriptionsByTopic`
//!    result, matched by endpoint.
//!
//! ## Push delivery
//!
//! Published messages go to the topic. The `sqs` variant of the message
//! carries the body; HTTP(S) and other subscribers receive the queue name and
//! are expected to pull from the queue when notified.

use crate::cache::{resolve_handle, Cache};
use crate::client::{dispatch_received, QueueProvider};
use crate::error::{QueueError, ValidationError};
use crate::events::{EventDispatcher, NotificationEvent, Propagation};
use crate::message::{
    HandleKind, Message, MessageBody, MessageId, Metadata, NotificationType, PublishOptions,
    QueueIdentity, ReceiveOptions,
};
use crate::provider::{ProviderType, QueueOptions, SubscriberProtocol};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

/// Longest SQS long-poll wait in seconds
pub const MAX_WAIT_TIME_SECONDS: u64 = 20;

/// Largest SQS receive batch
pub const MAX_RECEIVE_BATCH: u32 = 10;

// ============================================================================
// Backend API
// ============================================================================

/// Message returned by `ReceiveMessage`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendMessageRequest {
    pub queue_url: String,
    pub body: String,
    pub delay_seconds: Option<u64>,
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveMessageRequest {
    pub queue_url: String,
    pub max_messages: u32,
    pub wait_time_seconds: u64,
    pub visibility_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishRequest {
    pub topic_arn: String,
    pub message: String,
    /// `json` when `message` holds per-protocol variants
    pub message_structure: Option<String>,
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

/// One entry of `ListSubscriptionsByTopic`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnsSubscription {
    pub subscription_arn: String,
    pub protocol: String,
    pub endpoint: String,
}

/// Queue operations used by the provider
#[async_trait]
pub trait SqsApi: Send + Sync {
    /// Queue URL, or `None` when the queue does not exist
    async fn get_queue_url(&self, queue_name: &str) -> Result<Option<String>, QueueError>;

    async fn create_queue(
        &self,
        queue_name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError>;

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String, QueueError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), QueueError>;

    async fn send_message(&self, request: SendMessageRequest) -> Result<String, QueueError>;

    async fn receive_message(
        &self,
        request: ReceiveMessageRequest,
    ) -> Result<Vec<SqsMessage>, QueueError>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str)
        -> Result<(), QueueError>;

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError>;
}

/// Topic operations used by the provider
#[async_trait]
pub trait SnsApi: Send + Sync {
    async fn topic_exists(&self, topic_arn: &str) -> Result<bool, QueueError>;

    async fn create_topic(
        &self,
        name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError>;

    /// One page of subscriptions plus the token for the next page
    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<SnsSubscription>, Option<String>), QueueError>;

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError>;

    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError>;

    async fn confirm_subscription(&self, topic_arn: &str, token: &str)
        -> Result<String, QueueError>;

    async fn delete_topic(&self, topic_arn: &str) -> Result<(), QueueError>;
}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Default)]
struct Handles {
    queue_url: Option<String>,
    queue_arn: Option<String>,
    topic_arn: Option<String>,
}

/// Queue provider backed by SQS, with optional SNS fan-out
pub struct AwsProvider {
    identity: QueueIdentity,
    options: QueueOptions,
    sqs: Arc<dyn SqsApi>,
    sns: Arc<dyn SnsApi>,
    cache: Arc<dyn Cache>,
    handles: RwLock<Handles>,
}

impl AwsProvider {
    pub fn new(
        identity: QueueIdentity,
        options: QueueOptions,
        sqs: Arc<dyn SqsApi>,
        sns: Arc<dyn SnsApi>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            identity,
            options,
            sqs,
            sns,
            cache,
            handles: RwLock::new(Handles::default()),
        }
    }

    /// Backend name of both the queue and the topic; FIFO resources need the
    /// `.fifo` suffix
    pub fn resource_name(&self) -> String {
        let name = self.identity.name_with_prefix();
        if self.options.fifo && !name.ends_with(".fifo") {
            format!("{}.fifo", name)
        } else {
            name
        }
    }

    fn queue_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "DelaySeconds".to_string(),
            self.options.message_delay.to_string(),
        );
        attributes.insert(
            "MessageRetentionPeriod".to_string(),
            self.options.message_expiration.to_string(),
        );
        attributes.insert(
            "VisibilityTimeout".to_string(),
            self.options.message_timeout.to_string(),
        );
        attributes.insert(
            "ReceiveMessageWaitTimeSeconds".to_string(),
            self.options.receive_wait_time.min(MAX_WAIT_TIME_SECONDS).to_string(),
        );
        if self.options.fifo {
            attributes.insert("FifoQueue".to_string(), "true".to_string());
            attributes.insert(
                "ContentBasedDeduplication".to_string(),
                self.options.content_based_deduplication.to_string(),
            );
        }
        attributes
    }

    fn topic_attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        if self.options.fifo {
            attributes.insert("FifoTopic".to_string(), "true".to_string());
            attributes.insert(
                "ContentBasedDeduplication".to_string(),
                self.options.content_based_deduplication.to_string(),
            );
        }
        attributes
    }

    /// Resolve the queue URL without creating anything
    async fn resolve_queue_url(&self) -> Result<Option<String>, QueueError> {
        let known = self.handles.read().await.queue_url.clone();
        let key = self.identity.cache_key(HandleKind::QueueUrl);
        let resource = self.resource_name();

        let resolved = resolve_handle(known, self.cache.as_ref(), &key, || {
            self.sqs.get_queue_url(&resource)
        })
        .await?;

        Ok(match resolved {
            Some((url, source)) => {
                debug!(queue = %self.identity, ?source, "queue url resolved");
                self.handles.write().await.queue_url = Some(url.clone());
                Some(url)
            }
            None => None,
        })
    }

    /// Resolve the queue URL, creating the queue when it does not exist
    async fn ensure_queue(&self) -> Result<String, QueueError> {
        if let Some(url) = self.resolve_queue_url().await? {
            return Ok(url);
        }

        let resource = self.resource_name();
        let url = self
            .sqs
            .create_queue(&resource, &self.queue_attributes())
            .await?;
        info!(queue = %self.identity, resource = %resource, url = %url, "queue created");

        self.cache
            .save(&self.identity.cache_key(HandleKind::QueueUrl), &url)
            .await?;
        self.handles.write().await.queue_url = Some(url.clone());

        if self.options.push_notifications {
            let queue_arn = self.resolve_queue_arn(&url).await?;
            let mut attributes = BTreeMap::new();
            attributes.insert("Policy".to_string(), self.queue_policy(&queue_arn));
            self.sqs.set_queue_attributes(&url, &attributes).await?;
            debug!(queue = %self.identity, "topic delivery policy attached");
        }

        Ok(url)
    }

    async fn resolve_queue_arn(&self, queue_url: &str) -> Result<String, QueueError> {
        let known = self.handles.read().await.queue_arn.clone();
        let key = self.identity.cache_key(HandleKind::QueueArn);

        let resolved = resolve_handle(known, self.cache.as_ref(), &key, || async {
            self.sqs.get_queue_arn(queue_url).await.map(Some)
        })
        .await?;

        match resolved {
            Some((arn, _)) => {
                self.handles.write().await.queue_arn = Some(arn.clone());
                Ok(arn)
            }
            None => Err(QueueError::QueueNotFound {
                queue_name: self.resource_name(),
            }),
        }
    }

    /// Policy allowing this queue's topic to deliver into the queue
    fn queue_policy(&self, queue_arn: &str) -> String {
        let source_arn = topic_arn_pattern(queue_arn, &self.resource_name(), "*");
        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": format!("{}-topic-delivery", self.identity.name_with_prefix()),
                "Effect": "Allow",
                "Principal": { "Service": "sns.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": { "ArnLike": { "aws:SourceArn": source_arn } }
            }]
        })
        .to_string()
    }

    /// Topic ARN known in memory or cache; never calls the backend
    async fn known_topic_arn(&self) -> Result<Option<String>, QueueError> {
        let known = self.handles.read().await.topic_arn.clone();
        let key = self.identity.cache_key(HandleKind::TopicArn);
        let resolved =
            resolve_handle(known, self.cache.as_ref(), &key, || async { Ok(None) }).await?;
        Ok(resolved.map(|(arn, _)| arn))
    }

    async fn ensure_topic(&self) -> Result<String, QueueError> {
        if let Some(arn) = self.known_topic_arn().await? {
            self.handles.write().await.topic_arn = Some(arn.clone());
            return Ok(arn);
        }

        let resource = self.resource_name();
        let arn = self
            .sns
            .create_topic(&resource, &self.topic_attributes())
            .await?;
        info!(queue = %self.identity, topic_arn = %arn, "topic created");

        self.cache
            .save(&self.identity.cache_key(HandleKind::TopicArn), &arn)
            .await?;
        self.handles.write().await.topic_arn = Some(arn.clone());
        Ok(arn)
    }

    /// Endpoints currently subscribed to the topic, across all pages
    async fn live_endpoints(&self, topic_arn: &str) -> Result<HashSet<String>, QueueError> {
        let mut endpoints = HashSet::new();
        let mut next_token: Option<String> = None;

        loop {
            let (page, token) = self
                .sns
                .list_subscriptions_by_topic(topic_arn, next_token.as_deref())
                .await?;
            endpoints.extend(page.into_iter().map(|s| s.endpoint));

            match token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(endpoints)
    }

    fn subscription_attributes(&self, protocol: SubscriberProtocol) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        if matches!(protocol, SubscriberProtocol::Http | SubscriberProtocol::Https) {
            let policy = json!({
                "healthyRetryPolicy": {
                    "numRetries": self.options.notification_retries,
                    "minDelayTarget": 20,
                    "maxDelayTarget": 20
                }
            });
            attributes.insert("DeliveryPolicy".to_string(), policy.to_string());
        }
        attributes
    }

    /// Subscribe the queue and every configured endpoint not yet subscribed.
    ///
    /// Returns the number of new subscriptions.
    async fn reconcile_subscriptions(
        &self,
        topic_arn: &str,
        queue_arn: &str,
    ) -> Result<usize, QueueError> {
        let mut existing = self.live_endpoints(topic_arn).await?;

        let mut wanted = vec![(SubscriberProtocol::Sqs, queue_arn.to_string())];
        wanted.extend(
            self.options
                .subscribers
                .iter()
                .map(|s| (s.protocol, s.endpoint.clone())),
        );

        let mut subscribed = 0;
        for (protocol, endpoint) in wanted {
            if existing.contains(&endpoint) {
                debug!(queue = %self.identity, endpoint = %endpoint, "already subscribed");
                continue;
            }

            self.sns
                .subscribe(
                    topic_arn,
                    protocol.as_str(),
                    &endpoint,
                    &self.subscription_attributes(protocol),
                )
                .await?;
            info!(
                queue = %self.identity,
                protocol = protocol.as_str(),
                endpoint = %endpoint,
                "subscription created"
            );
            existing.insert(endpoint);
            subscribed += 1;
        }

        Ok(subscribed)
    }

    fn group_and_dedup(&self, options: &PublishOptions) -> (Option<String>, Option<String>) {
        if !self.options.fifo {
            return (None, None);
        }

        let group = options
            .message_group_id
            .clone()
            .unwrap_or_else(|| self.resource_name());
        let dedup = match &options.deduplication_id {
            Some(id) => Some(id.clone()),
            None if self.options.content_based_deduplication => None,
            None => Some(MessageId::generate().to_string()),
        };
        (Some(group), dedup)
    }

    async fn publish_to_topic(
        &self,
        wire: String,
        options: &PublishOptions,
    ) -> Result<MessageId, QueueError> {
        let topic_arn = match self.known_topic_arn().await? {
            Some(arn) => arn,
            None => {
                self.create().await?;
                self.ensure_topic().await?
            }
        };

        let name = self.identity.name().to_string();
        let structure = json!({
            "default": name,
            "http": name,
            "https": name,
            "sqs": wire,
        });

        let (group, dedup) = self.group_and_dedup(options);
        let id = self
            .sns
            .publish(PublishRequest {
                topic_arn,
                message: structure.to_string(),
                message_structure: Some("json".to_string()),
                message_group_id: group,
                deduplication_id: dedup,
            })
            .await?;

        debug!(queue = %self.identity, message_id = %id, "message published to topic");
        Ok(MessageId::Text(id))
    }

    async fn publish_to_queue(
        &self,
        wire: String,
        options: &PublishOptions,
    ) -> Result<MessageId, QueueError> {
        let queue_url = self.ensure_queue().await?;

        // FIFO queues only accept a queue-level delay
        let delay_seconds = if self.options.fifo {
            None
        } else {
            Some(
                options
                    .delay
                    .map(|d| d.num_seconds().max(0) as u64)
                    .unwrap_or(self.options.message_delay),
            )
        };

        let (group, dedup) = self.group_and_dedup(options);
        let id = self
            .sqs
            .send_message(SendMessageRequest {
                queue_url,
                body: wire,
                delay_seconds,
                message_group_id: group,
                deduplication_id: dedup,
            })
            .await?;

        debug!(queue = %self.identity, message_id = %id, "message sent to queue");
        Ok(MessageId::Text(id))
    }

    fn to_message(&self, received: SqsMessage) -> Message {
        let mut metadata = Metadata::new();
        metadata.insert(
            "ReceiptHandle".to_string(),
            Value::String(received.receipt_handle),
        );
        if let Some(md5) = received.md5_of_body {
            metadata.insert("MD5OfBody".to_string(), Value::String(md5));
        }
        for (name, value) in received.attributes {
            metadata.insert(name, Value::String(value));
        }

        let raw = match unwrap_envelope(&received.body) {
            Some((inner, topic_arn)) => {
                if let Some(topic_arn) = topic_arn {
                    metadata.insert("TopicArn".to_string(), Value::String(topic_arn));
                }
                inner
            }
            None => received.body,
        };

        Message::new(received.message_id, MessageBody::from_wire(&raw), metadata)
    }

    async fn forget_handles(&self) -> Result<(), QueueError> {
        *self.handles.write().await = Handles::default();
        for kind in [HandleKind::QueueUrl, HandleKind::QueueArn, HandleKind::TopicArn] {
            self.cache.delete(&self.identity.cache_key(kind)).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AwsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsProvider")
            .field("identity", &self.identity)
            .field("resource", &self.resource_name())
            .field("push_notifications", &self.options.push_notifications)
            .finish_non_exhaustive()
    }
}

/// ARN of the topic named `topic_name` in the queue's region; `account`
/// replaces the account id (`*` for policy patterns)
fn topic_arn_pattern(queue_arn: &str, topic_name: &str, account: &str) -> String {
    let region = queue_arn.split(':').nth(3).unwrap_or("*");
    format!("arn:aws:sns:{}:{}:{}", region, account, topic_name)
}

/// Inner message and topic of an SNS notification envelope
fn unwrap_envelope(body: &str) -> Option<(String, Option<String>)> {
    let value: Value = serde_json::from_str(body).ok()?;
    if value.get("Type").and_then(Value::as_str) != Some("Notification") {
        return None;
    }
    let inner = value.get("Message").and_then(Value::as_str)?.to_string();
    let topic_arn = value
        .get("TopicArn")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((inner, topic_arn))
}

#[async_trait]
impl QueueProvider for AwsProvider {
    fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Aws
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn create(&self) -> Result<bool, QueueError> {
        let queue_url = self.ensure_queue().await?;

        if self.options.push_notifications {
            let topic_arn = self.ensure_topic().await?;
            let queue_arn = self.resolve_queue_arn(&queue_url).await?;
            let subscribed = self.reconcile_subscriptions(&topic_arn, &queue_arn).await?;
            debug!(queue = %self.identity, subscribed, "subscriptions reconciled");
        }

        Ok(true)
    }

    async fn publish(
        &self,
        body: MessageBody,
        options: PublishOptions,
    ) -> Result<MessageId, QueueError> {
        let wire = body.to_wire()?;
        let max_size = self.provider_type().max_message_size();
        if wire.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: wire.len(),
                max_size,
            });
        }

        if self.options.push_notifications {
            self.publish_to_topic(wire, &options).await
        } else {
            self.publish_to_queue(wire, &options).await
        }
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Message>, QueueError> {
        let queue_url = self.ensure_queue().await?;

        let max_messages = options
            .max_messages
            .unwrap_or(self.options.messages_to_receive)
            .clamp(1, MAX_RECEIVE_BATCH);
        let wait_time_seconds = options
            .wait_time
            .map(|d| d.num_seconds().max(0) as u64)
            .unwrap_or(self.options.receive_wait_time)
            .min(MAX_WAIT_TIME_SECONDS);
        let visibility_timeout = options
            .visibility_timeout
            .map(|d| d.num_seconds().max(0) as u64);

        let received = self
            .sqs
            .receive_message(ReceiveMessageRequest {
                queue_url,
                max_messages,
                wait_time_seconds,
                visibility_timeout,
            })
            .await?;

        debug!(queue = %self.identity, count = received.len(), "messages received");
        Ok(received.into_iter().map(|m| self.to_message(m)).collect())
    }

    async fn delete(&self, receipt: &str) -> Result<bool, QueueError> {
        let Some(queue_url) = self.resolve_queue_url().await? else {
            return Ok(false);
        };

        match self.sqs.delete_message(&queue_url, receipt).await {
            Ok(()) => Ok(true),
            Err(QueueError::QueueNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self) -> Result<bool, QueueError> {
        let queue_url = self.resolve_queue_url().await?;

        let mut topic_arn = self.known_topic_arn().await?;
        if let Some(url) = &queue_url {
            if topic_arn.is_none() && self.options.push_notifications {
                // Same region and account as the queue
                let queue_arn = self.resolve_queue_arn(url).await?;
                let account = queue_arn.split(':').nth(4).unwrap_or_default().to_string();
                topic_arn = Some(topic_arn_pattern(&queue_arn, &self.resource_name(), &account));
            }

            match self.sqs.delete_queue(url).await {
                Ok(()) => info!(queue = %self.identity, "queue deleted"),
                Err(e) if e.is_not_found() => debug!(queue = %self.identity, "queue already gone"),
                Err(e) => return Err(e),
            }
        }

        if let Some(arn) = topic_arn.filter(|_| self.options.push_notifications) {
            if self.sns.topic_exists(&arn).await? {
                match self.sns.delete_topic(&arn).await {
                    Ok(()) => info!(queue = %self.identity, topic_arn = %arn, "topic deleted"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.forget_handles().await?;
        Ok(true)
    }

    fn receipt_for(&self, message: &Message) -> Option<String> {
        message.metadata_str("ReceiptHandle").map(str::to_string)
    }

    async fn on_notification(
        &self,
        event: &NotificationEvent,
        dispatcher: &EventDispatcher,
    ) -> Result<Propagation, QueueError> {
        match event.notification_type() {
            NotificationType::Subscription => {
                let notification = event.notification();
                let token = notification.metadata_str("Token").ok_or_else(|| {
                    ValidationError::Required {
                        field: "Token".to_string(),
                    }
                })?;
                let topic_arn = match notification.metadata_str("TopicArn") {
                    Some(arn) => arn.to_string(),
                    None => self.ensure_topic().await?,
                };

                let subscription_arn = self.sns.confirm_subscription(&topic_arn, token).await?;
                info!(
                    queue = %self.identity,
                    subscription_arn = %subscription_arn,
                    "subscription confirmed"
                );
            }
            NotificationType::Message => {
                let handled =
                    dispatch_received(self, dispatcher, ReceiveOptions::default()).await?;
                debug!(queue = %self.identity, handled, "push notification drained queue");
            }
        }

        Ok(Propagation::Continue)
    }
}
