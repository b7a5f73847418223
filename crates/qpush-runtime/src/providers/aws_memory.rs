//! In-process SQS and SNS fakes.
//!
//! These implement [`SqsApi`] and [`SnsApi`] closely enough to exercise the
//! AWS provider without a network:
//! - queues with delay, visibility timeout and receipt handles
//! - topics with paged subscription listing
//! - SNS to SQS fan-out wrapped in the SNS notification envelope
//! - call counters and recorded confirmations for assertions

use super::aws::{
    PublishRequest, ReceiveMessageRequest, SendMessageRequest, SnsApi, SnsSubscription, SqsApi,
    SqsMessage,
};
use crate::error::QueueError;
use crate::message::MessageId;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const FAKE_ACCOUNT: &str = "000000000000";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-action call counter
#[derive(Debug, Default)]
struct Calls(Mutex<HashMap<&'static str, usize>>);

impl Calls {
    fn record(&self, action: &'static str) {
        *lock(&self.0).entry(action).or_default() += 1;
    }

    fn count(&self, action: &str) -> usize {
        lock(&self.0).get(action).copied().unwrap_or(0)
    }
}

// ============================================================================
// SQS
// ============================================================================

#[derive(Debug, Clone)]
struct FakeMessage {
    message_id: String,
    body: String,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
    receive_count: u32,
}

#[derive(Debug)]
struct FakeQueue {
    arn: String,
    attributes: BTreeMap<String, String>,
    messages: Vec<FakeMessage>,
}

impl FakeQueue {
    fn attribute_seconds(&self, name: &str) -> i64 {
        self.attributes
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn enqueue(&mut self, body: String, delay_seconds: i64) -> String {
        let message_id = MessageId::generate().to_string();
        self.messages.push(FakeMessage {
            message_id: message_id.clone(),
            body,
            visible_at: Utc::now() + Duration::seconds(delay_seconds),
            receipt_handle: None,
            receive_count: 0,
        });
        message_id
    }
}

/// In-memory SQS
#[derive(Debug)]
pub struct InMemorySqs {
    region: String,
    queues: Mutex<BTreeMap<String, FakeQueue>>,
    calls: Calls,
}

impl Default for InMemorySqs {
    fn default() -> Self {
        Self::new("us-east-1")
    }
}

impl InMemorySqs {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            queues: Mutex::new(BTreeMap::new()),
            calls: Calls::default(),
        }
    }

    fn queue_url(&self, name: &str) -> String {
        format!(
            "https://sqs.{}.amazonaws.com/{}/{}",
            self.region, FAKE_ACCOUNT, name
        )
    }

    /// Number of times an action was invoked, e.g. `"CreateQueue"`
    pub fn call_count(&self, action: &str) -> usize {
        self.calls.count(action)
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.queues).len()
    }

    /// Messages held by a queue, visible or not
    pub fn message_count(&self, queue_url: &str) -> usize {
        lock(&self.queues)
            .get(queue_url)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn queue_attributes(&self, queue_url: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.queues)
            .get(queue_url)
            .map(|q| q.attributes.clone())
    }

    /// Make every in-flight message visible again
    pub fn expire_visibility(&self) {
        let now = Utc::now();
        for queue in lock(&self.queues).values_mut() {
            for message in queue.messages.iter_mut() {
                message.visible_at = now;
            }
        }
    }

    /// Enqueue into the queue owning `queue_arn`; used for topic fan-out
    fn deliver_to_arn(&self, queue_arn: &str, body: String) -> bool {
        let mut queues = lock(&self.queues);
        match queues.values_mut().find(|q| q.arn == queue_arn) {
            Some(queue) => {
                let delay = queue.attribute_seconds("DelaySeconds");
                queue.enqueue(body, delay);
                true
            }
            None => false,
        }
    }

    fn missing(queue_url: &str) -> QueueError {
        QueueError::QueueNotFound {
            queue_name: queue_url.to_string(),
        }
    }
}

#[async_trait]
impl SqsApi for InMemorySqs {
    async fn get_queue_url(&self, queue_name: &str) -> Result<Option<String>, QueueError> {
        self.calls.record("GetQueueUrl");
        let url = self.queue_url(queue_name);
        Ok(lock(&self.queues).contains_key(&url).then_some(url))
    }

    async fn create_queue(
        &self,
        queue_name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        self.calls.record("CreateQueue");
        let url = self.queue_url(queue_name);
        let arn = format!("arn:aws:sqs:{}:{}:{}", self.region, FAKE_ACCOUNT, queue_name);
        lock(&self.queues)
            .entry(url.clone())
            .or_insert_with(|| FakeQueue {
                arn,
                attributes: attributes.clone(),
                messages: Vec::new(),
            });
        Ok(url)
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String, QueueError> {
        self.calls.record("GetQueueAttributes");
        lock(&self.queues)
            .get(queue_url)
            .map(|q| q.arn.clone())
            .ok_or_else(|| Self::missing(queue_url))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), QueueError> {
        self.calls.record("SetQueueAttributes");
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(queue_url)
            .ok_or_else(|| Self::missing(queue_url))?;
        queue.attributes.extend(attributes.clone());
        Ok(())
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<String, QueueError> {
        self.calls.record("SendMessage");
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(&request.queue_url)
            .ok_or_else(|| Self::missing(&request.queue_url))?;
        let delay = request
            .delay_seconds
            .map(|d| d as i64)
            .unwrap_or_else(|| queue.attribute_seconds("DelaySeconds"));
        Ok(queue.enqueue(request.body, delay))
    }

    async fn receive_message(
        &self,
        request: ReceiveMessageRequest,
    ) -> Result<Vec<SqsMessage>, QueueError> {
        self.calls.record("ReceiveMessage");
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(&request.queue_url)
            .ok_or_else(|| Self::missing(&request.queue_url))?;

        let now = Utc::now();
        let visibility = request
            .visibility_timeout
            .map(|v| v as i64)
            .unwrap_or_else(|| queue.attribute_seconds("VisibilityTimeout"));

        let mut received = Vec::new();
        for message in queue.messages.iter_mut() {
            if received.len() >= request.max_messages as usize {
                break;
            }
            if message.visible_at > now {
                continue;
            }

            let receipt = MessageId::generate().to_string();
            message.receipt_handle = Some(receipt.clone());
            message.receive_count += 1;
            message.visible_at = now + Duration::seconds(visibility);

            let mut attributes = BTreeMap::new();
            attributes.insert(
                "ApproximateReceiveCount".to_string(),
                message.receive_count.to_string(),
            );
            received.push(SqsMessage {
                message_id: message.message_id.clone(),
                receipt_handle: receipt,
                body: message.body.clone(),
                md5_of_body: None,
                attributes,
            });
        }

        Ok(received)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        self.calls.record("DeleteMessage");
        let mut queues = lock(&self.queues);
        let queue = queues
            .get_mut(queue_url)
            .ok_or_else(|| Self::missing(queue_url))?;

        let before = queue.messages.len();
        queue
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if queue.messages.len() == before {
            return Err(QueueError::MessageNotFound {
                receipt: receipt_handle.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        self.calls.record("DeleteQueue");
        lock(&self.queues)
            .remove(queue_url)
            .map(|_| ())
            .ok_or_else(|| Self::missing(queue_url))
    }
}

// ============================================================================
// SNS
// ============================================================================

#[derive(Debug)]
struct FakeTopic {
    subscriptions: Vec<SnsSubscription>,
}

#[derive(Debug, Default)]
struct SnsState {
    topics: BTreeMap<String, FakeTopic>,
    confirmations: Vec<(String, String)>,
    http_deliveries: Vec<(String, String)>,
    published: Vec<PublishRequest>,
}

/// In-memory SNS delivering `sqs` subscriptions into an [`InMemorySqs`]
#[derive(Debug)]
pub struct InMemorySns {
    region: String,
    sqs: Arc<InMemorySqs>,
    page_size: usize,
    state: Mutex<SnsState>,
    calls: Calls,
}

impl InMemorySns {
    pub fn new(sqs: Arc<InMemorySqs>) -> Self {
        Self {
            region: sqs.region.clone(),
            sqs,
            page_size: 100,
            state: Mutex::new(SnsState::default()),
            calls: Calls::default(),
        }
    }

    /// Limit `ListSubscriptionsByTopic` pages to exercise `NextToken` handling
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.calls.count(action)
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.state).topics.len()
    }

    /// `(topic_arn, token)` pairs passed to `ConfirmSubscription`
    pub fn confirmations(&self) -> Vec<(String, String)> {
        lock(&self.state).confirmations.clone()
    }

    /// `(endpoint, message)` pairs pushed to HTTP(S) subscribers
    pub fn http_deliveries(&self) -> Vec<(String, String)> {
        lock(&self.state).http_deliveries.clone()
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        lock(&self.state).published.clone()
    }

    /// Subscriptions of a topic, in subscription order
    pub fn subscriptions(&self, topic_arn: &str) -> Vec<SnsSubscription> {
        lock(&self.state)
            .topics
            .get(topic_arn)
            .map(|t| t.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Add a subscription directly, as if made outside the provider
    pub fn seed_subscription(&self, topic_arn: &str, protocol: &str, endpoint: &str) {
        let mut state = lock(&self.state);
        if let Some(topic) = state.topics.get_mut(topic_arn) {
            topic.subscriptions.push(SnsSubscription {
                subscription_arn: format!("{}:{}", topic_arn, MessageId::generate()),
                protocol: protocol.to_string(),
                endpoint: endpoint.to_string(),
            });
        }
    }

    fn missing(topic_arn: &str) -> QueueError {
        QueueError::QueueNotFound {
            queue_name: topic_arn.to_string(),
        }
    }
}

/// Variant of a published message for one protocol
fn variant_for(request: &PublishRequest, protocol: &str) -> String {
    if request.message_structure.as_deref() != Some("json") {
        return request.message.clone();
    }
    let structure: Value = serde_json::from_str(&request.message).unwrap_or(Value::Null);
    structure
        .get(protocol)
        .or_else(|| structure.get("default"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| request.message.clone())
}

#[async_trait]
impl SnsApi for InMemorySns {
    async fn topic_exists(&self, topic_arn: &str) -> Result<bool, QueueError> {
        self.calls.record("GetTopicAttributes");
        Ok(lock(&self.state).topics.contains_key(topic_arn))
    }

    async fn create_topic(
        &self,
        name: &str,
        _attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        self.calls.record("CreateTopic");
        let arn = format!("arn:aws:sns:{}:{}:{}", self.region, FAKE_ACCOUNT, name);
        lock(&self.state)
            .topics
            .entry(arn.clone())
            .or_insert_with(|| FakeTopic {
                subscriptions: Vec::new(),
            });
        Ok(arn)
    }

    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
        next_token: Option<&str>,
    ) -> Result<(Vec<SnsSubscription>, Option<String>), QueueError> {
        self.calls.record("ListSubscriptionsByTopic");
        let state = lock(&self.state);
        let topic = state
            .topics
            .get(topic_arn)
            .ok_or_else(|| Self::missing(topic_arn))?;

        let start: usize = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(topic.subscriptions.len());
        let page = topic.subscriptions[start.min(end)..end].to_vec();
        let next = (end < topic.subscriptions.len()).then(|| end.to_string());
        Ok((page, next))
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        _attributes: &BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        self.calls.record("Subscribe");
        let mut state = lock(&self.state);
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| Self::missing(topic_arn))?;

        let subscription_arn = format!("{}:{}", topic_arn, MessageId::generate());
        topic.subscriptions.push(SnsSubscription {
            subscription_arn: subscription_arn.clone(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(subscription_arn)
    }

    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
        self.calls.record("Publish");
        let message_id = MessageId::generate().to_string();

        let subscriptions = {
            let mut state = lock(&self.state);
            let topic = state
                .topics
                .get(&request.topic_arn)
                .ok_or_else(|| Self::missing(&request.topic_arn))?;
            let subscriptions = topic.subscriptions.clone();
            state.published.push(request.clone());
            subscriptions
        };

        for subscription in subscriptions {
            let message = variant_for(&request, &subscription.protocol);
            match subscription.protocol.as_str() {
                "sqs" => {
                    let envelope = json!({
                        "Type": "Notification",
                        "MessageId": message_id,
                        "TopicArn": request.topic_arn,
                        "Message": message,
                        "Timestamp": Utc::now().to_rfc3339(),
                    });
                    self.sqs
                        .deliver_to_arn(&subscription.endpoint, envelope.to_string());
                }
                "http" | "https" => {
                    lock(&self.state)
                        .http_deliveries
                        .push((subscription.endpoint.clone(), message));
                }
                _ => {}
            }
        }

        Ok(message_id)
    }

    async fn confirm_subscription(
        &self,
        topic_arn: &str,
        token: &str,
    ) -> Result<String, QueueError> {
        self.calls.record("ConfirmSubscription");
        lock(&self.state)
            .confirmations
            .push((topic_arn.to_string(), token.to_string()));
        Ok(format!("{}:{}", topic_arn, MessageId::generate()))
    }

    async fn delete_topic(&self, topic_arn: &str) -> Result<(), QueueError> {
        self.calls.record("DeleteTopic");
        lock(&self.state).topics.remove(topic_arn);
        Ok(())
    }
}
