//! Event routing between providers and application code.
//!
//! Two event kinds flow through the [`EventDispatcher`]:
//!
//! - `"<queue>.message_received"` carrying a [`MessageEvent`]
//! - `"<queue>.on_notification"` carrying a [`NotificationEvent`]
//!
//! Listeners form an ordered chain per event name. Higher priorities run
//! first; equal priorities run in registration order. A listener that returns
//! [`Propagation::Stop`] or an error ends the chain. The provider's delete
//! step is registered at [`TERMINAL_PRIORITY`] so it runs after every
//! application listener, and never runs when one of them fails or stops.
//! Application message listener priorities never drop below
//! [`LOWEST_LISTENER_PRIORITY`], so none can be ordered behind the delete.

use crate::error::QueueError;
use crate::message::{Message, Notification, NotificationType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;

/// Priority of the provider's terminal delete listener
pub const TERMINAL_PRIORITY: i32 = -255;

/// Lowest priority an application message listener runs at
pub const LOWEST_LISTENER_PRIORITY: i32 = TERMINAL_PRIORITY + 1;

/// Priority used when none is given
pub const DEFAULT_PRIORITY: i32 = 0;

/// Name of the message-received event for a queue
pub fn message_event_name(queue_name: &str) -> String {
    format!("{}.message_received", queue_name)
}

/// Name of the notification event for a queue
pub fn notification_event_name(queue_name: &str) -> String {
    format!("{}.on_notification", queue_name)
}

/// Whether the listener chain continues after a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Continue,
    Stop,
}

/// A message obtained from a queue, on its way to application code
#[derive(Debug, Clone)]
pub struct MessageEvent {
    queue_name: String,
    message: Message,
}

impl MessageEvent {
    pub fn new(queue_name: impl Into<String>, message: Message) -> Self {
        Self {
            queue_name: queue_name.into(),
            message,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn event_name(&self) -> String {
        message_event_name(&self.queue_name)
    }
}

/// A push notification addressed to a queue
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    queue_name: String,
    notification_type: NotificationType,
    notification: Notification,
}

impl NotificationEvent {
    pub fn new(
        queue_name: impl Into<String>,
        notification_type: NotificationType,
        notification: Notification,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            notification_type,
            notification,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn notification_type(&self) -> NotificationType {
        self.notification_type
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    pub fn event_name(&self) -> String {
        notification_event_name(&self.queue_name)
    }
}

/// Listener for message-received events
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, event: &MessageEvent) -> Result<Propagation, QueueError>;
}

/// Listener for notification events.
///
/// Receives the dispatcher so it can emit follow-up message events.
#[async_trait]
pub trait NotificationListener: Send + Sync {
    async fn on_notification(
        &self,
        event: &NotificationEvent,
        dispatcher: &EventDispatcher,
    ) -> Result<Propagation, QueueError>;
}

struct FnMessageListener<F>(F);

#[async_trait]
impl<F> MessageListener for FnMessageListener<F>
where
    F: Fn(&MessageEvent) -> Result<Propagation, QueueError> + Send + Sync,
{
    async fn on_message(&self, event: &MessageEvent) -> Result<Propagation, QueueError> {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as a message listener
pub fn message_listener_fn<F>(f: F) -> Arc<dyn MessageListener>
where
    F: Fn(&MessageEvent) -> Result<Propagation, QueueError> + Send + Sync + 'static,
{
    Arc::new(FnMessageListener(f))
}

struct FnNotificationListener<F>(F);

#[async_trait]
impl<F> NotificationListener for FnNotificationListener<F>
where
    F: Fn(&NotificationEvent) -> Result<Propagation, QueueError> + Send + Sync,
{
    async fn on_notification(
        &self,
        event: &NotificationEvent,
        _dispatcher: &EventDispatcher,
    ) -> Result<Propagation, QueueError> {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as a notification listener
pub fn notification_listener_fn<F>(f: F) -> Arc<dyn NotificationListener>
where
    F: Fn(&NotificationEvent) -> Result<Propagation, QueueError> + Send + Sync + 'static,
{
    Arc::new(FnNotificationListener(f))
}

/// Result of running a listener chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOutcome {
    /// Number of listeners invoked
    pub invoked: usize,
    /// Whether a listener stopped propagation
    pub stopped: bool,
}

struct Registered<L: ?Sized> {
    priority: i32,
    sequence: u64,
    listener: Arc<L>,
}

impl<L: ?Sized> Clone for Registered<L> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            sequence: self.sequence,
            listener: Arc::clone(&self.listener),
        }
    }
}

type Chains<L> = RwLock<HashMap<String, Vec<Registered<L>>>>;

/// Ordered listener chains keyed by event name
#[derive(Default)]
pub struct EventDispatcher {
    message_listeners: Chains<dyn MessageListener>,
    notification_listeners: Chains<dyn NotificationListener>,
    sequence: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message listener for a queue. Priorities below
    /// [`LOWEST_LISTENER_PRIORITY`] are raised to it.
    pub fn add_message_listener(
        &self,
        queue_name: &str,
        priority: i32,
        listener: Arc<dyn MessageListener>,
    ) {
        if priority < LOWEST_LISTENER_PRIORITY {
            debug!(
                queue = queue_name,
                priority, "listener priority raised above the terminal delete"
            );
        }
        self.insert_message_listener(queue_name, priority.max(LOWEST_LISTENER_PRIORITY), listener);
    }

    /// Register the step that ends a queue's message chain
    pub(crate) fn add_terminal_listener(
        &self,
        queue_name: &str,
        listener: Arc<dyn MessageListener>,
    ) {
        self.insert_message_listener(queue_name, TERMINAL_PRIORITY, listener);
    }

    fn insert_message_listener(
        &self,
        queue_name: &str,
        priority: i32,
        listener: Arc<dyn MessageListener>,
    ) {
        let entry = Registered {
            priority,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            listener,
        };
        insert_sorted(
            &self.message_listeners,
            message_event_name(queue_name),
            entry,
        );
    }

    /// Register a notification listener for a queue
    pub fn add_notification_listener(
        &self,
        queue_name: &str,
        priority: i32,
        listener: Arc<dyn NotificationListener>,
    ) {
        let entry = Registered {
            priority,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            listener,
        };
        insert_sorted(
            &self.notification_listeners,
            notification_event_name(queue_name),
            entry,
        );
    }

    /// Number of listeners registered for an event name
    pub fn listener_count(&self, event_name: &str) -> usize {
        let messages = read_chain(&self.message_listeners, event_name).len();
        let notifications = read_chain(&self.notification_listeners, event_name).len();
        messages + notifications
    }

    /// Run the message-received chain for the event's queue
    pub async fn dispatch_message(
        &self,
        event: &MessageEvent,
    ) -> Result<DispatchOutcome, QueueError> {
        let event_name = event.event_name();
        let chain = read_chain(&self.message_listeners, &event_name);
        if chain.is_empty() {
            debug!(event = %event_name, "no listeners registered");
        }

        let mut outcome = DispatchOutcome::default();
        for entry in chain {
            outcome.invoked += 1;
            if entry.listener.on_message(event).await? == Propagation::Stop {
                debug!(
                    event = %event_name,
                    message_id = %event.message().id(),
                    priority = entry.priority,
                    "propagation stopped"
                );
                outcome.stopped = true;
                break;
            }
        }

        Ok(outcome)
    }

    /// Run the notification chain for the event's queue
    pub async fn dispatch_notification(
        &self,
        event: &NotificationEvent,
    ) -> Result<DispatchOutcome, QueueError> {
        let event_name = event.event_name();
        let chain = read_chain(&self.notification_listeners, &event_name);
        if chain.is_empty() {
            debug!(event = %event_name, "no listeners registered");
        }

        let mut outcome = DispatchOutcome::default();
        for entry in chain {
            outcome.invoked += 1;
            if entry.listener.on_notification(event, self).await? == Propagation::Stop {
                debug!(
                    event = %event_name,
                    notification_type = %event.notification_type(),
                    priority = entry.priority,
                    "propagation stopped"
                );
                outcome.stopped = true;
                break;
            }
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = |chains: &Chains<dyn MessageListener>| -> Vec<String> {
            chains
                .read()
                .map(|c| c.keys().cloned().collect())
                .unwrap_or_default()
        };
        f.debug_struct("EventDispatcher")
            .field("message_events", &events(&self.message_listeners))
            .finish_non_exhaustive()
    }
}

fn insert_sorted<L: ?Sized>(chains: &Chains<L>, event_name: String, entry: Registered<L>) {
    let mut chains = match chains.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let chain = chains.entry(event_name).or_default();
    chain.push(entry);
    chain.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
}

// Snapshot so no lock is held while listeners run
fn read_chain<L: ?Sized>(chains: &Chains<L>, event_name: &str) -> Vec<Registered<L>> {
    let chains = match chains.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    chains.get(event_name).cloned().unwrap_or_default()
}
