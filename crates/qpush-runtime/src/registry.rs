//! Name to provider lookup, and the wiring of providers into the event router.

use crate::client::QueueProvider;
use crate::error::QueueError;
use crate::events::{
    EventDispatcher, MessageEvent, MessageListener, NotificationEvent, NotificationListener,
    Propagation, DEFAULT_PRIORITY,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

/// Registered providers keyed by logical queue name
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn QueueProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; a second registration under the same name replaces the first
    pub fn add_provider(&mut self, name: impl Into<String>, provider: Arc<dyn QueueProvider>) {
        let name = name.into();
        if self.providers.insert(name.clone(), provider).is_some() {
            debug!(queue = %name, "provider replaced");
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Look up a provider by queue name
    pub fn get(&self, name: &str) -> Result<Arc<dyn QueueProvider>, QueueError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    /// All providers, ordered by queue name
    pub fn all(&self) -> Vec<Arc<dyn QueueProvider>> {
        self.names()
            .iter()
            .filter_map(|name| self.providers.get(name).cloned())
            .collect()
    }

    /// Registered queue names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Register every provider's handlers with the dispatcher.
    ///
    /// The notification handler runs at default priority; the delete step is
    /// registered at [`TERMINAL_PRIORITY`](crate::TERMINAL_PRIORITY) so application listeners see each
    /// message before it is removed.
    pub fn bind(&self, dispatcher: &EventDispatcher) {
        for (name, provider) in &self.providers {
            dispatcher.add_notification_listener(
                name,
                DEFAULT_PRIORITY,
                Arc::new(ProviderNotificationListener {
                    provider: Arc::clone(provider),
                }),
            );
            dispatcher.add_terminal_listener(
                name,
                Arc::new(TerminalDeleteListener {
                    provider: Arc::clone(provider),
                }),
            );
        }
    }

    /// Map a topic name or ARN back to its queue name
    pub fn resolve_topic(&self, topic_name: &str) -> Option<String> {
        let topic_name = topic_name.rsplit(':').next().unwrap_or(topic_name);
        let topic_name = topic_name.strip_suffix(".fifo").unwrap_or(topic_name);
        self.providers
            .iter()
            .find(|(_, provider)| {
                let resource = provider.name_with_prefix();
                resource.strip_suffix(".fifo").unwrap_or(&resource) == topic_name
            })
            .map(|(name, _)| name.clone())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("queues", &self.names())
            .finish()
    }
}

/// Deletes a message once every application listener has seen it
struct TerminalDeleteListener {
    provider: Arc<dyn QueueProvider>,
}

#[async_trait]
impl MessageListener for TerminalDeleteListener {
    async fn on_message(&self, event: &MessageEvent) -> Result<Propagation, QueueError> {
        self.provider.on_message_received(event).await
    }
}

/// Hands notifications to the provider owning the queue
struct ProviderNotificationListener {
    provider: Arc<dyn QueueProvider>,
}

#[async_trait]
impl NotificationListener for ProviderNotificationListener {
    async fn on_notification(
        &self,
        event: &NotificationEvent,
        dispatcher: &EventDispatcher,
    ) -> Result<Propagation, QueueError> {
        self.provider.on_notification(event, dispatcher).await
    }
}
