//! The provider contract and the factory that builds providers from configuration.

use crate::cache::Cache;
use crate::error::{ConfigurationError, QueueError};
use crate::events::{EventDispatcher, MessageEvent, NotificationEvent, Propagation};
use crate::message::{
    Message, MessageBody, MessageId, PublishOptions, QueueIdentity, ReceiveOptions,
};
use crate::provider::{ProviderConfig, ProviderType, QueueDefinition, QueueOptions};
use crate::providers::{
    AwsCredentials, AwsProvider, FileProvider, HttpSnsClient, HttpSqsClient, StoreProvider,
    SyncProvider,
};
use crate::registry::ProviderRegistry;
use crate::store::SqliteMessageStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Interface implemented by every queue backend.
///
/// A provider owns the full lifecycle of exactly one queue. All operations
/// surface backend failures to the caller; nothing is retried internally.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Logical identity of the queue
    fn identity(&self) -> &QueueIdentity;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Queue behaviour options
    fn options(&self) -> &QueueOptions;

    fn name(&self) -> &str {
        self.identity().name()
    }

    fn name_with_prefix(&self) -> String {
        self.identity().name_with_prefix()
    }

    /// Provision the backend resources. Safe to call any number of times.
    async fn create(&self) -> Result<bool, QueueError>;

    /// Send a message, creating the resource first when it does not exist yet
    async fn publish(
        &self,
        body: MessageBody,
        options: PublishOptions,
    ) -> Result<MessageId, QueueError>;

    /// Fetch pending messages; every message carries its delete token in metadata
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Message>, QueueError>;

    /// Remove or acknowledge one message by its delivery token.
    ///
    /// Returns `false` when there is nothing to delete against.
    async fn delete(&self, receipt: &str) -> Result<bool, QueueError>;

    /// Remove the backend resources and cached handles. Idempotent.
    async fn destroy(&self) -> Result<bool, QueueError>;

    /// Delivery token used to delete a received message
    fn receipt_for(&self, message: &Message) -> Option<String> {
        Some(message.id().to_string())
    }

    /// Handle a push notification addressed to this queue
    async fn on_notification(
        &self,
        event: &NotificationEvent,
        _dispatcher: &EventDispatcher,
    ) -> Result<Propagation, QueueError> {
        debug!(
            queue = %self.name(),
            provider = %self.provider_type(),
            notification_type = %event.notification_type(),
            "provider has no push support, notification ignored"
        );
        Ok(Propagation::Continue)
    }

    /// Terminal step of message processing: delete the message, then stop
    /// propagation.
    async fn on_message_received(&self, event: &MessageEvent) -> Result<Propagation, QueueError> {
        let message = event.message();
        let receipt = self
            .receipt_for(message)
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: message.id().to_string(),
            })?;

        if self.delete(&receipt).await? {
            debug!(queue = %self.name(), message_id = %message.id(), "message deleted");
        } else {
            warn!(
                queue = %self.name(),
                message_id = %message.id(),
                "message could not be deleted"
            );
        }

        Ok(Propagation::Stop)
    }
}

/// Receive one batch and dispatch a message-received event per message.
///
/// A failing listener chain leaves its message undeleted and does not stop the
/// remaining messages from being dispatched. Returns the number of messages
/// whose chain completed without error.
pub async fn dispatch_received(
    provider: &dyn QueueProvider,
    dispatcher: &EventDispatcher,
    options: ReceiveOptions,
) -> Result<usize, QueueError> {
    let messages = provider.receive(options).await?;
    let mut handled = 0;

    for message in messages {
        let message_id = message.id().clone();
        let event = MessageEvent::new(provider.name(), message);
        match dispatcher.dispatch_message(&event).await {
            Ok(_) => handled += 1,
            Err(e) => {
                warn!(
                    queue = %provider.name(),
                    message_id = %message_id,
                    error = %e,
                    "listener failed, message left for redelivery"
                );
            }
        }
    }

    Ok(handled)
}

// ============================================================================
// Factory
// ============================================================================

/// Shared collaborators handed to every provider the factory builds
pub struct ProviderContext {
    prefix: String,
    cache: Arc<dyn Cache>,
    dispatcher: Arc<EventDispatcher>,
    stores: Mutex<HashMap<PathBuf, Arc<SqliteMessageStore>>>,
}

impl ProviderContext {
    pub fn new(
        prefix: impl Into<String>,
        cache: Arc<dyn Cache>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            cache,
            dispatcher,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Store for a database path; queues sharing a path share one connection
    async fn store(&self, path: &PathBuf) -> Result<Arc<SqliteMessageStore>, QueueError> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(path) {
            return Ok(Arc::clone(store));
        }

        let store = if path.as_os_str() == ":memory:" {
            SqliteMessageStore::open_in_memory()?
        } else {
            SqliteMessageStore::open(path)?
        };
        let store = Arc::new(store);
        stores.insert(path.clone(), Arc::clone(&store));
        Ok(store)
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Builds providers from queue definitions
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create the provider for one named queue
    pub async fn build(
        name: &str,
        definition: &QueueDefinition,
        ctx: &ProviderContext,
    ) -> Result<Arc<dyn QueueProvider>, QueueError> {
        definition.validate()?;

        let options = definition.options.clone();
        let identity = QueueIdentity::new(name, ctx.prefix(), options.queue_name.clone())?;

        let provider: Arc<dyn QueueProvider> = match &definition.provider {
            ProviderConfig::Aws(config) => {
                let credentials = AwsCredentials::resolve(config)?;
                let sqs = HttpSqsClient::new(config, credentials.clone())
                    .map_err(|e| e.to_queue_error())?;
                let sns =
                    HttpSnsClient::new(config, credentials).map_err(|e| e.to_queue_error())?;
                Arc::new(AwsProvider::new(
                    identity,
                    options,
                    Arc::new(sqs),
                    Arc::new(sns),
                    ctx.cache(),
                ))
            }
            ProviderConfig::File(config) => Arc::new(FileProvider::new(
                identity,
                options,
                config.path.clone(),
                config.cleanup_probability,
            )?),
            ProviderConfig::Store(config) => {
                let store = ctx.store(&config.path).await?;
                Arc::new(StoreProvider::new(identity, options, store))
            }
            ProviderConfig::Sync => Arc::new(SyncProvider::new(
                identity,
                options,
                Arc::downgrade(&ctx.dispatcher),
            )),
        };

        debug!(
            queue = %name,
            provider = %provider.provider_type(),
            resource = %provider.name_with_prefix(),
            "provider built"
        );

        Ok(provider)
    }

    /// Build every queue into a registry bound to the context's dispatcher
    pub async fn build_registry<'a, I>(
        definitions: I,
        ctx: &ProviderContext,
    ) -> Result<ProviderRegistry, QueueError>
    where
        I: IntoIterator<Item = (&'a String, &'a QueueDefinition)>,
    {
        let mut registry = ProviderRegistry::new();
        for (name, definition) in definitions {
            let provider = Self::build(name, definition, ctx).await?;
            registry.add_provider(name.clone(), provider);
        }

        if registry.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "queues".to_string(),
            }
            .into());
        }

        registry.bind(&ctx.dispatcher);
        info!(queues = registry.len(), "provider registry ready");
        Ok(registry)
    }
}
