//! Sync provider: publishing dispatches the message to listeners in-process.
//!
//! There is no backend. `publish` runs the message-received chain before it
//! returns, so the caller observes listener failures directly.

use crate::client::QueueProvider;
use crate::error::{ConfigurationError, QueueError};
use crate::events::{EventDispatcher, MessageEvent};
use crate::message::{
    Message, MessageBody, MessageId, Metadata, PublishOptions, QueueIdentity, ReceiveOptions,
};
use crate::provider::{ProviderType, QueueOptions};
use async_trait::async_trait;
use std::sync::Weak;
use tracing::debug;

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;

pub struct SyncProvider {
    identity: QueueIdentity,
    options: QueueOptions,
    dispatcher: Weak<EventDispatcher>,
}

impl SyncProvider {
    /// The dispatcher is held weakly; it normally owns this provider's listeners
    pub fn new(
        identity: QueueIdentity,
        options: QueueOptions,
        dispatcher: Weak<EventDispatcher>,
    ) -> Self {
        Self {
            identity,
            options,
            dispatcher,
        }
    }
}

impl std::fmt::Debug for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("identity", &self.identity)
            .field("dispatcher_alive", &(self.dispatcher.strong_count() > 0))
            .finish()
    }
}

#[async_trait]
impl QueueProvider for SyncProvider {
    fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Sync
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn create(&self) -> Result<bool, QueueError> {
        Ok(true)
    }

    async fn publish(
        &self,
        body: MessageBody,
        _options: PublishOptions,
    ) -> Result<MessageId, QueueError> {
        let dispatcher = self.dispatcher.upgrade().ok_or_else(|| {
            ConfigurationError::Invalid {
                message: format!("event dispatcher for queue '{}' was dropped", self.identity),
            }
        })?;

        let id = MessageId::generate();
        let message = Message::new(id.clone(), body, Metadata::new());
        let outcome = dispatcher
            .dispatch_message(&MessageEvent::new(self.identity.name(), message))
            .await?;

        debug!(
            queue = %self.identity,
            message_id = %id,
            invoked = outcome.invoked,
            stopped = outcome.stopped,
            "message dispatched"
        );
        Ok(id)
    }

    async fn receive(&self, _options: ReceiveOptions) -> Result<Vec<Message>, QueueError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _receipt: &str) -> Result<bool, QueueError> {
        Ok(true)
    }

    async fn destroy(&self) -> Result<bool, QueueError> {
        Ok(true)
    }
}
