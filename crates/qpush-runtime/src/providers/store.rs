//! Store provider: messages as rows of a transactional [`MessageStore`].
//!
//! Delivery is at-most-once. `receive` marks rows delivered in the same
//! transaction that selects them, so a consumer that fails after receiving
//! does not get the message again.

use crate::client::QueueProvider;
use crate::error::QueueError;
use crate::message::{
    Message, MessageBody, MessageId, Metadata, PublishOptions, QueueIdentity, ReceiveOptions,
};
use crate::provider::{ProviderType, QueueOptions};
use crate::store::{MessageStore, StoredMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

pub struct StoreProvider {
    identity: QueueIdentity,
    options: QueueOptions,
    store: Arc<dyn MessageStore>,
}

impl StoreProvider {
    pub fn new(identity: QueueIdentity, options: QueueOptions, store: Arc<dyn MessageStore>) -> Self {
        Self {
            identity,
            options,
            store,
        }
    }

    /// Queue column value for this provider's rows
    fn queue_key(&self) -> String {
        self.identity.name_with_prefix()
    }

    /// Look up one row of this queue
    pub async fn find(&self, id: i64) -> Result<Option<StoredMessage>, QueueError> {
        self.store.find(&self.queue_key(), id).await
    }

    /// Number of rows of this queue, optionally filtered by delivery state
    pub async fn count(&self, delivered: Option<bool>) -> Result<u64, QueueError> {
        self.store.count(&self.queue_key(), delivered).await
    }

    fn to_message(row: StoredMessage) -> Message {
        let mut metadata = Metadata::new();
        metadata.insert(
            "created_at".to_string(),
            Value::String(row.created_at.to_rfc3339()),
        );
        metadata.insert("length".to_string(), Value::from(row.length));
        Message::new(row.id, MessageBody::from_wire(&row.message), metadata)
    }
}

impl std::fmt::Debug for StoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreProvider")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QueueProvider for StoreProvider {
    fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Store
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
        let wire = body.to_wire()?;
        let max_size = self.provider_type().max_message_size();
        if wire.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: wire.len(),
                max_size,
            });
        }

        let id = self.store.insert(&self.queue_key(), &wire).await?;
        debug!(queue = %self.identity, message_id = id, "message stored");
        Ok(MessageId::Integer(id))
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Message>, QueueError> {
        let limit = options
            .max_messages
            .unwrap_or(self.options.messages_to_receive)
            .max(1);

        let rows = self.store.take_undelivered(&self.queue_key(), limit).await?;
        debug!(queue = %self.identity, count = rows.len(), "rows taken");
        Ok(rows.into_iter().map(Self::to_message).collect())
    }

    async fn delete(&self, receipt: &str) -> Result<bool, QueueError> {
        let Some(id) = receipt.parse::<i64>().ok() else {
            debug!(queue = %self.identity, receipt, "receipt is not a row id");
            return Ok(false);
        };
        self.store.acknowledge(&self.queue_key(), id).await
    }

    async fn destroy(&self) -> Result<bool, QueueError> {
        let removed = self.store.purge(&self.queue_key()).await?;
        info!(queue = %self.identity, removed, "queue rows purged");
        Ok(true)
    }
}
