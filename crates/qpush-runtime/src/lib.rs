//! # qpush runtime
//!
//! Provider-agnostic message queues with push notification handling.
//!
//! One provider contract ([`QueueProvider`]: `create`, `publish`, `receive`,
//! `delete`, `destroy`) is implemented by interchangeable backends:
//! - AWS SQS, optionally fanned out through an SNS topic
//! - a directory of message files
//! - a SQLite message store (at-most-once)
//! - same-process synchronous delivery
//!
//! Received messages and push notifications flow through the
//! [`EventDispatcher`] as ordered listener chains. The provider's delete step
//! runs last, so a message is only removed after every application listener
//! handled it.
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Messages, notifications and queue identities
//! - [`provider`] - Provider types and configuration
//! - [`client`] - The provider contract and the provider factory
//! - [`providers`] - Backend implementations
//! - [`registry`] - Queue name to provider lookup
//! - [`events`] - Event routing between providers and listeners
//! - [`cache`] - Resource handle memoization
//! - [`store`] - Transactional message store
//! - [`push`] - Inbound SNS push payloads

pub mod cache;
pub mod client;
pub mod error;
pub mod events;
pub mod message;
pub mod provider;
pub mod providers;
pub mod push;
pub mod registry;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use cache::{resolve_handle, Cache, FilesystemCache, HandleSource, InMemoryCache};
pub use client::{dispatch_received, ProviderContext, ProviderFactory, QueueProvider};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use events::{
    message_event_name, message_listener_fn, notification_event_name, notification_listener_fn,
    DispatchOutcome, EventDispatcher, MessageEvent, MessageListener, NotificationEvent,
    NotificationListener, Propagation, DEFAULT_PRIORITY, LOWEST_LISTENER_PRIORITY,
    TERMINAL_PRIORITY,
};
pub use message::{
    HandleKind, Message, MessageBody, MessageId, Metadata, Notification, NotificationType,
    PublishOptions, QueueIdentity, ReceiveOptions, Timestamp, DEFAULT_PREFIX,
};
pub use provider::{
    AwsConfig, FileConfig, ProviderConfig, ProviderType, QueueDefinition, QueueOptions,
    StoreConfig, Subscriber, SubscriberProtocol,
};
pub use push::{parse_sns_request, route, InboundNotification, MESSAGE_TYPE_HEADER};
pub use registry::ProviderRegistry;
pub use store::{MessageStore, SqliteMessageStore, StoredMessage};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
