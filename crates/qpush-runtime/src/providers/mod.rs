//! Queue provider implementations.
//!
//! This module contains the concrete `QueueProvider` implementations for the
//! supported backends, plus the AWS HTTP clients and in-process fakes.

pub mod aws;
pub mod aws_http;
pub mod aws_memory;
pub mod file;
pub mod store;
pub mod sync;

pub use aws::{
    AwsProvider, PublishRequest, ReceiveMessageRequest, SendMessageRequest, SnsApi,
    SnsSubscription, SqsApi, SqsMessage,
};
pub use aws_http::{AwsCredentials, AwsError, HttpSnsClient, HttpSqsClient};
pub use aws_memory::{InMemorySns, InMemorySqs};
pub use file::FileProvider;
pub use store::StoreProvider;
pub use sync::SyncProvider;
