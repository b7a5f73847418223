//! Common test utilities for qpush integration tests
//!
//! This module provides:
//! - Provider contexts and queue definitions for the local backends
//! - AWS providers wired to the in-process SQS and SNS fakes
//! - Listeners that record what reached the application

use qpush_runtime::providers::{AwsProvider, InMemorySns, InMemorySqs, SnsApi, SqsApi};
use qpush_runtime::{
    message_listener_fn, Cache, EventDispatcher, FileConfig, InMemoryCache, MessageEvent,
    Propagation, ProviderConfig, ProviderContext, ProviderRegistry, QueueDefinition, QueueError,
    QueueIdentity, QueueOptions, QueueProvider, StoreConfig, DEFAULT_PREFIX,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

// ============================================================================
// Local Backends
// ============================================================================

#[allow(dead_code)]
pub fn context() -> ProviderContext {
    ProviderContext::new(
        DEFAULT_PREFIX,
        Arc::new(InMemoryCache::new()),
        Arc::new(EventDispatcher::new()),
    )
}

#[allow(dead_code)]
pub fn file_definition(path: &Path) -> QueueDefinition {
    QueueDefinition::new(
        ProviderConfig::File(FileConfig {
            path: path.to_path_buf(),
            cleanup_probability: 0.0,
        }),
        QueueOptions::default(),
    )
}

#[allow(dead_code)]
pub fn store_definition(path: &Path) -> QueueDefinition {
    QueueDefinition::new(
        ProviderConfig::Store(StoreConfig {
            path: path.to_path_buf(),
        }),
        QueueOptions::default(),
    )
}

// ============================================================================
// AWS Fakes
// ============================================================================

/// AWS provider for queue `orders` bound into its own registry
#[allow(dead_code)]
pub struct AwsFixture {
    pub sqs: Arc<InMemorySqs>,
    pub sns: Arc<InMemorySns>,
    pub dispatcher: Arc<EventDispatcher>,
    pub registry: ProviderRegistry,
    pub provider: Arc<dyn QueueProvider>,
}

#[allow(dead_code)]
impl AwsFixture {
    pub const QUEUE_URL: &'static str =
        "https://sqs.us-east-1.amazonaws.com/000000000000/qpush_orders";
    pub const TOPIC_ARN: &'static str = "arn:aws:sns:us-east-1:000000000000:qpush_orders";

    pub fn new(options: QueueOptions) -> Self {
        let sqs = Arc::new(InMemorySqs::default());
        let sns = Arc::new(InMemorySns::new(Arc::clone(&sqs)));
        let identity = QueueIdentity::new("orders", DEFAULT_PREFIX, None).unwrap();
        let provider: Arc<dyn QueueProvider> = Arc::new(AwsProvider::new(
            identity,
            options,
            Arc::clone(&sqs) as Arc<dyn SqsApi>,
            Arc::clone(&sns) as Arc<dyn SnsApi>,
            Arc::new(InMemoryCache::new()) as Arc<dyn Cache>,
        ));

        let dispatcher = Arc::new(EventDispatcher::new());
        let mut registry = ProviderRegistry::new();
        registry.add_provider("orders", Arc::clone(&provider));
        registry.bind(&dispatcher);

        Self {
            sqs,
            sns,
            dispatcher,
            registry,
            provider,
        }
    }
}

// ============================================================================
// Recording Listeners
// ============================================================================

/// Message bodies seen by a listener, in delivery order
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn record(&self, event: &MessageEvent) {
        let body = event.message().body();
        let text = match body.as_text() {
            Some(text) => text.to_string(),
            None => body.to_wire().unwrap(),
        };
        self.seen.lock().unwrap().push(text);
    }

    /// Attach to `queue`, letting the chain continue to the delete step
    pub fn attach(&self, dispatcher: &EventDispatcher, queue: &str) {
        self.attach_with(dispatcher, queue, |_| Ok(Propagation::Continue));
    }

    /// Attach to `queue`, deciding the chain outcome per message
    pub fn attach_with<F>(&self, dispatcher: &EventDispatcher, queue: &str, outcome: F)
    where
        F: Fn(&MessageEvent) -> Result<Propagation, QueueError> + Send + Sync + 'static,
    {
        let recorder = self.clone();
        dispatcher.add_message_listener(
            queue,
            10,
            message_listener_fn(move |event| {
                recorder.record(event);
                outcome(event)
            }),
        );
    }
}
