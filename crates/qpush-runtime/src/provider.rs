//! Provider types and configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Enumeration of supported queue providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// AWS SQS, optionally fanned out through SNS
    Aws,
    /// Directory of message files on a local or shared filesystem
    File,
    /// Rows in a transactional message store
    Store,
    /// Same-process synchronous delivery
    Sync,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::File => "file",
            Self::Store => "store",
            Self::Sync => "sync",
        }
    }

    /// Check if provider can fan out through push notifications
    pub fn supports_push(&self) -> bool {
        match self {
            Self::Aws => true,
            Self::File => false,
            Self::Store => false,
            Self::Sync => false,
        }
    }

    /// Check if failed processing leads to redelivery
    pub fn redelivers_on_failure(&self) -> bool {
        match self {
            Self::Aws => true,
            Self::File => true,
            // Rows are marked delivered when fetched
            Self::Store => false,
            Self::Sync => false,
        }
    }

    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::Aws => 256 * 1024,
            Self::File => 10 * 1024 * 1024,
            Self::Store => 10 * 1024 * 1024,
            Self::Sync => usize::MAX,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Aws(AwsConfig),
    File(FileConfig),
    Store(StoreConfig),
    Sync,
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Aws(_) => ProviderType::Aws,
            Self::File(_) => ProviderType::File,
            Self::Store(_) => ProviderType::Store,
            Self::Sync => ProviderType::Sync,
        }
    }
}

/// AWS configuration shared by the SQS and SNS clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Endpoint override (e.g. LocalStack); used for both SQS and SNS
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// File provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Base directory; each queue gets a hashed subdirectory
    pub path: PathBuf,
    /// Fraction of `delete` calls that also sweep expired files
    #[serde(default = "default_cleanup_probability")]
    pub cleanup_probability: f64,
}

fn default_cleanup_probability() -> f64 {
    0.1
}

/// Store provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file; `:memory:` keeps rows in process memory
    pub path: PathBuf,
}

/// Delivery protocol of a fan-out subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriberProtocol {
    Http,
    Https,
    Email,
    EmailJson,
    Sqs,
    Lambda,
    Sms,
    Application,
}

impl SubscriberProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Email => "email",
            Self::EmailJson => "email-json",
            Self::Sqs => "sqs",
            Self::Lambda => "lambda",
            Self::Sms => "sms",
            Self::Application => "application",
        }
    }
}

/// External endpoint subscribed to a queue's fan-out topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub protocol: SubscriberProtocol,
    pub endpoint: String,
}

/// Per-queue behaviour. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Literal backend resource name, bypassing the prefix
    pub queue_name: Option<String>,
    pub push_notifications: bool,
    /// Delivery retries requested for HTTP(S) subscribers
    pub notification_retries: u32,
    pub message_delay: u64,
    pub message_timeout: u64,
    pub message_expiration: u64,
    pub messages_to_receive: u32,
    pub receive_wait_time: u64,
    pub fifo: bool,
    pub content_based_deduplication: bool,
    pub subscribers: Vec<Subscriber>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            queue_name: None,
            push_notifications: false,
            notification_retries: 3,
            message_delay: 0,
            message_timeout: 30,
            message_expiration: 604_800,
            messages_to_receive: 1,
            receive_wait_time: 3,
            fifo: false,
            content_based_deduplication: false,
            subscribers: Vec::new(),
        }
    }
}

impl QueueOptions {
    /// Check the options make sense for the given provider
    pub fn validate(&self, provider: ProviderType) -> Result<(), ConfigurationError> {
        if self.push_notifications && !provider.supports_push() {
            return Err(ConfigurationError::Unsupported {
                provider: provider.to_string(),
                feature: "push notifications".to_string(),
            });
        }

        if !self.subscribers.is_empty() && !self.push_notifications {
            return Err(ConfigurationError::Invalid {
                message: "subscribers require push_notifications to be enabled".to_string(),
            });
        }

        if self.fifo && provider != ProviderType::Aws {
            return Err(ConfigurationError::Unsupported {
                provider: provider.to_string(),
                feature: "FIFO queues".to_string(),
            });
        }

        if self.content_based_deduplication && !self.fifo {
            return Err(ConfigurationError::Invalid {
                message: "content_based_deduplication requires fifo".to_string(),
            });
        }

        if self.messages_to_receive == 0 {
            return Err(ConfigurationError::Invalid {
                message: "messages_to_receive must be at least 1".to_string(),
            });
        }

        if self.message_delay >= self.message_expiration {
            return Err(ConfigurationError::Invalid {
                message: "message_delay must be shorter than message_expiration".to_string(),
            });
        }

        for subscriber in &self.subscribers {
            if subscriber.endpoint.trim().is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "subscribers.endpoint".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Declaration of one queue: which backend, and how it behaves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub options: QueueOptions,
}

impl QueueDefinition {
    pub fn new(provider: ProviderConfig, options: QueueOptions) -> Self {
        Self { provider, options }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.options.validate(self.provider.provider_type())
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
