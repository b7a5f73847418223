//! # qpush CLI
//!
//! Command-line interface for queues declared in a qpush configuration file.
//!
//! This module provides CLI commands for:
//! - Provisioning queue resources (`build`)
//! - Publishing a message (`publish`)
//! - Receiving and processing one batch (`receive`)
//! - Removing queue resources (`destroy`)
//!
//! Every command prints one line per queue. Bulk commands continue past a
//! failing queue and report the failure count through the exit code.

use clap::{Parser, Subcommand};
use qpush_runtime::{
    dispatch_received, message_listener_fn, Cache, EventDispatcher, FilesystemCache,
    InMemoryCache, Message, MessageBody, PublishOptions, Propagation, ProviderContext,
    ProviderFactory, ProviderRegistry, QueueDefinition, QueueError, ReceiveOptions,
    DEFAULT_PREFIX, DEFAULT_PRIORITY,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// qpush - provider-agnostic message queues
#[derive(Parser, Debug)]
#[command(name = "qpush")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage and exercise qpush queues")]
pub struct Cli {
    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, env = "QPUSH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive; falls back to RUST_LOG
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Create queue resources; all queues when none is named
    Build {
        /// Queue to build
        queue: Option<String>,
    },

    /// Publish one message to a queue
    Publish {
        /// Target queue
        queue: String,

        /// Message body; JSON objects and arrays are sent as structured bodies
        message: String,
    },

    /// Receive one batch and run it through the listener chain
    Receive {
        /// Queue to receive from; all queues when omitted
        queue: Option<String>,

        /// Maximum messages per queue
        #[arg(short = 'n', long)]
        max_messages: Option<u32>,
    },

    /// Remove queue resources and cached handles
    Destroy {
        /// Queue to destroy; all queues when omitted
        queue: Option<String>,

        /// Required; destroying removes every pending message
        #[arg(long)]
        force: bool,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Unknown queue: {name}")]
    UnknownQueue { name: String },

    #[error("Refusing to destroy without --force")]
    DestroyNotForced,

    #[error("Logging setup failed: {message}")]
    Logging { message: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl CliError {
    /// Process exit code for the error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Queue(_) => 1,
            Self::Configuration(_) => 2,
            Self::UnknownQueue { .. } => 3,
            Self::DestroyNotForced => 4,
            Self::Logging { .. } => 5,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] config::ConfigError),

    #[error("No queues configured")]
    NoQueues,
}

// ============================================================================
// Configuration Types
// ============================================================================

/// CLI configuration structure
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct CliConfig {
    /// Prefix for backend resource names
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Handle cache file; handles are kept in memory only when absent
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Queue definitions keyed by logical name
    #[serde(default)]
    pub queues: BTreeMap<String, QueueDefinition>,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            cache_path: None,
            queues: BTreeMap::new(),
        }
    }
}

/// Load configuration from an optional file layered with `QPUSH__` variables.
///
/// Environment variables use `__` as the nesting separator, e.g.
/// `QPUSH__QUEUES__ORDERS__OPTIONS__FIFO=true`.
pub fn load_configuration(path: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(config::File::from(path).required(true));
        debug!(path = %path.display(), "loading configuration file");
    }

    let config: CliConfig = builder
        .add_source(
            config::Environment::with_prefix("QPUSH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    if config.queues.is_empty() {
        return Err(ConfigError::NoQueues);
    }

    Ok(config)
}

// ============================================================================
// Logging
// ============================================================================

/// Install the tracing subscriber; logs go to stderr so stdout stays parseable
pub fn initialize_logging(level: Option<&str>, json: bool) -> Result<(), CliError> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).map_err(|e| CliError::Logging {
            message: e.to_string(),
        })?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

// ============================================================================
// Command Execution
// ============================================================================

/// Output of a command: printed lines and the number of failed queues
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub lines: Vec<String>,
    pub failures: usize,
}

impl Report {
    fn ok(&mut self, queue: &str, detail: impl std::fmt::Display) {
        self.lines.push(format!("{}: {}", queue, detail));
    }

    fn failed(&mut self, queue: &str, error: &QueueError) {
        warn!(queue, error = %error, "queue operation failed");
        self.lines.push(format!("{}: failed: {}", queue, error));
        self.failures += 1;
    }
}

/// Main CLI entry point
pub async fn run_cli() -> Result<Report, CliError> {
    let cli = Cli::parse();
    initialize_logging(cli.log_level.as_deref(), cli.json_logs)?;

    let config = load_configuration(cli.config.as_deref())?;
    execute(cli.command, &config).await
}

/// Definitions addressed by a command; every queue when `queue` is `None`
fn select<'a>(
    config: &'a CliConfig,
    queue: Option<&str>,
) -> Result<BTreeMap<&'a String, &'a QueueDefinition>, CliError> {
    match queue {
        Some(name) => config
            .queues
            .get_key_value(name)
            .map(|entry| BTreeMap::from([entry]))
            .ok_or_else(|| CliError::UnknownQueue {
                name: name.to_string(),
            }),
        None => Ok(config.queues.iter().collect()),
    }
}

async fn context(config: &CliConfig) -> Result<ProviderContext, CliError> {
    let cache: Arc<dyn Cache> = match &config.cache_path {
        Some(path) => Arc::new(FilesystemCache::open(path.clone()).await?),
        None => Arc::new(InMemoryCache::new()),
    };
    Ok(ProviderContext::new(
        config.prefix.clone(),
        cache,
        Arc::new(EventDispatcher::new()),
    ))
}

/// Build the addressed providers into a bound registry.
///
/// A named queue that fails to build is an error. Without a name, the failure
/// goes into `report` and the remaining queues are still built.
async fn build_selected(
    config: &CliConfig,
    queue: Option<&str>,
    report: &mut Report,
) -> Result<(ProviderRegistry, ProviderContext), CliError> {
    let selected = select(config, queue)?;
    let ctx = context(config).await?;

    let mut registry = ProviderRegistry::new();
    for (name, definition) in selected {
        match ProviderFactory::build(name, definition, &ctx).await {
            Ok(provider) => registry.add_provider(name.clone(), provider),
            Err(e) if queue.is_none() => report.failed(name, &e),
            Err(e) => return Err(e.into()),
        }
    }

    registry.bind(&ctx.dispatcher());
    debug!(queues = registry.len(), "provider registry ready");
    Ok((registry, ctx))
}

/// Execute one command against the configured queues
pub async fn execute(command: Commands, config: &CliConfig) -> Result<Report, CliError> {
    match command {
        Commands::Build { queue } => execute_build(config, queue.as_deref()).await,
        Commands::Publish { queue, message } => execute_publish(config, &queue, &message).await,
        Commands::Receive {
            queue,
            max_messages,
        } => execute_receive(config, queue.as_deref(), max_messages).await,
        Commands::Destroy { queue, force } => {
            if !force {
                return Err(CliError::DestroyNotForced);
            }
            execute_destroy(config, queue.as_deref()).await
        }
    }
}

async fn execute_build(config: &CliConfig, queue: Option<&str>) -> Result<Report, CliError> {
    let mut report = Report::default();
    let (registry, _ctx) = build_selected(config, queue, &mut report).await?;

    for provider in registry.all() {
        match provider.create().await {
            Ok(_) => {
                info!(queue = provider.name(), "queue built");
                report.ok(provider.name(), format!("built ({})", provider.name_with_prefix()));
            }
            Err(e) => report.failed(provider.name(), &e),
        }
    }

    Ok(report)
}

async fn execute_publish(
    config: &CliConfig,
    queue: &str,
    message: &str,
) -> Result<Report, CliError> {
    let mut report = Report::default();
    let (registry, _ctx) = build_selected(config, Some(queue), &mut report).await?;
    let provider = registry.get(queue)?;

    match provider
        .publish(MessageBody::from_wire(message), PublishOptions::default())
        .await
    {
        Ok(id) => report.ok(queue, format!("published {}", id)),
        Err(e) => report.failed(queue, &e),
    }

    Ok(report)
}

fn describe(message: &Message) -> String {
    let body = match message.body().as_text() {
        Some(text) => text.to_string(),
        None => message
            .body()
            .to_wire()
            .unwrap_or_else(|_| "<unprintable>".to_string()),
    };
    format!("{} {}", message.id(), body)
}

async fn execute_receive(
    config: &CliConfig,
    queue: Option<&str>,
    max_messages: Option<u32>,
) -> Result<Report, CliError> {
    let mut report = Report::default();
    let (registry, ctx) = build_selected(config, queue, &mut report).await?;
    let dispatcher = ctx.dispatcher();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in registry.names() {
        let sink = Arc::clone(&seen);
        dispatcher.add_message_listener(
            &name,
            DEFAULT_PRIORITY,
            message_listener_fn(move |event| {
                let mut seen = match sink.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                seen.push(describe(event.message()));
                Ok(Propagation::Continue)
            }),
        );
    }

    let mut options = ReceiveOptions::new();
    if let Some(max) = max_messages {
        options = options.with_max_messages(max);
    }

    for provider in registry.all() {
        match dispatch_received(provider.as_ref(), &dispatcher, options.clone()).await {
            Ok(handled) => {
                let lines: Vec<String> = match seen.lock() {
                    Ok(mut guard) => guard.drain(..).collect(),
                    Err(poisoned) => poisoned.into_inner().drain(..).collect(),
                };
                for line in lines {
                    report.ok(provider.name(), line);
                }
                report.ok(provider.name(), format!("received {}", handled));
            }
            Err(e) => report.failed(provider.name(), &e),
        }
    }

    Ok(report)
}

async fn execute_destroy(config: &CliConfig, queue: Option<&str>) -> Result<Report, CliError> {
    let mut report = Report::default();
    let (registry, _ctx) = build_selected(config, queue, &mut report).await?;

    for provider in registry.all() {
        match provider.destroy().await {
            Ok(_) => {
                info!(queue = provider.name(), "queue destroyed");
                report.ok(provider.name(), "destroyed");
            }
            Err(e) => report.failed(provider.name(), &e),
        }
    }

    Ok(report)
}
