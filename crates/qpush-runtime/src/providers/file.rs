//! File provider: one JSON file per message on a local or shared filesystem.
//!
//! Layout under the configured base path:
//!
//! ```text
//! <base>/<sha256(name_with_prefix)>/<shard>/<message id>.json
//! ```
//!
//! The shard is the first three hex characters of the hash of the publish
//! timestamp, which keeps directories small. A received message is claimed
//! with a non-blocking exclusive lock held by the provider until the message
//! is deleted; dropping the provider releases every claim so the messages are
//! delivered again. Locking and reading message files run on tokio's blocking
//! pool.

use crate::client::QueueProvider;
use crate::error::{ConfigurationError, QueueError};
use crate::message::{
    Message, MessageBody, MessageId, Metadata, PublishOptions, QueueIdentity, ReceiveOptions,
};
use crate::provider::{ProviderType, QueueOptions};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;

const MESSAGE_EXTENSION: &str = "json";

/// A received message whose file this provider holds locked
struct Claim {
    path: PathBuf,
    file: File,
}

/// Queue provider backed by a directory of message files
pub struct FileProvider {
    identity: QueueIdentity,
    options: QueueOptions,
    queue_dir: PathBuf,
    cleanup_probability: f64,
    claims: Mutex<HashMap<String, Claim>>,
}

impl FileProvider {
    pub fn new(
        identity: QueueIdentity,
        options: QueueOptions,
        base_path: PathBuf,
        cleanup_probability: f64,
    ) -> Result<Self, QueueError> {
        if !(0.0..=1.0).contains(&cleanup_probability) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "cleanup_probability must be between 0 and 1, got {}",
                    cleanup_probability
                ),
            }
            .into());
        }

        let queue_dir = base_path.join(sha256_hex(&identity.name_with_prefix()));
        Ok(Self {
            identity,
            options,
            queue_dir,
            cleanup_probability,
            claims: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding this queue's messages
    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    fn expiration(&self) -> Duration {
        Duration::from_secs(self.options.message_expiration)
    }

    /// Message files of the queue, oldest first
    async fn message_files(&self) -> Result<Vec<(PathBuf, Duration)>, QueueError> {
        let mut files = Vec::new();
        let mut shards = match tokio::fs::read_dir(&self.queue_dir).await {
            Ok(shards) => shards,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(MESSAGE_EXTENSION) {
                    continue;
                }

                // Files can vanish while we walk; another consumer deleted them
                let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                let age = now.duration_since(modified).unwrap_or_default();
                files.push((path, age));
            }
        }

        files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(files)
    }

    /// Remove expired message files no consumer holds. Returns the number removed.
    pub async fn cleanup_expired(&self) -> Result<usize, QueueError> {
        let expiration = self.expiration();
        let mut removed = 0;

        for (path, age) in self.message_files().await? {
            if age < expiration {
                continue;
            }
            let claim_path = path.clone();
            let Some(file) = run_blocking(move || try_claim(&claim_path)).await? else {
                continue;
            };

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            FileExt::unlock(&file)?;
        }

        if removed > 0 {
            debug!(queue = %self.identity, removed, "expired messages removed");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for FileProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileProvider")
            .field("identity", &self.identity)
            .field("queue_dir", &self.queue_dir)
            .field("cleanup_probability", &self.cleanup_probability)
            .finish_non_exhaustive()
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

async fn run_blocking<T, F>(f: F) -> Result<T, QueueError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, QueueError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QueueError::Storage {
            message: format!("file task failed: {}", e),
        })?
}

/// Open and exclusively lock a message file; `None` when another consumer
/// holds it or it no longer exists
fn try_claim(path: &Path) -> Result<Option<File>, QueueError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    lock_if_current(file, path)
}

/// Lock an opened message file, keeping it only while `path` still names it.
///
/// The holder of a claim deletes the file before unlocking, so a consumer that
/// opened the file earlier can win the lock on an unlinked inode.
fn lock_if_current(file: File, path: &Path) -> Result<Option<File>, QueueError> {
    if file.try_lock_exclusive().is_err() {
        return Ok(None);
    }

    if is_same_file(&file, path)? {
        Ok(Some(file))
    } else {
        FileExt::unlock(&file)?;
        Ok(None)
    }
}

fn is_same_file(file: &File, path: &Path) -> Result<bool, QueueError> {
    let held = file.metadata()?;
    let current = match std::fs::metadata(path) {
        Ok(current) => current,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok(held.dev() == current.dev() && held.ino() == current.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = (held, current);
        Ok(true)
    }
}

#[async_trait]
impl QueueProvider for FileProvider {
    fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::File
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn create(&self) -> Result<bool, QueueError> {
        tokio::fs::create_dir_all(&self.queue_dir).await?;
        debug!(queue = %self.identity, dir = %self.queue_dir.display(), "queue directory ready");
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

        let id = MessageId::generate();
        let published_at = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let shard_name = sha256_hex(&published_at);
        let shard = self.queue_dir.join(&shard_name[..3]);
        tokio::fs::create_dir_all(&shard).await?;

        // Readers only see complete files
        let temp_path = shard.join(format!(".{}.tmp", id));
        let path = shard.join(format!("{}.{}", id, MESSAGE_EXTENSION));
        tokio::fs::write(&temp_path, wire.as_bytes()).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(queue = %self.identity, message_id = %id, "message written");
        Ok(id)
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Message>, QueueError> {
        self.create().await?;

        let limit = options
            .max_messages
            .unwrap_or(self.options.messages_to_receive)
            .max(1) as usize;
        let delay = Duration::from_secs(self.options.message_delay);
        let expiration = self.expiration();

        let mut claims = self.claims.lock().await;
        let mut messages = Vec::new();

        for (path, age) in self.message_files().await? {
            if messages.len() >= limit {
                break;
            }
            if age < delay || age >= expiration {
                continue;
            }

            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if claims.contains_key(&id) {
                continue;
            }

            let claim_path = path.clone();
            let claimed = run_blocking(move || {
                let Some(mut file) = try_claim(&claim_path)? else {
                    return Ok(None);
                };
                let mut raw = String::new();
                let read = file.read_to_string(&mut raw).map(|_| raw);
                Ok(Some((file, read)))
            })
            .await?;

            let Some((file, read)) = claimed else {
                debug!(queue = %self.identity, message_id = %id, "message locked elsewhere");
                continue;
            };
            let raw = match read {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(queue = %self.identity, message_id = %id, error = %e, "unreadable message skipped");
                    FileExt::unlock(&file)?;
                    continue;
                }
            };

            let mut metadata = Metadata::new();
            metadata.insert(
                "path".to_string(),
                Value::String(path.display().to_string()),
            );
            messages.push(Message::new(
                id.clone(),
                MessageBody::from_wire(&raw),
                metadata,
            ));
            claims.insert(id, Claim { path, file });
        }

        debug!(queue = %self.identity, count = messages.len(), "messages received");
        Ok(messages)
    }

    async fn delete(&self, receipt: &str) -> Result<bool, QueueError> {
        let claim = self.claims.lock().await.remove(receipt);

        let deleted = match claim {
            Some(claim) => {
                match tokio::fs::remove_file(&claim.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                FileExt::unlock(&claim.file)?;
                debug!(queue = %self.identity, message_id = %receipt, "message file removed");
                true
            }
            None => false,
        };

        if rand::random::<f64>() < self.cleanup_probability {
            self.cleanup_expired().await?;
        }

        Ok(deleted)
    }

    async fn destroy(&self) -> Result<bool, QueueError> {
        self.claims.lock().await.clear();

        match tokio::fs::remove_dir_all(&self.queue_dir).await {
            Ok(()) => info!(queue = %self.identity, dir = %self.queue_dir.display(), "queue directory removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(queue = %self.identity, "queue directory already gone")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(true)
    }
}
