//! Tests for the file provider.

use super::*;
use std::fs::OpenOptions;
use tempfile::TempDir;

fn provider_in(base: &Path, options: QueueOptions) -> FileProvider {
    let identity = QueueIdentity::new("local", "qpush", None).unwrap();
    FileProvider::new(identity, options, base.to_path_buf(), 0.0).unwrap()
}

/// Pretend a message file was written `seconds` ago
fn age_file(path: &Path, seconds: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
        .unwrap();
}

fn message_paths(provider: &FileProvider) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for shard in std::fs::read_dir(provider.queue_dir()).unwrap() {
        for entry in std::fs::read_dir(shard.unwrap().path()).unwrap() {
            paths.push(entry.unwrap().path());
        }
    }
    paths
}

mod construction {
    use super::*;

    #[test]
    fn test_queue_dir_is_hashed_name() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());

        assert_eq!(
            provider.queue_dir(),
            dir.path().join(sha256_hex("qpush_local"))
        );
    }

    #[test]
    fn test_cleanup_probability_out_of_range_is_rejected() {
        let identity = QueueIdentity::new("local", "qpush", None).unwrap();
        let result = FileProvider::new(
            identity,
            QueueOptions::default(),
            PathBuf::from("/tmp"),
            1.5,
        );

        assert!(matches!(
            result,
            Err(QueueError::ConfigurationError(ConfigurationError::Invalid { .. }))
        ));
    }
}

mod lifecycle {
    use super::*;

    /// Creating twice leaves the same directory in place
    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());

        assert!(provider.create().await.unwrap());
        assert!(provider.create().await.unwrap());
        assert!(provider.queue_dir().is_dir());
    }

    #[tokio::test]
    async fn test_destroy_removes_tree_and_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());
        provider
            .publish(MessageBody::text("a"), PublishOptions::default())
            .await
            .unwrap();

        assert!(provider.destroy().await.unwrap());
        assert!(!provider.queue_dir().exists());
        assert!(provider.destroy().await.unwrap());
    }

    /// Receiving creates the queue directory on first use
    #[tokio::test]
    async fn test_receive_before_create_is_empty() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());

        assert!(provider
            .receive(ReceiveOptions::default())
            .await
            .unwrap()
            .is_empty());
        assert!(provider.queue_dir().is_dir());
    }
}

mod messaging {
    use super::*;

    /// Published files land in a three-character shard, written completely
    #[tokio::test]
    async fn test_publish_writes_sharded_json_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());

        let id = provider
            .publish(
                MessageBody::structured(serde_json::json!({"foo": "bar"})).unwrap(),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        let paths = message_paths(&provider);
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("{}.json", id));
        let shard = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(shard.len(), 3);
        assert_eq!(std::fs::read_to_string(path).unwrap(), r#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn test_receive_returns_body_and_path() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());
        let id = provider
            .publish(MessageBody::text("hello"), PublishOptions::default())
            .await
            .unwrap();

        let received = provider.receive(ReceiveOptions::default()).await.unwrap();

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id(), &id);
        assert_eq!(received[0].body().as_text(), Some("hello"));
        let path = received[0].metadata_str("path").unwrap();
        assert!(path.ends_with(&format!("{}.json", id)));
    }

    #[tokio::test]
    async fn test_receive_respects_batch_size() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());
        for i in 0..3 {
            provider
                .publish(MessageBody::text(format!("m{}", i)), PublishOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(provider.receive(ReceiveOptions::default()).await.unwrap().len(), 1);
        let rest = ReceiveOptions::new().with_max_messages(10);
        assert_eq!(provider.receive(rest).await.unwrap().len(), 2);
    }

    /// Messages younger than the delay or older than the expiration are skipped
    #[tokio::test]
    async fn test_receive_window_follows_delay_and_expiration() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(
            dir.path(),
            QueueOptions {
                message_delay: 10,
                message_expiration: 100,
                ..QueueOptions::default()
            },
        );
        for body in ["fresh", "ready", "expired"] {
            provider
                .publish(MessageBody::text(body), PublishOptions::default())
                .await
                .unwrap();
        }
        for path in message_paths(&provider) {
            match std::fs::read_to_string(&path).unwrap().as_str() {
                r#""ready""# => age_file(&path, 30),
                r#""expired""# => age_file(&path, 500),
                _ => {}
            }
        }

        let received = provider
            .receive(ReceiveOptions::new().with_max_messages(10))
            .await
            .unwrap();
        let bodies: Vec<&str> = received.iter().filter_map(|m| m.body().as_text()).collect();
        assert_eq!(bodies, vec!["ready"]);
    }

    #[tokio::test]
    async fn test_delete_removes_claimed_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());
        let id = provider
            .publish(MessageBody::text("a"), PublishOptions::default())
            .await
            .unwrap();
        provider.receive(ReceiveOptions::default()).await.unwrap();

        assert!(provider.delete(&id.to_string()).await.unwrap());
        assert!(message_paths(&provider).is_empty());
        assert!(!provider.delete(&id.to_string()).await.unwrap());
    }

    /// Only the consumer holding the claim may delete
    #[tokio::test]
    async fn test_delete_without_claim_returns_false() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());
        let id = provider
            .publish(MessageBody::text("a"), PublishOptions::default())
            .await
            .unwrap();

        assert!(!provider.delete(&id.to_string()).await.unwrap());
        assert_eq!(message_paths(&provider).len(), 1);
    }
}

mod locking {
    use super::*;

    /// Two consumers racing for one message: exactly one wins
    #[tokio::test]
    async fn test_concurrent_receives_are_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = provider_in(dir.path(), QueueOptions::default());
        let second = provider_in(dir.path(), QueueOptions::default());
        first
            .publish(MessageBody::text("only"), PublishOptions::default())
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            first.receive(ReceiveOptions::default()),
            second.receive(ReceiveOptions::default())
        );

        assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claimed_message_is_not_received_twice() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(dir.path(), QueueOptions::default());
        provider
            .publish(MessageBody::text("a"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.receive(ReceiveOptions::default()).await.unwrap().len(), 1);
        assert!(provider
            .receive(ReceiveOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    /// A consumer that opened a file before the owner deleted it must not
    /// claim the unlinked file
    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_after_delete_is_not_a_claim() {
        let dir = TempDir::new().unwrap();
        let owner = provider_in(dir.path(), QueueOptions::default());
        let id = owner
            .publish(MessageBody::text("once"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(owner.receive(ReceiveOptions::default()).await.unwrap().len(), 1);

        let path = message_paths(&owner).remove(0);
        let late = File::open(&path).unwrap();
        assert!(owner.delete(&id.to_string()).await.unwrap());

        assert!(lock_if_current(late, &path).unwrap().is_none());
    }

    /// A file replaced under the same name is not claimed through the old handle
    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_on_replaced_file_is_not_a_claim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("message.json");
        std::fs::write(&path, "old").unwrap();
        let stale = File::open(&path).unwrap();

        let replacement = dir.path().join("message.tmp");
        std::fs::write(&replacement, "new").unwrap();
        std::fs::rename(&replacement, &path).unwrap();

        assert!(lock_if_current(stale, &path).unwrap().is_none());
        let fresh = File::open(&path).unwrap();
        assert!(lock_if_current(fresh, &path).unwrap().is_some());
    }

    /// An undeleted message is delivered again once its claim is released
    #[tokio::test]
    async fn test_released_claim_allows_redelivery() {
        let dir = TempDir::new().unwrap();
        let id = {
            let consumer = provider_in(dir.path(), QueueOptions::default());
            let id = consumer
                .publish(MessageBody::text("again"), PublishOptions::default())
                .await
                .unwrap();
            assert_eq!(consumer.receive(ReceiveOptions::default()).await.unwrap().len(), 1);
            id
        };

        let next = provider_in(dir.path(), QueueOptions::default());
        let received = next.receive(ReceiveOptions::default()).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id(), &id);
    }
}

mod cleanup {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_files() {
        let dir = TempDir::new().unwrap();
        let provider = provider_in(
            dir.path(),
            QueueOptions {
                message_expiration: 100,
                ..QueueOptions::default()
            },
        );
        for body in ["old", "new"] {
            provider
                .publish(MessageBody::text(body), PublishOptions::default())
                .await
                .unwrap();
        }
        for path in message_paths(&provider) {
            if std::fs::read_to_string(&path).unwrap() == r#""old""# {
                age_file(&path, 500);
            }
        }

        assert_eq!(provider.cleanup_expired().await.unwrap(), 1);
        let remaining = message_paths(&provider);
        assert_eq!(remaining.len(), 1);
        assert_eq!(std::fs::read_to_string(&remaining[0]).unwrap(), r#""new""#);
    }

    /// With probability one every delete sweeps expired files
    #[tokio::test]
    async fn test_delete_triggers_cleanup() {
        let dir = TempDir::new().unwrap();
        let identity = QueueIdentity::new("local", "qpush", None).unwrap();
        let provider = FileProvider::new(
            identity,
            QueueOptions {
                message_expiration: 100,
                ..QueueOptions::default()
            },
            dir.path().to_path_buf(),
            1.0,
        )
        .unwrap();
        provider
            .publish(MessageBody::text("old"), PublishOptions::default())
            .await
            .unwrap();
        for path in message_paths(&provider) {
            age_file(&path, 500);
        }

        assert!(!provider.delete("unknown").await.unwrap());
        assert!(message_paths(&provider).is_empty());
    }
}
