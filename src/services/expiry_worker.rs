//! Background sweeper that enforces upload lifetimes.
//!
//! Three sources feed it: deletion messages scheduled at finalize time,
//! entries whose `expires_at` has passed without ever being finalized, and
//! single-shot shares past their lifetime.

use crate::{
    errors::ServiceResult,
    models::{delete_message::DeleteFileMessage, file_entry::FileEntry, file_upload::FileUpload},
    services::{
        block_store::BlockStore, file_upload_repository::FileUploadRepository,
        metadata_repository::MetadataRepository,
        notifier::{DueMessage, SqliteNotifier},
    },
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BATCH_SIZE: u32 = 100;
const CONCURRENCY: usize = 4;

/// Counts from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub messages: usize,
    pub blobs_deleted: usize,
    pub entries_deleted: u64,
    pub shares_released: usize,
}

#[derive(Clone)]
pub struct ExpiryWorker {
    notifier: SqliteNotifier,
    repo: MetadataRepository,
    shares: FileUploadRepository,
    store: Arc<dyn BlockStore>,
    container_name: String,
    poll_interval: Duration,
}

impl ExpiryWorker {
    pub fn new(
        notifier: SqliteNotifier,
        repo: MetadataRepository,
        shares: FileUploadRepository,
        store: Arc<dyn BlockStore>,
        container_name: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            notifier,
            repo,
            shares,
            store,
            container_name: container_name.into(),
            poll_interval,
        }
    }

    /// Run forever on a fixed interval. Sweep failures are logged and the
    /// next tick tries again.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once(Utc::now()).await {
                    Ok(report) if report != SweepReport::default() => {
                        info!(
                            "expiry sweep: {} messages, {} blobs deleted, {} entries removed, {} shares released",
                            report.messages,
                            report.blobs_deleted,
                            report.entries_deleted,
                            report.shares_released
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!("expiry sweep failed: {}", err),
                }
            }
        })
    }

    /// Process everything due at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> ServiceResult<SweepReport> {
        let mut report = SweepReport::default();

        let due = self.notifier.claim_due(now, BATCH_SIZE).await?;
        report.messages = due.len();
        let deleted = stream::iter(due)
            .map(|message| self.deliver(message))
            .buffer_unordered(CONCURRENCY)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        report.blobs_deleted += deleted;

        // Uploads that were abandoned before finalize never got a message.
        // A row is removed only once its blob is gone; failures stay for the
        // next tick.
        loop {
            let batch = self.repo.expired_entries(now, BATCH_SIZE).await?;
            let fetched = batch.len();
            let removed = stream::iter(batch)
                .map(|entry| self.expire_entry(entry))
                .buffer_unordered(CONCURRENCY)
                .filter(|ok| futures::future::ready(*ok))
                .count()
                .await;
            report.blobs_deleted += removed;
            report.entries_deleted += removed as u64;
            if removed == 0 || fetched < BATCH_SIZE as usize {
                break;
            }
        }

        loop {
            let batch = self.shares.expired_with_blobs(now, BATCH_SIZE).await?;
            let fetched = batch.len();
            let released = stream::iter(batch)
                .map(|share| self.release_share(share))
                .buffer_unordered(CONCURRENCY)
                .filter(|ok| futures::future::ready(*ok))
                .count()
                .await;
            report.blobs_deleted += released;
            report.shares_released += released;
            if released == 0 || fetched < BATCH_SIZE as usize {
                break;
            }
        }

        Ok(report)
    }

    /// Delete the blob of an expired entry, then the entry itself.
    async fn expire_entry(&self, entry: FileEntry) -> bool {
        let blob_name = entry.blob_name();
        if let Err(err) = self.store.delete_blob(&self.container_name, &blob_name).await {
            warn!("failed to delete blob {} for {}: {}", blob_name, entry.id, err);
            return false;
        }
        match self.repo.delete_file_entry(&entry.id).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!("failed to remove expired entry {}: {}", entry.id, err);
                false
            }
        }
    }

    /// Delete the blob of an expired share and clear it from the row.
    async fn release_share(&self, share: FileUpload) -> bool {
        let Some(blob_name) = share.blob_name else {
            return false;
        };
        if let Err(err) = self.store.delete_blob(&self.container_name, &blob_name).await {
            warn!("failed to delete blob {} for share {}: {}", blob_name, share.id, err);
            return false;
        }
        match self.shares.release_blob(&share.id).await {
            Ok(released) => released,
            Err(err) => {
                warn!("failed to release share {}: {}", share.id, err);
                false
            }
        }
    }

    /// Handle one deletion message. Returns whether the blob was removed.
    async fn deliver(&self, due: DueMessage) -> bool {
        let payload: DeleteFileMessage = match due.message().decode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("dropping undecodable message {}: {}", due.id, err);
                return false;
            }
        };

        if let Err(err) = self
            .store
            .delete_blob(&payload.container_name, &payload.file_name)
            .await
        {
            warn!(
                "failed to delete {}/{}: {}",
                payload.container_name, payload.file_name, err
            );
            return false;
        }

        match self.repo.delete_file_entry(&payload.file_id).await {
            Ok(removed) => debug!("expired {} (entry removed: {})", payload.file_id, removed),
            Err(err) => warn!("failed to remove entry {}: {}", payload.file_id, err),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::{chunk::block_id_for, expiry::ExpiryDuration},
        services::{
            block_store::{LocalBlockStore, UrlSigner},
            notifier::{DeferredNotifier, QueuedMessage},
        },
    };
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    struct Fixture {
        worker: ExpiryWorker,
        repo: MetadataRepository,
        shares: FileUploadRepository,
        notifier: SqliteNotifier,
        store: Arc<LocalBlockStore>,
    }

    async fn fixture() -> Fixture {
        let db = memory_pool().await;
        let root = std::env::temp_dir().join(format!("chunk-share-expiry-{}", Uuid::new_v4()));
        let store = Arc::new(LocalBlockStore::new(root, UrlSigner::new("http://x", "k")));
        let repo = MetadataRepository::new(db.clone());
        let shares = FileUploadRepository::new(db.clone());
        let notifier = SqliteNotifier::new(db);
        let worker = ExpiryWorker::new(
            notifier.clone(),
            repo.clone(),
            shares.clone(),
            store.clone(),
            "snappshare",
            Duration::from_secs(10),
        );
        Fixture {
            worker,
            repo,
            shares,
            notifier,
            store,
        }
    }

    async fn committed_entry(f: &Fixture) -> FileEntry {
        let entry = f
            .repo
            .create(&FileEntry::new("a.txt", "h", 3, 1, ExpiryDuration::OneDay))
            .await
            .unwrap();
        f.store
            .stage_block("snappshare", &entry.blob_name(), &block_id_for(0), Bytes::from_static(b"abc"))
            .await
            .unwrap();
        f.store
            .commit_block_list("snappshare", &entry.blob_name(), &[block_id_for(0)])
            .await
            .unwrap();
        entry
    }

    #[tokio::test]
    async fn due_message_deletes_blob_and_entry() {
        let f = fixture().await;
        let entry = committed_entry(&f).await;
        let message = DeleteFileMessage {
            file_id: entry.id.clone(),
            file_name: entry.blob_name(),
            container_name: "snappshare".into(),
            expires_at: Utc::now(),
        };
        f.notifier
            .send(QueuedMessage::json(&message).unwrap())
            .await
            .unwrap();

        let report = f
            .worker
            .run_once(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();

        assert_eq!(report.messages, 1);
        assert_eq!(report.blobs_deleted, 1);
        assert!(f.repo.find_by_id(&entry.id).await.unwrap().is_none());
        assert!(matches!(
            f.store.open_blob("snappshare", &entry.blob_name()).await,
            Err(crate::errors::ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn abandoned_uploads_are_swept_after_expiry() {
        let f = fixture().await;
        let entry = f
            .repo
            .create(&FileEntry::new("b.txt", "h2", 3, 2, ExpiryDuration::OneMinute))
            .await
            .unwrap();
        f.store
            .stage_block("snappshare", &entry.blob_name(), &block_id_for(0), Bytes::from_static(b"a"))
            .await
            .unwrap();

        let early = f.worker.run_once(Utc::now()).await.unwrap();
        assert_eq!(early, SweepReport::default());

        let report = f
            .worker
            .run_once(Utc::now() + ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert_eq!(report.entries_deleted, 1);
        assert!(f.repo.find_by_id(&entry.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_spans_batches_and_keeps_rows_whose_blob_survived() {
        let f = fixture().await;
        let mut entries = Vec::new();
        for _ in 0..150 {
            entries.push(committed_entry(&f).await);
        }
        // The store refuses this blob name, so its delete always fails.
        let stuck = f
            .repo
            .create(&FileEntry::new("bad\nname", "hs", 3, 1, ExpiryDuration::OneDay))
            .await
            .unwrap();

        let report = f
            .worker
            .run_once(Utc::now() + ChronoDuration::days(2))
            .await
            .unwrap();

        assert_eq!(report.blobs_deleted, 150);
        assert_eq!(report.entries_deleted, 150);
        for entry in &entries {
            assert!(f.repo.find_by_id(&entry.id).await.unwrap().is_none());
            assert!(matches!(
                f.store.open_blob("snappshare", &entry.blob_name()).await,
                Err(crate::errors::ServiceError::NotFound(_))
            ));
        }
        assert!(f.repo.find_by_id(&stuck.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_share_blobs_are_deleted_and_rows_kept() {
        let f = fixture().await;
        let blob_name = "shares/s00001/a.txt";
        f.store
            .stage_block("snappshare", blob_name, &block_id_for(0), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        f.store
            .commit_block_list("snappshare", blob_name, &[block_id_for(0)])
            .await
            .unwrap();
        let mut share = FileUpload::new("s00001", ExpiryDuration::OneMinute);
        share.blob_name = Some(blob_name.into());
        share.original_url = Some("http://x/blobs/snappshare/shares/s00001/a.txt".into());
        f.shares.add(&share).await.unwrap();

        assert_eq!(f.worker.run_once(Utc::now()).await.unwrap(), SweepReport::default());

        let later = Utc::now() + ChronoDuration::minutes(2);
        let report = f.worker.run_once(later).await.unwrap();
        assert_eq!(report.shares_released, 1);
        assert!(matches!(
            f.store.open_blob("snappshare", blob_name).await,
            Err(crate::errors::ServiceError::NotFound(_))
        ));
        let kept = f.shares.find("s00001").await.unwrap().unwrap();
        assert!(kept.blob_name.is_none());
        assert_eq!(f.worker.run_once(later).await.unwrap().shares_released, 0);
    }

    #[tokio::test]
    async fn undecodable_messages_are_dropped() {
        let f = fixture().await;
        f.notifier
            .send(QueuedMessage {
                content_type: "text/plain".into(),
                body: "nope".into(),
            })
            .await
            .unwrap();

        let report = f
            .worker
            .run_once(Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.blobs_deleted, 0);
        assert!(f.notifier.pending().await.unwrap().is_empty());
    }
}
