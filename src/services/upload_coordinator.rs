//! src/services/upload_coordinator.rs
//!
//! UploadCoordinator: the chunked-upload state machine. It decides whether a
//! hash starts a new upload or resumes one, stages chunks under the per-file
//! lock, and finalizes the file once every chunk has arrived.
//!
//! The coordinator holds no state of its own between calls. Every decision
//! is made from a fresh repository read, and mutual exclusion between
//! requests comes from the lease in the `file_entries` row.

use crate::{
    errors::{ServiceError, ServiceResult, ensure_present},
    models::{
        chunk::{Chunk, MAX_TOTAL_CHUNKS, block_id_for},
        delete_message::DeleteFileMessage,
        expiry::ExpiryDuration,
        file_entry::{FileEntry, FileEntryStatus, MAX_FILE_NAME_LEN},
        upload_response::UploadResponse,
    },
    services::{
        block_store::BlockStore,
        metadata_repository::MetadataRepository,
        notifier::{DeferredNotifier, QueuedMessage},
    },
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use std::{sync::Arc, time::Duration as StdDuration};
use tracing::{debug, info, warn};

/// Knobs injected at construction. Business logic never reads the
/// environment directly.
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Container every blob is staged and committed into.
    pub container_name: String,

    /// Age after which a held lock may be taken over.
    pub lock_stale_after: Duration,

    /// How many times a contended lock is retried before `Conflict` surfaces.
    pub lock_retries: u32,

    /// Pause between two attempts at a contended lock.
    pub lock_retry_delay: StdDuration,
}

impl CoordinatorSettings {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            lock_stale_after: Duration::minutes(5),
            lock_retries: 5,
            lock_retry_delay: StdDuration::from_millis(200),
        }
    }
}

/// Result of looking up a file hash.
#[derive(Clone, Debug, PartialEq)]
pub enum UploadStatus {
    New,
    Partial {
        file_id: String,
        uploaded_chunks: Vec<u32>,
        total_chunks: u32,
    },
    /// `file_url` is `None` while every chunk is recorded but the file has
    /// not been finalized yet.
    Complete {
        file_id: String,
        file_url: Option<String>,
    },
}

/// Result of submitting one chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkOutcome {
    Success {
        file_id: String,
        chunk_index: u32,
    },
    Skipped {
        file_id: String,
        chunk_index: u32,
        reason: &'static str,
    },
}

/// Result of a finalize attempt. `Partial` is a normal poll outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum FinalizeOutcome {
    Complete {
        file_id: String,
        file_url: String,
    },
    Partial {
        file_id: String,
        uploaded_chunks: Vec<u32>,
        total_chunks: u32,
    },
}

/// Everything a client sends with a single fire-and-forget chunk.
#[derive(Clone, Debug)]
pub struct ChunkSubmission {
    pub file_name: String,
    pub file_hash: String,
    pub file_size: i64,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub chunk: Bytes,
    pub chunk_hash: String,
    pub expires_in: ExpiryDuration,
}

/// A chunk addressed to an already known file id.
#[derive(Clone, Debug)]
pub struct EntryChunk {
    pub file_name: String,
    pub file_hash: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub chunk: Bytes,
    pub chunk_hash: String,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    repo: MetadataRepository,
    store: Arc<dyn BlockStore>,
    notifier: Arc<dyn DeferredNotifier>,
    settings: CoordinatorSettings,
}

impl UploadCoordinator {
    pub fn new(
        repo: MetadataRepository,
        store: Arc<dyn BlockStore>,
        notifier: Arc<dyn DeferredNotifier>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            repo,
            store,
            notifier,
            settings,
        }
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repo
    }

    /// Classify `file_hash` as a new, partially uploaded or complete file.
    ///
    /// A finalized entry is reported without reading its chunks.
    pub async fn check_upload_status(&self, file_hash: &str) -> ServiceResult<UploadStatus> {
        ensure_present(file_hash, "fileHash")?;

        let Some(entry) = self.repo.find_by_hash(file_hash).await? else {
            return Ok(UploadStatus::New);
        };

        if entry.is_completed() {
            let (file_id, file_url) = completed_parts(&entry)?;
            return Ok(UploadStatus::Complete {
                file_id,
                file_url: Some(file_url),
            });
        }

        let uploaded_chunks = self.repo.uploaded_chunk_indices(&entry.id).await?;
        if uploaded_chunks.len() == entry.total_chunks as usize {
            return Ok(UploadStatus::Complete {
                file_id: entry.id,
                file_url: entry.file_url,
            });
        }
        Ok(UploadStatus::Partial {
            file_id: entry.id,
            uploaded_chunks,
            total_chunks: entry.total_chunks,
        })
    }

    /// Persist a new `Pending` entry. The caller is expected to have checked
    /// the hash first; a concurrent duplicate is tolerated.
    pub async fn create_file_entry(
        &self,
        file_name: &str,
        file_hash: &str,
        file_size: i64,
        total_chunks: i64,
        expires_in: ExpiryDuration,
    ) -> ServiceResult<FileEntry> {
        ensure_file_name(file_name)?;
        ensure_present(file_hash, "fileHash")?;
        let file_size = positive_size(file_size)?;
        let total_chunks = chunk_count(total_chunks)?;

        let entry = FileEntry::new(file_name, file_hash, file_size, total_chunks, expires_in);
        let created = self.repo.create(&entry).await?;
        info!(
            "created file entry {} for {} ({} bytes in {} chunks)",
            created.id, created.file_name, created.file_size, created.total_chunks
        );
        Ok(created)
    }

    /// Stage one chunk and record it. Re-submitting an index is a no-op.
    ///
    /// The lock is released on every path that took it, and any store or
    /// repository failure is returned unchanged after the release.
    pub async fn upload_chunk(
        &self,
        file_id: &str,
        file_name: &str,
        chunk_index: i64,
        chunk: Bytes,
        chunk_hash: &str,
    ) -> ServiceResult<ChunkOutcome> {
        ensure_present(file_id, "fileId")?;
        ensure_present(file_name, "fileName")?;
        ensure_present(chunk_hash, "chunkHash")?;
        let chunk_index = chunk_position(chunk_index)?;
        ensure_chunk_payload(&chunk)?;

        let entry = self.repo.get(file_id).await?;
        match entry.status {
            FileEntryStatus::Completed => {
                return Ok(ChunkOutcome::Skipped {
                    file_id: entry.id,
                    chunk_index,
                    reason: "File upload already completed",
                });
            }
            FileEntryStatus::Failed => {
                return Err(ServiceError::conflict(format!(
                    "File `{}` has failed and no longer accepts chunks",
                    entry.id
                )));
            }
            FileEntryStatus::Pending => {}
        }
        if chunk_index >= entry.total_chunks {
            return Err(ServiceError::out_of_range(
                "chunkIndex",
                format!(
                    "{} must be below totalChunks ({})",
                    chunk_index, entry.total_chunks
                ),
            ));
        }
        if entry.file_name != file_name {
            warn!(
                "chunk {} for {} names `{}`, entry was created as `{}`",
                chunk_index, entry.id, file_name, entry.file_name
            );
        }

        self.acquire_lock(&entry.id).await?;
        let result = self
            .upload_chunk_locked(&entry, chunk_index, chunk, chunk_hash)
            .await;
        self.release_lock(&entry.id, result).await
    }

    async fn upload_chunk_locked(
        &self,
        entry: &FileEntry,
        chunk_index: u32,
        chunk: Bytes,
        chunk_hash: &str,
    ) -> ServiceResult<ChunkOutcome> {
        if self.repo.find_chunk(&entry.id, chunk_index).await?.is_some() {
            debug!("chunk {} of {} already recorded", chunk_index, entry.id);
            return Ok(ChunkOutcome::Skipped {
                file_id: entry.id.clone(),
                chunk_index,
                reason: "Chunk already recorded in database",
            });
        }

        let chunk_size = chunk.len() as i64;
        self.store
            .stage_block(
                &self.settings.container_name,
                &entry.blob_name(),
                &block_id_for(chunk_index),
                chunk,
            )
            .await?;

        let saved = self
            .repo
            .save_chunk(&Chunk::new(&entry.id, chunk_index, chunk_size, chunk_hash))
            .await?;
        debug!("recorded chunk {} of {}", saved.chunk_index, entry.id);

        Ok(ChunkOutcome::Success {
            file_id: entry.id.clone(),
            chunk_index: saved.chunk_index,
        })
    }

    /// Commit every staged chunk into one object and publish its read URL.
    ///
    /// Finalizing a completed file returns the stored URL with no side
    /// effects. On failure the entry stays `Pending` so the call can be retried.
    pub async fn finalize_upload(&self, file_id: &str) -> ServiceResult<FinalizeOutcome> {
        ensure_present(file_id, "fileId")?;

        let entry = self.repo.get(file_id).await?;
        match entry.status {
            FileEntryStatus::Completed => {
                let (file_id, file_url) = completed_parts(&entry)?;
                return Ok(FinalizeOutcome::Complete { file_id, file_url });
            }
            FileEntryStatus::Failed => {
                return Err(ServiceError::conflict(format!(
                    "File `{}` has failed and cannot be finalized",
                    entry.id
                )));
            }
            FileEntryStatus::Pending => {}
        }

        self.acquire_lock(&entry.id).await?;
        let result = self.finalize_locked(&entry.id).await;
        self.release_lock(&entry.id, result).await
    }

    async fn finalize_locked(&self, file_id: &str) -> ServiceResult<FinalizeOutcome> {
        // A finalize that held the lock before us may already have finished.
        let entry = self.repo.get(file_id).await?;
        if entry.is_completed() {
            let (file_id, file_url) = completed_parts(&entry)?;
            return Ok(FinalizeOutcome::Complete { file_id, file_url });
        }

        let mut chunks = self.repo.uploaded_chunks(file_id).await?;
        if chunks.len() != entry.total_chunks as usize {
            debug!(
                "finalize of {} deferred: {}/{} chunks",
                file_id,
                chunks.len(),
                entry.total_chunks
            );
            return Ok(FinalizeOutcome::Partial {
                file_id: entry.id,
                uploaded_chunks: chunks.iter().map(|c| c.chunk_index).collect(),
                total_chunks: entry.total_chunks,
            });
        }

        // Block order defines the byte layout of the committed object.
        chunks.sort_by_key(|c| c.chunk_index);
        let block_ids: Vec<String> = chunks.iter().map(Chunk::block_id).collect();

        let container = &self.settings.container_name;
        let blob_name = entry.blob_name();
        self.store
            .commit_block_list(container, &blob_name, &block_ids)
            .await?;

        let expires_at = Utc::now() + entry.expires_in.as_duration();
        let file_url = self
            .store
            .generate_read_url(&blob_name, container, expires_at)
            .await?;

        let message = DeleteFileMessage {
            file_id: entry.id.clone(),
            file_name: blob_name,
            container_name: container.clone(),
            expires_at,
        };
        self.notifier
            .schedule(QueuedMessage::json(&message)?, expires_at)
            .await?;

        self.repo.mark_upload_complete(&entry.id, &file_url).await?;
        info!(
            "finalized {} ({} chunks), deletion scheduled for {}",
            entry.id,
            block_ids.len(),
            expires_at
        );

        Ok(FinalizeOutcome::Complete {
            file_id: entry.id,
            file_url,
        })
    }

    /// Single-call workflow: resolve or create the entry, stage the chunk and
    /// finalize transparently once the last chunk lands.
    pub async fn handle_file_upload(
        &self,
        submission: ChunkSubmission,
    ) -> ServiceResult<UploadResponse> {
        let ChunkSubmission {
            file_name,
            file_hash,
            file_size,
            chunk_index,
            total_chunks,
            chunk,
            chunk_hash,
            expires_in,
        } = submission;

        ensure_file_name(&file_name)?;
        ensure_present(&file_hash, "fileHash")?;
        ensure_present(&chunk_hash, "chunkHash")?;
        chunk_position(chunk_index)?;
        let total = chunk_count(total_chunks)?;
        positive_size(file_size)?;
        ensure_chunk_payload(&chunk)?;

        let file_id = match self.check_upload_status(&file_hash).await? {
            UploadStatus::Complete {
                file_id,
                file_url: Some(file_url),
            } => {
                return Ok(UploadResponse::Complete {
                    file_id,
                    file_url,
                    message: "File Uploaded Successfully".into(),
                });
            }
            // Every chunk is recorded but the commit never happened.
            UploadStatus::Complete {
                file_id,
                file_url: None,
            } => return Ok(self.finalize_upload(&file_id).await?.into()),
            UploadStatus::Partial {
                file_id,
                total_chunks: expected,
                ..
            } => {
                if expected != total {
                    return Err(total_chunks_mismatch(file_size, expected, total));
                }
                file_id
            }
            UploadStatus::New => {
                self.create_file_entry(&file_name, &file_hash, file_size, total_chunks, expires_in)
                    .await?
                    .id
            }
        };

        let outcome = self
            .upload_chunk(&file_id, &file_name, chunk_index, chunk, &chunk_hash)
            .await?;

        if self.repo.count_chunks(&file_id).await? == total {
            return Ok(self.finalize_upload(&file_id).await?.into());
        }

        Ok(outcome.into())
    }

    /// Stage a chunk for a file the client already holds an id for. Unlike
    /// `handle_file_upload` this never finalizes.
    pub async fn upload_file_entry_chunk(
        &self,
        file_id: &str,
        upload: EntryChunk,
    ) -> ServiceResult<UploadResponse> {
        ensure_present(file_id, "fileId")?;
        ensure_present(&upload.file_name, "fileName")?;
        ensure_present(&upload.file_hash, "fileHash")?;
        ensure_present(&upload.chunk_hash, "chunkHash")?;
        chunk_position(upload.chunk_index)?;
        let total = chunk_count(upload.total_chunks)?;
        ensure_chunk_payload(&upload.chunk)?;

        let entry = self.repo.get(file_id).await?;
        if entry.file_hash != upload.file_hash {
            return Err(ServiceError::invalid(
                "fileHash",
                "and fileId do not correspond to existing values in database.",
            ));
        }
        if entry.is_completed() {
            let (file_id, file_url) = completed_parts(&entry)?;
            return Ok(UploadResponse::Complete {
                file_id,
                file_url,
                message: "File Uploaded Successfully".into(),
            });
        }
        if entry.total_chunks != total {
            return Err(total_chunks_mismatch(entry.file_size, entry.total_chunks, total));
        }

        let outcome = self
            .upload_chunk(
                file_id,
                &upload.file_name,
                upload.chunk_index,
                upload.chunk,
                &upload.chunk_hash,
            )
            .await?;
        Ok(outcome.into())
    }

    /// Progress report for one file id.
    pub async fn get_file_entry(&self, file_id: &str) -> ServiceResult<UploadResponse> {
        ensure_present(file_id, "fileId")?;
        let entry = self.repo.get(file_id).await?;

        let response = match entry.status {
            FileEntryStatus::Completed => {
                let (file_id, file_url) = completed_parts(&entry)?;
                UploadResponse::Complete {
                    file_id,
                    file_url,
                    message: "Upload complete. File is ready to access.".into(),
                }
            }
            FileEntryStatus::Failed => UploadResponse::Failed {
                file_id: entry.id,
                message: "Upload failed. Please retry or contact support.".into(),
            },
            FileEntryStatus::Pending => {
                let uploaded_chunks = self.repo.uploaded_chunk_indices(&entry.id).await?;
                if uploaded_chunks.is_empty() {
                    UploadResponse::New {
                        file_id: Some(entry.id),
                        total_chunks: Some(entry.total_chunks),
                        uploaded_chunks,
                        message: "Upload has not started yet.".into(),
                    }
                } else {
                    UploadResponse::Partial {
                        file_id: entry.id,
                        uploaded_chunks,
                        total_chunks: entry.total_chunks,
                        message: "Upload in progress. Some chunks are still missing.".into(),
                    }
                }
            }
        };
        Ok(response)
    }

    /// Take the file lock, retrying while another request holds it.
    async fn acquire_lock(&self, file_id: &str) -> ServiceResult<()> {
        let mut attempt = 0;
        loop {
            match self
                .repo
                .lock_file(file_id, self.settings.lock_stale_after)
                .await
            {
                Ok(()) => return Ok(()),
                Err(ServiceError::Conflict(_)) if attempt < self.settings.lock_retries => {
                    attempt += 1;
                    warn!(
                        "file {} is locked, retrying ({}/{})",
                        file_id, attempt, self.settings.lock_retries
                    );
                    tokio::time::sleep(self.settings.lock_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Unlock, then hand back `result`. An unlock failure only replaces a
    /// successful result; an earlier error always wins.
    async fn release_lock<T>(&self, file_id: &str, result: ServiceResult<T>) -> ServiceResult<T> {
        match self.repo.unlock_file(file_id).await {
            Ok(()) => result,
            Err(unlock_err) => match result {
                Ok(_) => Err(unlock_err),
                Err(err) => {
                    warn!("failed to release lock on {}: {}", file_id, unlock_err);
                    Err(err)
                }
            },
        }
    }
}

/// Map a client-supplied expiry (name or minutes) into the closed set.
pub fn parse_expiry(value: &str) -> ServiceResult<ExpiryDuration> {
    ensure_present(value, "expiresIn")?;
    value
        .parse()
        .map_err(|err: crate::models::expiry::UnknownExpiry| {
            ServiceError::out_of_range("expiresIn", err.to_string())
        })
}

fn completed_parts(entry: &FileEntry) -> ServiceResult<(String, String)> {
    let file_url = entry.file_url.clone().ok_or_else(|| {
        ServiceError::Unexpected(format!("completed file `{}` has no url", entry.id))
    })?;
    Ok((entry.id.clone(), file_url))
}

/// File names end up in the blob name and the download header.
pub(crate) fn ensure_file_name(file_name: &str) -> ServiceResult<()> {
    ensure_present(file_name, "fileName")?;
    if file_name.len() > MAX_FILE_NAME_LEN {
        return Err(ServiceError::out_of_range(
            "fileName",
            format!("must be at most {} bytes", MAX_FILE_NAME_LEN),
        ));
    }
    if file_name.chars().any(char::is_control) {
        return Err(ServiceError::invalid(
            "fileName",
            "must not contain control characters.",
        ));
    }
    Ok(())
}

fn positive_size(file_size: i64) -> ServiceResult<i64> {
    if file_size <= 0 {
        return Err(ServiceError::invalid("fileSize", "must be a positive number."));
    }
    Ok(file_size)
}

fn chunk_count(total_chunks: i64) -> ServiceResult<u32> {
    if total_chunks <= 0 {
        return Err(ServiceError::invalid(
            "totalChunks",
            "must be a positive number.",
        ));
    }
    if total_chunks > i64::from(MAX_TOTAL_CHUNKS) {
        return Err(ServiceError::out_of_range(
            "totalChunks",
            format!("{} exceeds the limit of {}", total_chunks, MAX_TOTAL_CHUNKS),
        ));
    }
    Ok(total_chunks as u32)
}

fn chunk_position(chunk_index: i64) -> ServiceResult<u32> {
    if chunk_index < 0 {
        return Err(ServiceError::invalid(
            "chunkIndex",
            "must be a non-negative number.",
        ));
    }
    u32::try_from(chunk_index)
        .map_err(|_| ServiceError::out_of_range("chunkIndex", chunk_index.to_string()))
}

fn ensure_chunk_payload(chunk: &Bytes) -> ServiceResult<()> {
    if chunk.is_empty() {
        return Err(ServiceError::invalid(
            "chunkFile",
            "must not be null or empty.",
        ));
    }
    Ok(())
}

fn total_chunks_mismatch(file_size: i64, expected: u32, received: u32) -> ServiceError {
    let expected_chunk_bytes = file_size / i64::from(expected.max(1));
    let expected_chunk_mb = (expected_chunk_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    ServiceError::TotalChunksMismatch {
        expected,
        received,
        expected_chunk_mb,
    }
}

impl From<ChunkOutcome> for UploadResponse {
    fn from(outcome: ChunkOutcome) -> Self {
        match outcome {
            ChunkOutcome::Success {
                file_id,
                chunk_index,
            } => UploadResponse::Success {
                file_id,
                uploaded_chunk: chunk_index,
                message: "Chunk staged successfully".into(),
            },
            ChunkOutcome::Skipped {
                file_id,
                chunk_index,
                reason,
            } => UploadResponse::Skipped {
                file_id,
                chunk_index,
                message: reason.into(),
            },
        }
    }
}

impl From<FinalizeOutcome> for UploadResponse {
    fn from(outcome: FinalizeOutcome) -> Self {
        match outcome {
            FinalizeOutcome::Complete { file_id, file_url } => UploadResponse::Complete {
                file_id,
                file_url,
                message: "Upload finalized successfully. File is ready to access.".into(),
            },
            FinalizeOutcome::Partial {
                file_id,
                uploaded_chunks,
                total_chunks,
            } => UploadResponse::Partial {
                file_id,
                uploaded_chunks,
                total_chunks,
                message: "Upload incomplete. Some chunks are still missing.".into(),
            },
        }
    }
}
