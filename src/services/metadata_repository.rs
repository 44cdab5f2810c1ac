//! Persistence for `FileEntry` and `Chunk` records.
//!
//! Every read is a fresh query; nothing is cached between requests. The
//! per-file lock lives in the `file_entries` row itself so that it holds
//! across processes sharing the same database.

use crate::{
    errors::{ServiceError, ServiceResult, ensure_present},
    models::{
        chunk::Chunk,
        expiry::ExpiryDuration,
        file_entry::{FileEntry, FileEntryStatus},
    },
};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct MetadataRepository {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Most recent resumable entry for `file_hash`.
    ///
    /// Failed entries and entries past `expires_at` are ignored, so the hash
    /// only has to be unique among live uploads.
    pub async fn find_by_hash(&self, file_hash: &str) -> ServiceResult<Option<FileEntry>> {
        ensure_present(file_hash, "fileHash")?;
        let entry = sqlx::query_as::<_, FileEntry>(
            "SELECT id, file_name, file_extension, file_hash, file_size, total_chunks,
                    file_url, status, is_locked, locked_at, created_at, updated_at,
                    expires_in, expires_at
             FROM file_entries
             WHERE file_hash = ? AND status != 'failed'
               AND julianday(expires_at) > julianday(?)
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(file_hash)
        .bind(Utc::now())
        .fetch_optional(&*self.db)
        .await?;
        Ok(entry)
    }

    pub async fn find_by_id(&self, file_id: &str) -> ServiceResult<Option<FileEntry>> {
        ensure_present(file_id, "fileId")?;
        let entry = sqlx::query_as::<_, FileEntry>(
            "SELECT id, file_name, file_extension, file_hash, file_size, total_chunks,
                    file_url, status, is_locked, locked_at, created_at, updated_at,
                    expires_in, expires_at
             FROM file_entries WHERE id = ?",
        )
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(entry)
    }

    /// Like `find_by_id`, but a missing entry is `NotFound`.
    pub async fn get(&self, file_id: &str) -> ServiceResult<FileEntry> {
        self.find_by_id(file_id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("File `{}` not found", file_id)))
    }

    pub async fn create(&self, entry: &FileEntry) -> ServiceResult<FileEntry> {
        let created = sqlx::query_as::<_, FileEntry>(
            r#"
            INSERT INTO file_entries (
                id, file_name, file_extension, file_hash, file_size, total_chunks,
                file_url, status, is_locked, locked_at, created_at, updated_at,
                expires_in, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, file_name, file_extension, file_hash, file_size, total_chunks,
                      file_url, status, is_locked, locked_at, created_at, updated_at,
                      expires_in, expires_at
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.file_name)
        .bind(&entry.file_extension)
        .bind(&entry.file_hash)
        .bind(entry.file_size)
        .bind(entry.total_chunks)
        .bind(&entry.file_url)
        .bind(entry.status)
        .bind(entry.is_locked)
        .bind(entry.locked_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(entry.expires_in.minutes())
        .bind(entry.expires_at)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ServiceError::conflict(format!("File `{}` already exists", entry.id))
            } else {
                ServiceError::Sqlx(err)
            }
        })?;
        Ok(created)
    }

    /// Persist the mutable fields of `entry`, refreshing `updated_at` and
    /// `expires_at`. Lock fields are left to `lock_file`/`unlock_file`.
    pub async fn update(&self, entry: &FileEntry) -> ServiceResult<FileEntry> {
        ensure_present(&entry.id, "fileId")?;
        let now = Utc::now();
        sqlx::query_as::<_, FileEntry>(
            r#"
            UPDATE file_entries SET
                file_name = ?, file_extension = ?, file_hash = ?, file_size = ?,
                total_chunks = ?, file_url = ?, status = ?, expires_in = ?,
                updated_at = ?, expires_at = ?
            WHERE id = ?
            RETURNING id, file_name, file_extension, file_hash, file_size, total_chunks,
                      file_url, status, is_locked, locked_at, created_at, updated_at,
                      expires_in, expires_at
            "#,
        )
        .bind(&entry.file_name)
        .bind(&entry.file_extension)
        .bind(&entry.file_hash)
        .bind(entry.file_size)
        .bind(entry.total_chunks)
        .bind(&entry.file_url)
        .bind(entry.status)
        .bind(entry.expires_in.minutes())
        .bind(now)
        .bind(now + entry.expires_in.as_duration())
        .bind(&entry.id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("File `{}` not found", entry.id)))
    }

    /// Take the per-file lease.
    ///
    /// A single conditional UPDATE, so two callers can never both succeed. A
    /// lease older than `stale_after` is reclaimed. Fails with `NotFound` for
    /// an unknown id and `Conflict` while another holder's lease is live.
    pub async fn lock_file(&self, file_id: &str, stale_after: Duration) -> ServiceResult<()> {
        ensure_present(file_id, "fileId")?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE file_entries SET is_locked = 1, locked_at = ?
             WHERE id = ?
               AND (is_locked = 0 OR locked_at IS NULL
                    OR julianday(locked_at) < julianday(?))",
        )
        .bind(now)
        .bind(file_id)
        .bind(now - stale_after)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(file_id).await? {
                None => Err(ServiceError::not_found(format!("File `{}` not found", file_id))),
                Some(_) => Err(ServiceError::conflict(format!(
                    "File `{}` is locked by another operation",
                    file_id
                ))),
            };
        }
        debug!("locked file {}", file_id);
        Ok(())
    }

    /// Release the lease. Unlocking an unlocked entry is a no-op.
    pub async fn unlock_file(&self, file_id: &str) -> ServiceResult<()> {
        ensure_present(file_id, "fileId")?;
        let result =
            sqlx::query("UPDATE file_entries SET is_locked = 0, locked_at = NULL WHERE id = ?")
                .bind(file_id)
                .execute(&*self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found(format!("File `{}` not found", file_id)));
        }
        debug!("unlocked file {}", file_id);
        Ok(())
    }

    /// Transition to `Completed` with the read URL.
    pub async fn mark_upload_complete(
        &self,
        file_id: &str,
        file_url: &str,
    ) -> ServiceResult<FileEntry> {
        ensure_present(file_url, "fileUrl")?;
        let mut entry = self.get(file_id).await?;
        entry.status = FileEntryStatus::Completed;
        entry.file_url = Some(file_url.to_string());
        self.update(&entry).await
    }

    /// Transition to `Failed`. Not reachable from the upload flow itself.
    pub async fn mark_failed(&self, file_id: &str) -> ServiceResult<FileEntry> {
        let mut entry = self.get(file_id).await?;
        entry.status = FileEntryStatus::Failed;
        self.update(&entry).await
    }

    /// Entries whose `expires_at` is at or before `before`, oldest first.
    pub async fn expired_entries(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> ServiceResult<Vec<FileEntry>> {
        let rows = sqlx::query_as::<_, FileEntry>(
            "SELECT id, file_name, file_extension, file_hash, file_size, total_chunks,
                    file_url, status, is_locked, locked_at, created_at, updated_at,
                    expires_in, expires_at
             FROM file_entries
             WHERE julianday(expires_at) <= julianday(?)
             ORDER BY expires_at ASC
             LIMIT ?",
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Remove one entry and its chunks. Returns false if it was already gone.
    pub async fn delete_file_entry(&self, file_id: &str) -> ServiceResult<bool> {
        ensure_present(file_id, "fileId")?;
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM file_entries WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_chunk(&self, file_id: &str, chunk_index: u32) -> ServiceResult<Option<Chunk>> {
        ensure_present(file_id, "fileId")?;
        let chunk = sqlx::query_as::<_, Chunk>(
            "SELECT id, file_id, chunk_index, chunk_size, chunk_hash, uploaded_at
             FROM chunks WHERE file_id = ? AND chunk_index = ?",
        )
        .bind(file_id)
        .bind(chunk_index)
        .fetch_optional(&*self.db)
        .await?;
        Ok(chunk)
    }

    /// Record a chunk and refresh the owning entry's expiry window.
    ///
    /// A second row for the same `(file_id, chunk_index)` is a `Conflict`.
    pub async fn save_chunk(&self, chunk: &Chunk) -> ServiceResult<Chunk> {
        ensure_present(&chunk.file_id, "fileId")?;
        ensure_present(&chunk.chunk_hash, "chunkHash")?;

        let mut tx = self.db.begin().await?;
        let expires_in: Option<i64> =
            sqlx::query_scalar("SELECT expires_in FROM file_entries WHERE id = ?")
                .bind(&chunk.file_id)
                .fetch_optional(&mut *tx)
                .await?;
        let expires_in = expires_in
            .ok_or_else(|| ServiceError::not_found(format!("File `{}` not found", chunk.file_id)))?;
        let expires_in = ExpiryDuration::try_from(expires_in)
            .map_err(|err| ServiceError::Unexpected(err.to_string()))?;

        let saved = sqlx::query_as::<_, Chunk>(
            r#"
            INSERT INTO chunks (id, file_id, chunk_index, chunk_size, chunk_hash, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, file_id, chunk_index, chunk_size, chunk_hash, uploaded_at
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.file_id)
        .bind(chunk.chunk_index)
        .bind(chunk.chunk_size)
        .bind(&chunk.chunk_hash)
        .bind(chunk.uploaded_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ServiceError::conflict(format!(
                    "Chunk {} of file `{}` is already recorded",
                    chunk.chunk_index, chunk.file_id
                ))
            } else {
                ServiceError::Sqlx(err)
            }
        })?;

        let now = Utc::now();
        sqlx::query("UPDATE file_entries SET updated_at = ?, expires_at = ? WHERE id = ?")
            .bind(now)
            .bind(now + expires_in.as_duration())
            .bind(&chunk.file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(saved)
    }

    /// All chunks recorded for `file_id`, ordered by index.
    pub async fn uploaded_chunks(&self, file_id: &str) -> ServiceResult<Vec<Chunk>> {
        ensure_present(file_id, "fileId")?;
        let chunks = sqlx::query_as::<_, Chunk>(
            "SELECT id, file_id, chunk_index, chunk_size, chunk_hash, uploaded_at
             FROM chunks WHERE file_id = ? ORDER BY chunk_index ASC",
        )
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    pub async fn uploaded_chunk_indices(&self, file_id: &str) -> ServiceResult<Vec<u32>> {
        ensure_present(file_id, "fileId")?;
        let indices = sqlx::query_scalar::<_, u32>(
            "SELECT chunk_index FROM chunks WHERE file_id = ? ORDER BY chunk_index ASC",
        )
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(indices)
    }

    pub async fn count_chunks(&self, file_id: &str) -> ServiceResult<u32> {
        ensure_present(file_id, "fileId")?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&*self.db)
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
