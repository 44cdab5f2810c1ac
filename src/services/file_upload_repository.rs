//! Persistence for single-shot shares (`file_uploads`).

use crate::{
    errors::{ServiceError, ServiceResult, ensure_present},
    models::file_upload::FileUpload,
    services::metadata_repository::is_unique_violation,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

const COLUMNS: &str = "id, file_name, blob_name, original_url, note, created_at, expiry_duration, expires_at";

#[derive(Clone)]
pub struct FileUploadRepository {
    pub db: Arc<SqlitePool>,
}

impl FileUploadRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn add(&self, share: &FileUpload) -> ServiceResult<FileUpload> {
        let sql = format!(
            "INSERT INTO file_uploads ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, FileUpload>(&sql)
            .bind(&share.id)
            .bind(&share.file_name)
            .bind(&share.blob_name)
            .bind(&share.original_url)
            .bind(&share.note)
            .bind(share.created_at)
            .bind(share.expiry_duration.minutes())
            .bind(share.expires_at)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ServiceError::conflict(format!("Share `{}` already exists", share.id))
                } else {
                    ServiceError::Sqlx(err)
                }
            })
    }

    pub async fn find(&self, id: &str) -> ServiceResult<Option<FileUpload>> {
        ensure_present(id, "id")?;
        let sql = format!("SELECT {COLUMNS} FROM file_uploads WHERE id = ?");
        let share = sqlx::query_as::<_, FileUpload>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(share)
    }

    /// Expired shares that still own a blob, oldest first.
    pub async fn expired_with_blobs(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> ServiceResult<Vec<FileUpload>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM file_uploads
             WHERE blob_name IS NOT NULL AND julianday(expires_at) <= julianday(?)
             ORDER BY expires_at ASC
             LIMIT ?"
        );
        let shares = sqlx::query_as::<_, FileUpload>(&sql)
            .bind(before)
            .bind(limit)
            .fetch_all(&*self.db)
            .await?;
        Ok(shares)
    }

    /// Forget the blob and URL of a share whose object was deleted. The row
    /// stays so lookups can still report the share as expired.
    pub async fn release_blob(&self, id: &str) -> ServiceResult<bool> {
        ensure_present(id, "id")?;
        let result = sqlx::query(
            "UPDATE file_uploads SET blob_name = NULL, original_url = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
