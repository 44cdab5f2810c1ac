//! Represents one logical multi-chunk upload.

use crate::models::expiry::ExpiryDuration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::Path;
use uuid::Uuid;

/// Length of the opaque identifiers handed to clients.
const SHORT_ID_LEN: usize = 12;

/// Longest accepted file name in bytes. With the id prefix the blob name
/// stays within the block store's limit.
pub const MAX_FILE_NAME_LEN: usize = 1000;

/// Upload lifecycle. `Completed` and `Failed` are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileEntryStatus {
    Pending,
    Completed,
    Failed,
}

/// Metadata for a file being assembled from chunks.
///
/// The struct never holds chunk bytes; those live in the block store until
/// finalize commits them into a single object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Opaque short identifier returned to the client.
    pub id: String,

    /// Original file name as supplied by the client.
    pub file_name: String,

    /// Lower-cased suffix of `file_name`, if it has one.
    pub file_extension: Option<String>,

    /// Content hash used to resume an interrupted upload.
    pub file_hash: String,

    /// Declared size in bytes.
    pub file_size: i64,

    /// Number of chunks the client declared when the entry was created.
    pub total_chunks: u32,

    /// Time-limited read URL. Null until the upload is finalized.
    pub file_url: Option<String>,

    pub status: FileEntryStatus,

    /// Lease flag guarding the chunk-write and finalize critical sections.
    pub is_locked: bool,

    pub locked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[sqlx(try_from = "i64")]
    pub expires_in: ExpiryDuration,

    /// Always `updated_at + expires_in`; stored so expiry can be queried.
    pub expires_at: DateTime<Utc>,
}

impl FileEntry {
    /// Build a fresh `Pending` entry. Validation is the caller's job.
    pub fn new(
        file_name: &str,
        file_hash: &str,
        file_size: i64,
        total_chunks: u32,
        expires_in: ExpiryDuration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_short_id(),
            file_name: file_name.to_string(),
            file_extension: extension_of(file_name),
            file_hash: file_hash.to_string(),
            file_size,
            total_chunks,
            file_url: None,
            status: FileEntryStatus::Pending,
            is_locked: false,
            locked_at: None,
            created_at: now,
            updated_at: now,
            expires_in,
            expires_at: now + expires_in.as_duration(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == FileEntryStatus::Completed
    }

    /// Object name the chunks are staged under and committed to.
    pub fn blob_name(&self) -> String {
        format!("{}/{}", self.id, self.file_name)
    }
}

/// Random 12-character hex identifier.
pub fn new_short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SHORT_ID_LEN);
    id
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}
