//! A single-shot share: one small file and/or a short note behind a short id.

use crate::models::expiry::ExpiryDuration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Length of a share id.
const SHARE_ID_LEN: usize = 6;

/// Largest file accepted by `POST /file/upload`.
pub const MAX_SHARE_BYTES: usize = 5 * 1024 * 1024;

/// Lower-cased suffixes a shared file may carry.
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "png", "pdf", "txt"];

/// Accepted note length, in characters.
pub const NOTE_CHARS: std::ops::RangeInclusive<usize> = 20..=200;

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    pub id: String,

    /// Name of the shared file as uploaded, if any.
    pub file_name: Option<String>,

    /// Object holding the file. Cleared once the expiry sweep removes it.
    pub blob_name: Option<String>,

    /// Signed read URL valid until `expires_at`.
    pub original_url: Option<String>,

    pub note: Option<String>,

    pub created_at: DateTime<Utc>,

    #[sqlx(try_from = "i64")]
    pub expiry_duration: ExpiryDuration,

    /// `created_at + expiry_duration`.
    pub expires_at: DateTime<Utc>,
}

impl FileUpload {
    pub fn new(id: &str, expiry_duration: ExpiryDuration) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            file_name: None,
            blob_name: None,
            original_url: None,
            note: None,
            created_at: now,
            expiry_duration,
            expires_at: now + expiry_duration.as_duration(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Random 6-character hex share id.
pub fn new_share_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SHARE_ID_LEN);
    id
}
