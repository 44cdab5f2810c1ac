//! Payload scheduled at finalize time to clean up an expired file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deferred deletion request for one committed object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteFileMessage {
    pub file_id: String,

    /// Name of the committed blob inside `container_name`.
    pub file_name: String,

    pub container_name: String,

    pub expires_at: DateTime<Utc>,
}
