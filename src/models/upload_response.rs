//! Wire shape returned by every upload endpoint.

use serde::Serialize;

/// Outcome of an upload call, one variant per status.
///
/// Serialized as `{"status": "PARTIAL", "fileId": ..., ...}`; each variant
/// only carries the fields meaningful for that status.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum UploadResponse {
    New {
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u32>,
        uploaded_chunks: Vec<u32>,
        message: String,
    },
    Partial {
        file_id: String,
        uploaded_chunks: Vec<u32>,
        total_chunks: u32,
        message: String,
    },
    Skipped {
        file_id: String,
        chunk_index: u32,
        message: String,
    },
    Failed {
        file_id: String,
        message: String,
    },
    Success {
        file_id: String,
        uploaded_chunk: u32,
        message: String,
    },
    Complete {
        file_id: String,
        file_url: String,
        message: String,
    },
}

impl UploadResponse {
    /// Status label as it appears on the wire.
    pub fn status(&self) -> &'static str {
        match self {
            Self::New { .. } => "NEW",
            Self::Partial { .. } => "PARTIAL",
            Self::Skipped { .. } => "SKIPPED",
            Self::Failed { .. } => "FAILED",
            Self::Success { .. } => "SUCCESS",
            Self::Complete { .. } => "COMPLETE",
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::New { file_id, .. } => file_id.as_deref(),
            Self::Partial { file_id, .. }
            | Self::Skipped { file_id, .. }
            | Self::Failed { file_id, .. }
            | Self::Success { file_id, .. }
            | Self::Complete { file_id, .. } => Some(file_id),
        }
    }

    pub fn file_url(&self) -> Option<&str> {
        match self {
            Self::Complete { file_url, .. } => Some(file_url),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_serializes_with_status_tag() {
        let response = UploadResponse::Partial {
            file_id: "abc".into(),
            uploaded_chunks: vec![0, 2],
            total_chunks: 3,
            message: "Upload in progress.".into(),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "status": "PARTIAL",
                "fileId": "abc",
                "uploadedChunks": [0, 2],
                "totalChunks": 3,
                "message": "Upload in progress."
            })
        );
    }

    #[test]
    fn new_omits_unknown_fields() {
        let response = UploadResponse::New {
            file_id: None,
            total_chunks: None,
            uploaded_chunks: Vec::new(),
            message: "No upload found for this hash.".into(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "NEW");
        assert!(value.get("fileId").is_none());
        assert!(value.get("fileUrl").is_none());
    }

    #[test]
    fn only_complete_carries_a_url() {
        let complete = UploadResponse::Complete {
            file_id: "abc".into(),
            file_url: "http://x/blobs/c/abc".into(),
            message: String::new(),
        };
        let success = UploadResponse::Success {
            file_id: "abc".into(),
            uploaded_chunk: 1,
            message: String::new(),
        };
        assert_eq!(complete.file_url(), Some("http://x/blobs/c/abc"));
        assert_eq!(success.file_url(), None);
        assert_eq!(success.status(), "SUCCESS");
        assert_eq!(success.file_id(), Some("abc"));
    }
}
