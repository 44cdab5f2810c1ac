//! Single-shot shares: one small file or a short note, stored in one request
//! and readable by short id until its lifetime ends.

use crate::{
    errors::{ServiceError, ServiceResult, ensure_present},
    models::{
        chunk::block_id_for,
        expiry::ExpiryDuration,
        file_upload::{ALLOWED_EXTENSIONS, FileUpload, MAX_SHARE_BYTES, NOTE_CHARS, new_share_id},
    },
    services::{
        block_store::BlockStore, file_upload_repository::FileUploadRepository,
        upload_coordinator::ensure_file_name,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

/// Attempts at drawing an unused share id.
const ID_ATTEMPTS: usize = 3;

/// A file attached to a share request.
#[derive(Clone, Debug)]
pub struct SharedFile {
    pub file_name: String,
    pub bytes: Bytes,
}

#[derive(Clone, Debug)]
pub struct ShareRequest {
    pub file: Option<SharedFile>,
    pub note: Option<String>,
    pub expiry_duration: ExpiryDuration,
}

/// Response to `POST /file/upload`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShareReceipt {
    pub id: String,
    pub expiry_duration: String,
    pub file_access_url: String,
}

/// Response to `GET /file/{id}`. Content fields are null once expired.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShareDetails {
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub original_url: Option<String>,
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct ShareService {
    repo: FileUploadRepository,
    store: Arc<dyn BlockStore>,
    container_name: String,
    public_url: String,
}

impl ShareService {
    pub fn new(
        repo: FileUploadRepository,
        store: Arc<dyn BlockStore>,
        container_name: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            store,
            container_name: container_name.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Validate, store the file (if any) and persist the share.
    pub async fn upload(&self, request: ShareRequest) -> ServiceResult<ShareReceipt> {
        let note = validate_share(&request)?;

        let id = self.unused_id().await?;
        let mut share = FileUpload::new(&id, request.expiry_duration);
        share.note = note;

        if let Some(file) = request.file {
            let blob_name = format!("shares/{}/{}", id, file.file_name);
            let block_id = block_id_for(0);
            self.store
                .stage_block(&self.container_name, &blob_name, &block_id, file.bytes)
                .await?;
            self.store
                .commit_block_list(&self.container_name, &blob_name, &[block_id])
                .await?;
            share.original_url = Some(
                self.store
                    .generate_read_url(&blob_name, &self.container_name, share.expires_at)
                    .await?,
            );
            share.file_name = Some(file.file_name);
            share.blob_name = Some(blob_name);
        }

        let saved = match self.repo.add(&share).await {
            Ok(saved) => saved,
            Err(err) => {
                if let Some(blob_name) = &share.blob_name {
                    if let Err(cleanup) = self.store.delete_blob(&self.container_name, blob_name).await {
                        warn!("failed to remove blob {} of unsaved share: {}", blob_name, cleanup);
                    }
                }
                return Err(err);
            }
        };
        info!(
            "created share {} (file: {}, expires {})",
            saved.id,
            saved.file_name.as_deref().unwrap_or("-"),
            saved.expires_at
        );

        Ok(ShareReceipt {
            file_access_url: format!("{}/file/{}", self.public_url, saved.id),
            expiry_duration: format!("Expires in {}", saved.expiry_duration.describe()),
            id: saved.id,
        })
    }

    /// Look up a share. Its URL and note are withheld once it has expired.
    pub async fn details(&self, id: &str) -> ServiceResult<ShareDetails> {
        ensure_present(id, "id")?;
        let share = self
            .repo
            .find(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("File Not Found"))?;

        let expired = share.is_expired(Utc::now());
        Ok(ShareDetails {
            expires_at: share.expires_at,
            created_at: share.created_at,
            original_url: share.original_url.filter(|_| !expired),
            note: share.note.filter(|_| !expired),
        })
    }

    async fn unused_id(&self) -> ServiceResult<String> {
        for _ in 0..ID_ATTEMPTS {
            let id = new_share_id();
            if self.repo.find(&id).await?.is_none() {
                return Ok(id);
            }
        }
        Err(ServiceError::conflict("could not allocate a share id"))
    }
}

/// Checks every rule before anything is written. Returns the note to keep.
fn validate_share(request: &ShareRequest) -> ServiceResult<Option<String>> {
    let note = request.note.clone().filter(|note| !note.is_empty());
    if let Some(note) = &note {
        let chars = note.chars().count();
        if !NOTE_CHARS.contains(&chars) {
            return Err(ServiceError::invalid(
                "note",
                format!(
                    "must be between {} and {} characters.",
                    NOTE_CHARS.start(),
                    NOTE_CHARS.end()
                ),
            ));
        }
    }

    let has_note = note.as_deref().is_some_and(|n| !n.trim().is_empty());
    let Some(file) = &request.file else {
        if !has_note {
            return Err(ServiceError::invalid(
                "file",
                "or a note must be provided.",
            ));
        }
        return Ok(note);
    };

    ensure_file_name(&file.file_name)?;
    let extension = Path::new(&file.file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if !extension.is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str())) {
        return Err(ServiceError::invalid(
            "file",
            "has an invalid type. Allowed types: .jpg, .png, .pdf, .txt",
        ));
    }
    if file.bytes.is_empty() {
        return Err(ServiceError::invalid("file", "must not be empty."));
    }
    if file.bytes.len() > MAX_SHARE_BYTES {
        return Err(ServiceError::invalid(
            "file",
            format!("size must be less than {}MB.", MAX_SHARE_BYTES / (1024 * 1024)),
        ));
    }
    Ok(note)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        services::block_store::{LocalBlockStore, UrlSigner},
    };
    use tokio::io::AsyncReadExt;
    use uuid::Uuid;

    const NOTE: &str = "meet at the usual place at nine";

    struct Fixture {
        service: ShareService,
        repo: FileUploadRepository,
        store: Arc<LocalBlockStore>,
    }

    async fn fixture() -> Fixture {
        let root = std::env::temp_dir().join(format!("chunk-share-shares-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(root.join("snappshare")).await.unwrap();
        let store = Arc::new(LocalBlockStore::new(root, UrlSigner::new("http://x", "k")));
        let repo = FileUploadRepository::new(memory_pool().await);
        let service = ShareService::new(repo.clone(), store.clone(), "snappshare", "http://x/");
        Fixture {
            service,
            repo,
            store,
        }
    }

    fn file(name: &str, bytes: &[u8]) -> Option<SharedFile> {
        Some(SharedFile {
            file_name: name.into(),
            bytes: Bytes::copy_from_slice(bytes),
        })
    }

    fn request(file: Option<SharedFile>, note: Option<&str>) -> ShareRequest {
        ShareRequest {
            file,
            note: note.map(str::to_string),
            expiry_duration: ExpiryDuration::OneHour,
        }
    }

    #[tokio::test]
    async fn file_share_is_stored_and_described() {
        let f = fixture().await;
        let receipt = f
            .service
            .upload(request(file("Photo.PNG", b"png-bytes"), None))
            .await
            .unwrap();
        assert_eq!(receipt.id.len(), 6);
        assert_eq!(receipt.expiry_duration, "Expires in 1 hour");
        assert_eq!(receipt.file_access_url, format!("http://x/file/{}", receipt.id));

        let share = f.repo.find(&receipt.id).await.unwrap().unwrap();
        let blob_name = share.blob_name.unwrap();
        let (mut object, _) = f.store.open_blob("snappshare", &blob_name).await.unwrap();
        let mut bytes = Vec::new();
        object.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"png-bytes");

        let details = f.service.details(&receipt.id).await.unwrap();
        assert!(details.original_url.unwrap().starts_with("http://x/blobs/snappshare/shares/"));
        assert_eq!(details.expires_at - details.created_at, chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn note_only_share_has_no_url() {
        let f = fixture().await;
        let receipt = f.service.upload(request(None, Some(NOTE))).await.unwrap();
        let details = f.service.details(&receipt.id).await.unwrap();
        assert!(details.original_url.is_none());
        assert_eq!(details.note.as_deref(), Some(NOTE));
    }

    #[tokio::test]
    async fn expired_share_hides_its_content() {
        let f = fixture().await;
        let mut share = FileUpload::new("old001", ExpiryDuration::OneMinute);
        share.created_at = Utc::now() - chrono::Duration::minutes(2);
        share.expires_at = share.created_at + chrono::Duration::minutes(1);
        share.original_url = Some("http://x/blobs/snappshare/shares/old001/a.txt".into());
        share.note = Some(NOTE.into());
        f.repo.add(&share).await.unwrap();

        let details = f.service.details("old001").await.unwrap();
        assert_eq!(details.expires_at, share.expires_at);
        assert!(details.original_url.is_none());
        assert!(details.note.is_none());

        assert!(matches!(
            f.service.details("nope00").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_requests_write_nothing() {
        let f = fixture().await;
        let too_big = vec![1u8; MAX_SHARE_BYTES + 1];
        let cases = [
            request(None, None),
            request(None, Some("   ")),
            request(None, Some("too short")),
            request(None, Some(&"x".repeat(201))),
            request(file("script.exe", b"MZ"), None),
            request(file("noext", b"x"), None),
            request(file("empty.txt", b""), None),
            request(file("huge.pdf", &too_big), None),
            request(file("ok.txt", b"x"), Some("short")),
        ];
        for case in cases {
            assert!(matches!(
                f.service.upload(case).await,
                Err(ServiceError::InvalidArgument { .. })
            ));
        }
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_uploads")
            .fetch_one(&*f.repo.db)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert!(!tokio::fs::try_exists(f.store.root().join("snappshare/.blocks")).await.unwrap());
    }
}
