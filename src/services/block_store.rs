//! src/services/block_store.rs
//!
//! Block-oriented object store used by the upload coordinator. Chunks are
//! staged as individual blocks and later committed, in a caller-chosen
//! order, into one object. `LocalBlockStore` keeps both staged blocks and
//! committed objects on local disk, sharded beneath
//! `root/{container}/{shard}/{shard}/{key}` where `key` is the SHA-256 of the
//! blob name. Blob names never become path components, so any name within
//! `MAX_BLOB_NAME_LEN` is storable.

use crate::errors::{ServiceError, ServiceResult, ensure_present};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_BLOB_NAME_LEN: usize = 1024;
const STAGING_DIR: &str = ".blocks";

/// Capability the coordinator needs from an object store.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Stage `bytes` as block `block_id` of `blob`. Re-staging the same id
    /// replaces the previous content.
    async fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        bytes: Bytes,
    ) -> ServiceResult<()>;

    /// Assemble the staged blocks, in the given order, into the object `blob`.
    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
    ) -> ServiceResult<()>;

    /// Read-only URL for a committed object, valid until `expires_at`.
    async fn generate_read_url(
        &self,
        blob: &str,
        container: &str,
        expires_at: DateTime<Utc>,
    ) -> ServiceResult<String>;

    /// Remove a committed object and any blocks still staged for it.
    async fn delete_blob(&self, container: &str, blob: &str) -> ServiceResult<()>;
}

/// Signs and verifies time-scoped read URLs.
#[derive(Clone)]
pub struct UrlSigner {
    public_url: String,
    key: String,
}

impl UrlSigner {
    pub fn new(public_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
        }
    }

    /// Base URL links are issued under, without a trailing slash.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    fn signature(&self, container: &str, blob: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(b"\n");
        hasher.update(container.as_bytes());
        hasher.update(b"\n");
        hasher.update(blob.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn url(&self, container: &str, blob: &str, expires_at: DateTime<Utc>) -> String {
        let expires = expires_at.timestamp();
        format!(
            "{}/blobs/{}/{}?expires={}&signature={}",
            self.public_url,
            encode_path(container),
            encode_path(blob),
            expires,
            self.signature(container, blob, expires)
        )
    }

    /// True when `signature` matches and `expires` is still in the future.
    pub fn verify(
        &self,
        container: &str,
        blob: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if expires <= now.timestamp() {
            return false;
        }
        let expected = self.signature(container, blob, expires);
        expected.len() == signature.len()
            && expected
                .bytes()
                .zip(signature.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

/// Percent-encode everything except unreserved characters and `/`.
fn encode_path(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Disk-backed `BlockStore`.
///
/// Containers are directories under `root`. Staged blocks live under
/// `root/{container}/.blocks/...` until a commit concatenates them.
#[derive(Clone)]
pub struct LocalBlockStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl LocalBlockStore {
    pub fn new(root: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            root: root.into(),
            signer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Containers are a single path segment.
    fn ensure_container_safe(&self, container: &str) -> ServiceResult<()> {
        ensure_present(container, "containerName")?;
        if container.starts_with('.')
            || container.contains('/')
            || container.contains('\\')
            || container.bytes().any(|b| b.is_ascii_control())
        {
            return Err(ServiceError::invalid(
                "containerName",
                "must be a single path segment.",
            ));
        }
        Ok(())
    }

    /// Blob names only feed the key digest, so just length and control
    /// characters matter.
    fn ensure_blob_safe(&self, blob: &str) -> ServiceResult<()> {
        ensure_present(blob, "blobName")?;
        if blob.len() > MAX_BLOB_NAME_LEN || blob.bytes().any(|b| b.is_ascii_control()) {
            return Err(ServiceError::invalid("blobName", "is not a safe object name."));
        }
        Ok(())
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.root.join(container)
    }

    /// Two-level shard from MD5(container/blob), as lowercase hex bytes.
    fn shards(container: &str, blob: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, blob));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fixed-length file name for `blob`: lowercase hex SHA-256.
    fn object_key(blob: &str) -> String {
        format!("{:x}", Sha256::digest(blob.as_bytes()))
    }

    fn object_path(&self, container: &str, blob: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(container, blob);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(Self::object_key(blob));
        path
    }

    fn staging_dir(&self, container: &str, blob: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(container, blob);
        let mut path = self.container_root(container);
        path.push(STAGING_DIR);
        path.push(shard_a);
        path.push(shard_b);
        path.push(Self::object_key(blob));
        path
    }

    /// Block ids are base64 and may contain `/`; file names use the URL-safe alphabet.
    fn block_path(&self, container: &str, blob: &str, block_id: &str) -> PathBuf {
        self.staging_dir(container, blob)
            .join(general_purpose::URL_SAFE_NO_PAD.encode(block_id))
    }

    /// Open a committed object for streaming, returning its length.
    pub async fn open_blob(&self, container: &str, blob: &str) -> ServiceResult<(File, u64)> {
        self.ensure_container_safe(container)?;
        self.ensure_blob_safe(blob)?;
        let path = self.object_path(container, blob);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ServiceError::not_found(format!("blob `{}` not found in `{}`", blob, container))
            } else {
                ServiceError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Write `bytes` to a temp file beside `target`, fsync, then rename over it.
    async fn write_atomically(&self, target: &Path, bytes: &[u8]) -> ServiceResult<()> {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            ServiceError::Io(io::Error::new(ErrorKind::Other, "path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = write_and_sync(&mut file, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        rename_over(&tmp_path, target).await
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn remove_staging(&self, container: &str, blob: &str) {
        let staging = self.staging_dir(container, blob);
        match fs::remove_dir_all(&staging).await {
            Ok(_) => debug!("removed staged blocks at {}", staging.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!(
                "failed to remove staged blocks at {}: {}",
                staging.display(),
                err
            ),
        }
        if let Some(parent) = staging.parent() {
            let stop = self.container_root(container).join(STAGING_DIR);
            self.prune_empty_dirs(parent, &stop).await;
        }
    }
}

async fn write_and_sync(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn rename_over(tmp_path: &Path, target: &Path) -> ServiceResult<()> {
    if let Err(err) = fs::rename(tmp_path, target).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(target).await?;
            fs::rename(tmp_path, target).await?;
        } else {
            let _ = fs::remove_file(tmp_path).await;
            return Err(ServiceError::Io(err));
        }
    }
    Ok(())
}

#[async_trait]
impl BlockStore for LocalBlockStore {
    async fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        bytes: Bytes,
    ) -> ServiceResult<()> {
        self.ensure_container_safe(container)?;
        self.ensure_blob_safe(blob)?;
        ensure_present(block_id, "blockId")?;
        if bytes.is_empty() {
            return Err(ServiceError::invalid("chunkFile", "must not be empty."));
        }

        let path = self.block_path(container, blob, block_id);
        self.write_atomically(&path, &bytes).await?;
        debug!(
            "staged block {} ({} bytes) for {}/{}",
            block_id,
            bytes.len(),
            container,
            blob
        );
        Ok(())
    }

    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
    ) -> ServiceResult<()> {
        self.ensure_container_safe(container)?;
        self.ensure_blob_safe(blob)?;
        if block_ids.is_empty() {
            return Err(ServiceError::invalid("blockIds", "must be provided."));
        }
        for block_id in block_ids {
            ensure_present(block_id, "blockId")?;
        }

        if !fs::try_exists(self.container_root(container)).await? {
            return Err(ServiceError::PreconditionFailed(format!(
                "container `{}` does not exist",
                container
            )));
        }

        let mut block_paths = Vec::with_capacity(block_ids.len());
        for block_id in block_ids {
            let path = self.block_path(container, blob, block_id);
            if !fs::try_exists(&path).await? {
                return Err(ServiceError::conflict(format!(
                    "block `{}` was never staged for `{}`",
                    block_id, blob
                )));
            }
            block_paths.push(path);
        }

        let target = self.object_path(container, blob);
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            ServiceError::Io(io::Error::new(ErrorKind::Other, "object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        for path in &block_paths {
            let copied = match File::open(path).await {
                Ok(mut block) => tokio::io::copy(&mut block, &mut file).await,
                Err(err) => Err(err),
            };
            match copied {
                Ok(n) => size_bytes += n,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ServiceError::Io(err));
                }
            }
        }
        if let Err(err) = write_and_sync(&mut file, &[]).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }
        rename_over(&tmp_path, &target).await?;

        self.remove_staging(container, blob).await;
        debug!(
            "committed {} blocks ({} bytes) into {}/{}",
            block_ids.len(),
            size_bytes,
            container,
            blob
        );
        Ok(())
    }

    async fn generate_read_url(
        &self,
        blob: &str,
        container: &str,
        expires_at: DateTime<Utc>,
    ) -> ServiceResult<String> {
        self.ensure_container_safe(container)?;
        self.ensure_blob_safe(blob)?;
        if !fs::try_exists(self.object_path(container, blob)).await? {
            return Err(ServiceError::not_found("Blob does not exist."));
        }
        Ok(self.signer.url(container, blob, expires_at))
    }

    async fn delete_blob(&self, container: &str, blob: &str) -> ServiceResult<()> {
        self.ensure_container_safe(container)?;
        self.ensure_blob_safe(blob)?;

        let path = self.object_path(container, blob);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed object {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object {} already missing", path.display());
            }
            Err(err) => return Err(ServiceError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            let container_root = self.container_root(container);
            self.prune_empty_dirs(parent, &container_root).await;
        }
        self.remove_staging(container, blob).await;
        Ok(())
    }
}
