//! HTTP handlers for the chunked upload workflow.
//!
//! Chunk endpoints take `multipart/form-data` with camelCase field names;
//! every response body is an `UploadResponse` (or a `FileEntry` on create).
//! Coordinator calls run on their own task so a client hanging up mid-request
//! cannot leave a file locked.

use crate::{
    errors::{AppError, ServiceResult},
    handlers::upload_form::UploadForm,
    models::{file_entry::FileEntry, upload_response::UploadResponse},
    services::upload_coordinator::{ChunkSubmission, EntryChunk, parse_expiry},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State, rejection::JsonRejection},
};
use serde::Deserialize;
use std::future::Future;

/// Multipart part carrying the chunk bytes.
const CHUNK_FIELD: &str = "chunkFile";

/// Body of `POST /file-entry/create`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileEntryRequest {
    pub file_name: String,
    pub file_hash: String,
    pub file_size: i64,
    pub total_chunks: i64,
    pub expires_in: ExpiryField,
}

/// `expiresIn` arrives as a name (`"OneDay"`) or a minute count (`1440`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ExpiryField {
    Minutes(i64),
    Name(String),
}

impl ExpiryField {
    fn as_text(&self) -> String {
        match self {
            Self::Minutes(minutes) => minutes.to_string(),
            Self::Name(name) => name.clone(),
        }
    }
}

/// `POST /file-entry/create`
pub async fn create_file_entry(
    State(state): State<AppState>,
    payload: Result<Json<CreateFileEntryRequest>, JsonRejection>,
) -> Result<Json<FileEntry>, AppError> {
    let Json(req) = payload.map_err(|err| AppError::bad_request(err.body_text()))?;
    let expires_in = parse_expiry(&req.expires_in.as_text())?;

    let coordinator = state.coordinator.clone();
    let entry = run_to_completion(async move {
        coordinator
            .create_file_entry(
                &req.file_name,
                &req.file_hash,
                req.file_size,
                req.total_chunks,
                expires_in,
            )
            .await
    })
    .await?;
    Ok(Json(entry))
}

/// `POST /file-entry/handle-upload`
///
/// Creates the entry on the first chunk and finalizes on the last one.
pub async fn handle_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut form = UploadForm::read(multipart, CHUNK_FIELD).await?;
    let submission = ChunkSubmission {
        file_name: form.text("fileName")?,
        file_hash: form.text("fileHash")?,
        file_size: form.integer("fileSize")?,
        chunk_index: form.integer("chunkIndex")?,
        total_chunks: form.integer("totalChunks")?,
        chunk_hash: form.text("chunkHash")?,
        expires_in: parse_expiry(&form.text("expiresIn")?)?,
        chunk: form.take_file().unwrap_or_default(),
    };

    let coordinator = state.coordinator.clone();
    let response =
        run_to_completion(async move { coordinator.handle_file_upload(submission).await }).await?;
    Ok(Json(response))
}

/// `GET /file-entry/{fileId}`
pub async fn get_file_entry(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<UploadResponse>, AppError> {
    let response = state.coordinator.get_file_entry(&file_id).await?;
    Ok(Json(response))
}

/// `POST /file-entry/{fileId}/upload`
///
/// Stages one chunk of a known file. Never finalizes.
pub async fn upload_file_entry_chunk(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut form = UploadForm::read(multipart, CHUNK_FIELD).await?;
    let upload = EntryChunk {
        file_name: form.text("fileName")?,
        file_hash: form.text("fileHash")?,
        chunk_index: form.integer("chunkIndex")?,
        total_chunks: form.integer("totalChunks")?,
        chunk_hash: form.text("chunkHash")?,
        chunk: form.take_file().unwrap_or_default(),
    };

    let coordinator = state.coordinator.clone();
    let response = run_to_completion(async move {
        coordinator.upload_file_entry_chunk(&file_id, upload).await
    })
    .await?;
    Ok(Json(response))
}

/// `POST /file-entry/{fileId}/finalize`
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<UploadResponse>, AppError> {
    let coordinator = state.coordinator.clone();
    let outcome =
        run_to_completion(async move { coordinator.finalize_upload(&file_id).await }).await?;
    Ok(Json(outcome.into()))
}

/// Drive `work` on a detached task and wait for it.
pub(crate) async fn run_to_completion<F, T>(work: F) -> Result<T, AppError>
where
    F: Future<Output = ServiceResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|err| AppError::internal(format!("upload task aborted: {}", err)))?
        .map_err(AppError::from)
}
