//! Defines routes for the chunked upload API.
//!
//! ## Structure
//! - **Upload workflow**
//!   - `POST /file-entry/create`: register a file before its first chunk
//!   - `POST /file-entry/handle-upload`: submit a chunk by hash, auto-finalize
//!   - `GET  /file-entry/{fileId}`: upload progress
//!   - `POST /file-entry/{fileId}/upload`: submit a chunk by id
//!   - `POST /file-entry/{fileId}/finalize`: commit a fully uploaded file
//!
//! - **Single-shot shares**
//!   - `POST /file/upload`: store a small file and/or a note
//!   - `GET  /file/{id}`: share details, content withheld once expired
//!
//! - **Downloads**
//!   - `GET /blobs/{container}/{*blob}`: signed read of a finalized file
//!
//! The wildcard `*blob` covers the `{fileId}/{fileName}` and
//! `shares/{id}/{fileName}` blob layouts.

use crate::{
    handlers::{
        blob_handlers::get_blob,
        file_entry_handlers::{
            create_file_entry, finalize_upload, get_file_entry, handle_upload,
            upload_file_entry_chunk,
        },
        file_handlers::{get_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    models::file_upload::MAX_SHARE_BYTES,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Multipart framing on top of the chunk itself.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the router. `max_chunk_bytes` bounds the request body of the chunk
/// endpoints.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    let upload_limit = DefaultBodyLimit::max(max_chunk_bytes.saturating_add(FORM_OVERHEAD_BYTES));
    let share_limit = DefaultBodyLimit::max(MAX_SHARE_BYTES + FORM_OVERHEAD_BYTES);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/file-entry/create", post(create_file_entry))
        .route(
            "/file-entry/handle-upload",
            post(handle_upload).layer(upload_limit.clone()),
        )
        .route("/file-entry/{file_id}", get(get_file_entry))
        .route(
            "/file-entry/{file_id}/upload",
            post(upload_file_entry_chunk).layer(upload_limit),
        )
        .route("/file-entry/{file_id}/finalize", post(finalize_upload))
        .route("/file/upload", post(upload_file).layer(share_limit))
        .route("/file/{id}", get(get_file))
        .route("/blobs/{container}/{*blob}", get(get_blob))
}

/// Router with its state attached, ready to serve.
pub fn build_app(state: AppState, max_chunk_bytes: usize) -> Router {
    routes(max_chunk_bytes).with_state(state)
}
