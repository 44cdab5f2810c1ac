//! HTTP handlers for single-shot shares.

use crate::{
    errors::AppError,
    handlers::{file_entry_handlers::run_to_completion, upload_form::UploadForm},
    services::{
        share_service::{ShareDetails, ShareReceipt, ShareRequest, SharedFile},
        upload_coordinator::parse_expiry,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
};

/// `POST /file/upload`
///
/// Multipart with an optional `file` part, an optional `note` and a required
/// `ExpiryDuration` (name or minutes).
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ShareReceipt>, AppError> {
    let mut form = UploadForm::read(multipart, "file").await?;
    let expiry = match form.optional("expiryDuration") {
        Some(value) => value,
        None => form.text("ExpiryDuration")?,
    };
    // Browsers send an empty, unnamed part when no file was picked.
    let file = form
        .take_file()
        .map(|bytes| SharedFile {
            file_name: form.take_file_name().unwrap_or_default(),
            bytes,
        })
        .filter(|file| !(file.bytes.is_empty() && file.file_name.is_empty()));
    let request = ShareRequest {
        file,
        note: form.optional("note"),
        expiry_duration: parse_expiry(&expiry)?,
    };

    let shares = state.shares.clone();
    let receipt = run_to_completion(async move { shares.upload(request).await }).await?;
    Ok(Json(receipt))
}

/// `GET /file/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ShareDetails>, AppError> {
    let details = state.shares.details(&id).await?;
    Ok(Json(details))
}
