//! Download endpoint for finalized files, addressed by signed URL.

use crate::{errors::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

/// `GET /blobs/{container}/{*blob}?expires=..&signature=..`
///
/// Streams the committed object. A missing, forged or expired signature is
/// 403 before the store is touched.
pub async fn get_blob(
    State(state): State<AppState>,
    Path((container, blob)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, AppError> {
    let (Some(expires), Some(signature)) = (query.expires, query.signature.as_deref()) else {
        return Err(AppError::forbidden("Download link is missing its signature."));
    };
    if !state
        .store
        .signer()
        .verify(&container, &blob, expires, signature, Utc::now())
    {
        return Err(AppError::forbidden("Download link is invalid or has expired."));
    }

    let (file, size_bytes) = state.store.open_blob(&container, &blob).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &blob, size_bytes);
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, blob: &str, size_bytes: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size_bytes));

    let file_name = blob.rsplit('/').next().unwrap_or(blob).replace('"', "_");
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
