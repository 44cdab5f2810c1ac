//! Core data models for the chunked upload service.
//!
//! `FileEntry`, `Chunk` and `FileUpload` map to database tables via `sqlx::FromRow`;
//! `UploadResponse` and `DeleteFileMessage` are wire payloads.

pub mod chunk;
pub mod delete_message;
pub mod expiry;
pub mod file_entry;
pub mod file_upload;
pub mod upload_response;
