//! Resumable, chunked file sharing.
//!
//! Clients split a file into chunks, stage each one by content hash, and the
//! service commits them into a single object with a time-limited download
//! link. Expired files are removed by a background worker.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
