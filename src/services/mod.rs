pub mod block_store;
pub mod expiry_worker;
pub mod file_upload_repository;
pub mod metadata_repository;
pub mod notifier;
pub mod share_service;
pub mod upload_coordinator;
