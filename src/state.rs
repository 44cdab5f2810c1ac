//! Shared handler state.

use crate::services::{
    block_store::LocalBlockStore,
    file_upload_repository::FileUploadRepository,
    metadata_repository::MetadataRepository,
    notifier::SqliteNotifier,
    share_service::ShareService,
    upload_coordinator::{CoordinatorSettings, UploadCoordinator},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Everything a handler can reach. Cheap to clone; all members are shared.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    pub shares: ShareService,
    pub store: Arc<LocalBlockStore>,
    pub db: Arc<SqlitePool>,
}

impl AppState {
    /// Wire the coordinator and the share service to SQLite and `store`.
    pub fn new(
        db: Arc<SqlitePool>,
        store: Arc<LocalBlockStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        let shares = ShareService::new(
            FileUploadRepository::new(db.clone()),
            store.clone(),
            settings.container_name.clone(),
            store.signer().public_url(),
        );
        let coordinator = UploadCoordinator::new(
            MetadataRepository::new(db.clone()),
            store.clone(),
            Arc::new(SqliteNotifier::new(db.clone())),
            settings,
        );
        Self {
            coordinator,
            shares,
            store,
            db,
        }
    }
}
