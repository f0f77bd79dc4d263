//! photo-uploads - Resumable photo uploads for civic issue reports
//!
//! This crate provides a TUS-style upload service with:
//! - Create / append-chunk / status / delete with strict offset bookkeeping
//! - Swappable blob storage backends (local filesystem, GCS)
//! - redb embedded database for upload records (ACID, crash-safe)
//! - Photo lifecycle hooks for attaching uploads to reports

pub mod api;
pub mod config;
pub mod object_store;
pub mod photos;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod upload;

use std::sync::Arc;

use config::Config;
use photos::PhotoLifecycle;
use storage::Database;
use upload::UploadEngine;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub engine: Arc<UploadEngine>,
    pub photos: PhotoLifecycle,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Database,
        blobs: Arc<dyn object_store::BlobStore>,
    ) -> Self {
        let engine = Arc::new(UploadEngine::new(
            Arc::new(db.clone()),
            blobs,
            config.upload.engine_config(),
        ));
        let photos = PhotoLifecycle::new(
            Arc::clone(&engine),
            config.upload.public_base_path.clone(),
        );
        Self {
            config,
            db,
            engine,
            photos,
        }
    }
}
