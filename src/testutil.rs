//! Shared test helpers for handler tests.

use std::sync::Arc;

use crate::config::{Config, NodeConfig, StorageConfig, UploadConfig};
use crate::object_store::LocalStore;
use crate::storage::Database;
use crate::AppState;

/// Create a test AppState with a temporary database and local blob store.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let upload_dir = temp_dir.path().join("uploads");

    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        storage: StorageConfig {
            upload_dir: upload_dir.to_string_lossy().to_string(),
            ..Default::default()
        },
        upload: UploadConfig {
            max_upload_size: 10 * 1024 * 1024, // 10MB for tests
            ..Default::default()
        },
        test_mode: true,
    };

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let blobs = LocalStore::new(&upload_dir).expect("Failed to create test blob store");

    Arc::new(AppState::new(config, db, Arc::new(blobs)))
}
