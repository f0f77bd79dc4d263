use std::time::Duration;

use thiserror::Error;

use crate::upload::EngineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Gcs,
    Local,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Upload root for the local backend
    pub upload_dir: String,
    /// GCS bucket name (required when backend is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC)
    pub gcs_credentials_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum declared upload length in bytes
    pub max_upload_size: u64,
    /// Prefix for public photo URLs
    pub public_base_path: String,
    pub lock_wait_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            upload_dir: "./uploads".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 50 * 1024 * 1024, // 50MB
            public_base_path: "/uploads".to_string(),
            lock_wait_timeout_ms: 5000,
        }
    }
}

impl UploadConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_upload_size: self.max_upload_size,
            lock_timeout: Duration::from_millis(self.lock_wait_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_defaults = NodeConfig::default();
        let upload_defaults = UploadConfig::default();

        let bind_address = lookup("BIND_ADDRESS").unwrap_or(node_defaults.bind_address);
        let data_dir = lookup("DATA_DIR").unwrap_or(node_defaults.data_dir);

        let test_mode = lookup("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size = lookup("MAX_UPLOAD_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(upload_defaults.max_upload_size);

        let lock_wait_timeout_ms = lookup("LOCK_WAIT_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(upload_defaults.lock_wait_timeout_ms);

        let public_base_path =
            lookup("PUBLIC_BASE_PATH").unwrap_or(upload_defaults.public_base_path);

        let backend = match lookup("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => StorageBackend::Gcs,
            _ => StorageBackend::Local,
        };

        let upload_dir = lookup("UPLOAD_DIR").unwrap_or_else(|| "./uploads".to_string());

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            storage: StorageConfig {
                backend,
                upload_dir,
                gcs_bucket: lookup("GCS_BUCKET"),
                gcs_credentials_file: lookup("GCS_CREDENTIALS_FILE"),
            },
            upload: UploadConfig {
                max_upload_size,
                public_base_path,
                lock_wait_timeout_ms,
            },
            test_mode,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.storage.backend, StorageBackend::Gcs) && self.storage.gcs_bucket.is_none()
        {
            return Err(ConfigError::ValidationError(
                "GCS_BUCKET is required when STORAGE_BACKEND=gcs".to_string(),
            ));
        }

        if self.upload.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than 0".to_string(),
            ));
        }

        if !self.upload.public_base_path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "PUBLIC_BASE_PATH must start with '/'".to_string(),
            ));
        }

        if self.upload.lock_wait_timeout_ms == 0 {
            tracing::warn!("LOCK_WAIT_TIMEOUT_MS is 0; concurrent chunks will fail as busy");
        }

        Ok(())
    }
}
