mod gcs;
mod local;

pub use gcs::GcsStore;
pub use local::LocalStore;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Abstraction over the durable storage that holds upload bytes.
///
/// Keys are flat names relative to the store's root (`{id}_temp.jpg`,
/// `{id}_photo.jpg`). Implementations must refuse any key that would resolve
/// outside that root.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create or truncate `key` with `data`, returning the number of bytes written.
    async fn write(&self, key: &str, data: Bytes) -> Result<u64, ObjectStoreError>;

    /// Append `data` to the end of `key`. The object must already exist.
    async fn append(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), ObjectStoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Current byte length of `key`, or `None` when it does not exist.
    async fn size(&self, key: &str) -> Result<Option<u64>, ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;

    /// Cut `key` back to its first `len` bytes.
    async fn truncate(&self, key: &str, len: u64) -> Result<(), ObjectStoreError>;
}

/// Reject keys that are empty, hidden, or could walk out of the store root.
///
/// Keys are a single path component, so dots inside a name are harmless.
pub(crate) fn validate_key(key: &str) -> Result<(), ObjectStoreError> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains('/')
        || key.contains('\\')
        || key.chars().any(|c| c.is_control());
    if bad {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Percent-encode a key for use as a single URL path segment.
pub(crate) fn encode_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
