use thiserror::Error;

use crate::object_store::ObjectStoreError;
use crate::storage::DatabaseError;

/// Failures surfaced by the upload engine. None of them leave a record
/// half-updated; the client recovers by re-querying status and resuming.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Content length mismatch: declared {declared} bytes, received {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("Offset mismatch: expected {expected}, received {received}")]
    OffsetMismatch { expected: u64, received: u64 },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload length exceeded: limit is {limit} bytes, request reaches {attempted}")]
    SizeExceeded { limit: u64, attempted: u64 },

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(#[source] ObjectStoreError),

    #[error("Size verification failed: expected {expected} bytes on storage, found {actual}")]
    SizeVerificationFailed { expected: u64, actual: u64 },

    #[error("Upload {0} is busy")]
    UploadBusy(String),

    #[error("Upload {0} is not complete")]
    Incomplete(String),

    #[error("Record store error: {0}")]
    Record(#[from] DatabaseError),
}
