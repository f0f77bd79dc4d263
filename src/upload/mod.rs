//! Resumable upload engine.
//!
//! Implements create / append-chunk / status / delete over an
//! [`UploadRecordStore`] and a [`BlobStore`]. Bytes land under a temporary
//! key (`{id}_temp{ext}`) and are renamed to their final key
//! (`{id}_{filename}`) once `offset == size`.

mod error;
mod locking;
pub mod sanitize;

pub use error::UploadError;
pub use locking::{LockManager, UploadLock};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::object_store::BlobStore;
use crate::storage::models::{UploadPatch, UploadRecord, UploadState};
use crate::storage::UploadRecordStore;

/// Engine limits, taken from `Config` at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest `Upload-Length` accepted at creation
    pub max_upload_size: u64,
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 50 * 1024 * 1024,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateUpload {
    pub upload_length: u64,
    pub upload_metadata: Option<String>,
    /// Byte count the client claims to be sending with this request
    pub content_length: u64,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct AppendChunk {
    pub upload_id: String,
    /// Offset the client believes is current
    pub upload_offset: u64,
    pub content_length: u64,
    pub body: Bytes,
}

/// Outcome of the temp -> final rename performed when an upload completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Finalization {
    Renamed { url: String },
    /// The record is complete but its bytes stayed under the temp key.
    RenameFailed { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub id: String,
    pub offset: u64,
    pub state: UploadState,
    pub finalization: Option<Finalization>,
}

#[derive(Debug, Clone)]
pub struct AppendedChunk {
    pub offset: u64,
    pub state: UploadState,
    pub finalization: Option<Finalization>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub id: String,
    pub offset: u64,
    pub size: u64,
    pub state: UploadState,
    pub url: String,
}

impl From<&UploadRecord> for UploadStatus {
    fn from(record: &UploadRecord) -> Self {
        Self {
            id: record.id.clone(),
            offset: record.offset,
            size: record.size,
            state: record.state(),
            url: record.url.clone(),
        }
    }
}

pub fn temp_key(id: &str, filename: &str) -> String {
    format!("{id}_temp{}", sanitize::extension(filename))
}

pub fn final_key(id: &str, filename: &str) -> String {
    format!("{id}_{filename}")
}

/// The key a record's bytes are expected under, given its completion state.
pub fn expected_key(record: &UploadRecord) -> String {
    if record.is_complete() {
        final_key(&record.id, &record.filename)
    } else {
        temp_key(&record.id, &record.filename)
    }
}

pub struct UploadEngine {
    records: Arc<dyn UploadRecordStore>,
    blobs: Arc<dyn BlobStore>,
    locks: LockManager,
    config: EngineConfig,
}

impl UploadEngine {
    pub fn new(
        records: Arc<dyn UploadRecordStore>,
        blobs: Arc<dyn BlobStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            records,
            blobs,
            locks: LockManager::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<dyn UploadRecordStore> {
        &self.records
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Start a new upload, persisting whatever bytes came with the request.
    pub async fn create(&self, req: CreateUpload) -> Result<CreatedUpload, UploadError> {
        let body_len = req.body.len() as u64;
        if body_len != req.content_length {
            return Err(UploadError::LengthMismatch {
                declared: req.content_length,
                actual: body_len,
            });
        }
        if req.upload_length > self.config.max_upload_size {
            return Err(UploadError::SizeExceeded {
                limit: self.config.max_upload_size,
                attempted: req.upload_length,
            });
        }
        if body_len > req.upload_length {
            return Err(UploadError::SizeExceeded {
                limit: req.upload_length,
                attempted: body_len,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let filename = sanitize::sanitize(req.upload_metadata.as_deref(), &id);
        let temp = temp_key(&id, &filename);

        let written = self
            .blobs
            .write(&temp, req.body)
            .await
            .map_err(UploadError::StorageWriteFailed)?;
        let verified = if written == body_len {
            self.verify_size(&temp, body_len).await
        } else {
            Err(UploadError::SizeVerificationFailed {
                expected: body_len,
                actual: written,
            })
        };
        if let Err(e) = verified {
            error!(upload_id = %id, error = %e, "Initial write did not persist fully");
            self.discard(&temp).await;
            return Err(e);
        }

        let (url, finalization) = if body_len == req.upload_length {
            let outcome = self.finalize(&id, &temp, &final_key(&id, &filename)).await;
            (outcome_url(&outcome).to_string(), Some(outcome))
        } else {
            (temp, None)
        };

        let now = Utc::now();
        let record = UploadRecord {
            id: id.clone(),
            url: url.clone(),
            filename,
            size: req.upload_length,
            offset: body_len,
            created_at: now,
            updated_at: now,
            report_id: None,
        };

        let record = match self.records.create(record).await {
            Ok(record) => record,
            Err(e) => {
                self.discard(&url).await;
                return Err(e.into());
            }
        };

        debug!(
            upload_id = %id,
            size = record.size,
            offset = record.offset,
            filename = %record.filename,
            "Created upload"
        );

        Ok(CreatedUpload {
            id,
            offset: record.offset,
            state: record.state(),
            finalization,
        })
    }

    /// Append one chunk at `upload_offset`, completing the upload when the
    /// last byte arrives.
    pub async fn append_chunk(&self, req: AppendChunk) -> Result<AppendedChunk, UploadError> {
        let id = req.upload_id.as_str();
        let _guard = self
            .locks
            .lock_with_timeout(id, self.config.lock_timeout)
            .await
            .map_err(|_| UploadError::UploadBusy(id.to_string()))?;

        let record = self
            .records
            .find_by_id(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

        let chunk_len = req.body.len() as u64;
        if chunk_len != req.content_length {
            return Err(UploadError::LengthMismatch {
                declared: req.content_length,
                actual: chunk_len,
            });
        }
        if req.upload_offset != record.offset {
            return Err(UploadError::OffsetMismatch {
                expected: record.offset,
                received: req.upload_offset,
            });
        }
        if chunk_len == 0 {
            return Ok(AppendedChunk {
                offset: record.offset,
                state: record.state(),
                finalization: None,
            });
        }

        let new_offset = record.offset + chunk_len;
        if new_offset > record.size {
            return Err(UploadError::SizeExceeded {
                limit: record.size,
                attempted: new_offset,
            });
        }

        self.reconcile(id, &record.url, record.offset).await?;

        if let Err(e) = self.blobs.append(&record.url, req.body).await {
            self.rollback(id, &record.url, record.offset).await;
            return Err(UploadError::StorageWriteFailed(e));
        }
        if let Err(e) = self.verify_size(&record.url, new_offset).await {
            error!(upload_id = %id, error = %e, "Appended chunk did not persist fully");
            self.rollback(id, &record.url, record.offset).await;
            return Err(e);
        }

        let mut patch = UploadPatch {
            offset: Some(new_offset),
            ..Default::default()
        };
        let finalization = if new_offset == record.size {
            let outcome = self
                .finalize(id, &record.url, &final_key(id, &record.filename))
                .await;
            if let Finalization::Renamed { ref url } = outcome {
                patch.url = Some(url.clone());
            }
            Some(outcome)
        } else {
            None
        };

        let updated = match self.records.update(id, patch).await {
            Ok(Some(updated)) => updated,
            Ok(None) => return Err(UploadError::NotFound(id.to_string())),
            Err(e) => {
                if let Some(Finalization::Renamed { ref url }) = finalization {
                    self.undo_rename(id, url, &record.url).await;
                }
                self.rollback(id, &record.url, record.offset).await;
                return Err(e.into());
            }
        };

        debug!(
            upload_id = %id,
            offset = updated.offset,
            size = updated.size,
            "Appended chunk"
        );

        Ok(AppendedChunk {
            offset: updated.offset,
            state: updated.state(),
            finalization,
        })
    }

    pub async fn status(&self, upload_id: &str) -> Result<UploadStatus, UploadError> {
        let record = self
            .records
            .find_by_id(upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;
        Ok(UploadStatus::from(&record))
    }

    /// Remove an upload's bytes and its record. A failure to delete the bytes
    /// is logged and does not stop the record removal.
    pub async fn delete(&self, upload_id: &str) -> Result<(), UploadError> {
        let _guard = self
            .locks
            .lock_with_timeout(upload_id, self.config.lock_timeout)
            .await
            .map_err(|_| UploadError::UploadBusy(upload_id.to_string()))?;

        let record = self
            .records
            .find_by_id(upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;

        let expected = expected_key(&record);
        if expected != record.url {
            warn!(
                upload_id,
                expected = %expected,
                stored = %record.url,
                "Upload bytes are not under their expected key"
            );
        }

        if let Err(e) = self.blobs.delete(&record.url).await {
            warn!(upload_id, key = %record.url, error = %e, "Failed to delete upload bytes");
        }

        if !self.records.delete(upload_id).await? {
            return Err(UploadError::NotFound(upload_id.to_string()));
        }

        debug!(upload_id, "Deleted upload");
        Ok(())
    }

    async fn finalize(&self, id: &str, temp: &str, target: &str) -> Finalization {
        match self.blobs.rename(temp, target).await {
            Ok(()) => Finalization::Renamed {
                url: target.to_string(),
            },
            Err(e) => {
                warn!(
                    upload_id = %id,
                    from = %temp,
                    to = %target,
                    error = %e,
                    "Upload complete but rename to final key failed"
                );
                Finalization::RenameFailed {
                    url: temp.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn undo_rename(&self, id: &str, from: &str, to: &str) {
        if let Err(e) = self.blobs.rename(from, to).await {
            error!(upload_id = %id, error = %e, "Failed to restore temp key after record update failed");
        }
    }

    /// Bring the blob back in line with the recorded offset before appending.
    /// Bytes past the offset belong to an append whose record update never
    /// landed and are dropped; missing bytes cannot be repaired.
    async fn reconcile(&self, id: &str, key: &str, offset: u64) -> Result<(), UploadError> {
        let actual = self
            .blobs
            .size(key)
            .await
            .map_err(UploadError::StorageWriteFailed)?
            .unwrap_or(0);
        if actual > offset {
            warn!(upload_id = %id, key = %key, offset, actual, "Dropping bytes past recorded offset");
            self.blobs
                .truncate(key, offset)
                .await
                .map_err(UploadError::StorageWriteFailed)?;
        } else if actual < offset {
            return Err(UploadError::SizeVerificationFailed {
                expected: offset,
                actual,
            });
        }
        Ok(())
    }

    /// Undo a partial append so the blob length matches the record again.
    async fn rollback(&self, id: &str, key: &str, offset: u64) {
        if let Err(e) = self.blobs.truncate(key, offset).await {
            error!(upload_id = %id, key = %key, error = %e, "Failed to roll back appended bytes");
        }
    }

    async fn verify_size(&self, key: &str, expected: u64) -> Result<(), UploadError> {
        let actual = self
            .blobs
            .size(key)
            .await
            .map_err(UploadError::StorageWriteFailed)?
            .unwrap_or(0);
        if actual != expected {
            return Err(UploadError::SizeVerificationFailed { expected, actual });
        }
        Ok(())
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.blobs.delete(key).await {
            warn!(key = %key, error = %e, "Failed to clean up upload bytes");
        }
    }
}

fn outcome_url(outcome: &Finalization) -> &str {
    match outcome {
        Finalization::Renamed { url } | Finalization::RenameFailed { url, .. } => url,
    }
}
