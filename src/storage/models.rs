use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Three-state patch value for partial updates.
/// Unlike `Option<Option<T>>`, each variant has a distinct wire representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Patch<T> {
    /// Field was not included in the request (no change).
    #[default]
    Absent,
    /// Field was explicitly set to null (clear it).
    Null,
    /// Field was set to a new value.
    Value(T),
}

impl<T> From<Option<Option<T>>> for Patch<T> {
    fn from(v: Option<Option<T>>) -> Self {
        match v {
            None => Patch::Absent,
            Some(None) => Patch::Null,
            Some(Some(v)) => Patch::Value(v),
        }
    }
}

impl<T> Patch<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Patch::Absent)
    }
}

/// Where an upload sits in its lifecycle. Derived from the record, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Created, no bytes received yet.
    Pending,
    /// Some but not all bytes received.
    InProgress,
    /// `offset == size`.
    Complete,
}

/// One in-flight or completed upload, stored in redb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    /// Blob store key currently holding the bytes (temp key until completion).
    pub url: String,
    /// Sanitized client filename.
    pub filename: String,
    pub size: u64,
    pub offset: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub report_id: Option<String>,
}

impl UploadRecord {
    pub fn is_complete(&self) -> bool {
        self.offset == self.size
    }

    pub fn state(&self) -> UploadState {
        if self.is_complete() {
            UploadState::Complete
        } else if self.offset == 0 {
            UploadState::Pending
        } else {
            UploadState::InProgress
        }
    }
}

/// Partial update applied by `UploadRecordStore::update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadPatch {
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub report_id: Patch<String>,
}

impl UploadPatch {
    pub fn is_empty(&self) -> bool {
        self.offset.is_none() && self.url.is_none() && self.report_id.is_absent()
    }
}
