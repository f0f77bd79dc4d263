pub mod db;
pub mod models;
mod tables;
mod uploads;

pub use db::{Database, DatabaseError};
pub use tables::*;

use async_trait::async_trait;

use models::{UploadPatch, UploadRecord};

/// The narrow ledger the upload engine persists its metadata through.
///
/// Implementations hold no business rules. Each call must be atomic for the
/// single record it touches.
#[async_trait]
pub trait UploadRecordStore: Send + Sync {
    async fn create(&self, record: UploadRecord) -> Result<UploadRecord, DatabaseError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<UploadRecord>, DatabaseError>;

    /// Returns `None` when no record exists for `id`.
    async fn update(
        &self,
        id: &str,
        patch: UploadPatch,
    ) -> Result<Option<UploadRecord>, DatabaseError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, DatabaseError>;

    async fn find_by_report(&self, report_id: &str) -> Result<Vec<UploadRecord>, DatabaseError>;
}

#[async_trait]
impl UploadRecordStore for Database {
    async fn create(&self, record: UploadRecord) -> Result<UploadRecord, DatabaseError> {
        self.put_upload(&record)?;
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UploadRecord>, DatabaseError> {
        self.get_upload(id)
    }

    async fn update(
        &self,
        id: &str,
        patch: UploadPatch,
    ) -> Result<Option<UploadRecord>, DatabaseError> {
        self.update_upload(id, &patch)
    }

    async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        Ok(self.delete_upload(id)?.is_some())
    }

    async fn find_by_report(&self, report_id: &str) -> Result<Vec<UploadRecord>, DatabaseError> {
        self.get_uploads_by_report(report_id)
    }
}
