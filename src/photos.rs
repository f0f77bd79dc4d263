//! Photo lifecycle hooks: attaching uploads to reports, resolving their
//! public URLs, and deleting them together with their bytes.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::object_store::encode_segment;
use crate::storage::models::{Patch, UploadPatch, UploadRecord};
use crate::upload::{UploadEngine, UploadError};

pub struct PhotoLifecycle {
    engine: Arc<UploadEngine>,
    public_base_path: String,
}

impl PhotoLifecycle {
    pub fn new(engine: Arc<UploadEngine>, public_base_path: impl Into<String>) -> Self {
        Self {
            engine,
            public_base_path: public_base_path.into(),
        }
    }

    pub async fn get(&self, upload_id: &str) -> Result<UploadRecord, UploadError> {
        self.engine
            .records()
            .find_by_id(upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }

    /// Public URL for a photo, built from the record's stored locator.
    pub fn url_for(&self, record: &UploadRecord) -> String {
        format!(
            "{}/{}",
            self.public_base_path.trim_end_matches('/'),
            encode_segment(&record.url)
        )
    }

    pub async fn resolve_url(&self, upload_id: &str) -> Result<String, UploadError> {
        let record = self.get(upload_id).await?;
        Ok(self.url_for(&record))
    }

    /// Associate a completed upload with a report.
    pub async fn attach_to_report(
        &self,
        upload_id: &str,
        report_id: &str,
    ) -> Result<UploadRecord, UploadError> {
        let record = self.get(upload_id).await?;
        if !record.is_complete() {
            return Err(UploadError::Incomplete(upload_id.to_string()));
        }

        let patch = UploadPatch {
            report_id: Patch::Value(report_id.to_string()),
            ..Default::default()
        };
        let updated = self.update(upload_id, patch).await?;
        debug!(upload_id, report_id, "Attached photo to report");
        Ok(updated)
    }

    pub async fn detach_from_report(&self, upload_id: &str) -> Result<UploadRecord, UploadError> {
        let patch = UploadPatch {
            report_id: Patch::Null,
            ..Default::default()
        };
        let updated = self.update(upload_id, patch).await?;
        debug!(upload_id, "Detached photo from report");
        Ok(updated)
    }

    pub async fn photos_for_report(
        &self,
        report_id: &str,
    ) -> Result<Vec<UploadRecord>, UploadError> {
        Ok(self.engine.records().find_by_report(report_id).await?)
    }

    pub async fn delete_photo(&self, upload_id: &str) -> Result<(), UploadError> {
        self.engine.delete(upload_id).await
    }

    /// Delete every photo attached to a report. Individual failures are
    /// logged and skipped; returns how many were deleted.
    pub async fn delete_report_photos(&self, report_id: &str) -> Result<u64, UploadError> {
        let photos = self.photos_for_report(report_id).await?;
        let mut deleted = 0;
        for photo in photos {
            match self.engine.delete(&photo.id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(upload_id = %photo.id, report_id, error = %e, "Failed to delete report photo");
                }
            }
        }
        debug!(report_id, deleted, "Deleted report photos");
        Ok(deleted)
    }

    async fn update(&self, upload_id: &str, patch: UploadPatch) -> Result<UploadRecord, UploadError> {
        self.engine
            .records()
            .update(upload_id, patch)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }
}
