use redb::{ReadableTable, WriteTransaction};

use super::db::{Database, DatabaseError};
use super::models::{Patch, UploadPatch, UploadRecord};
use super::tables::*;

impl Database {
    // ========================================================================
    // Upload operations
    // ========================================================================

    /// Store an upload record and update the report index
    pub fn put_upload(&self, upload: &UploadRecord) -> Result<(), DatabaseError> {
        debug_assert!(!upload.id.is_empty(), "upload id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(UPLOADS)?;
            let data = rmp_serde::to_vec_named(upload)?;
            table.insert(upload.id.as_str(), data.as_slice())?;
        }
        if let Some(ref report_id) = upload.report_id {
            index_add(&write_txn, report_id, &upload.id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get an upload by its id
    pub fn get_upload(&self, id: &str) -> Result<Option<UploadRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(UPLOADS)?;

        match table.get(id)? {
            Some(data) => {
                let upload: UploadRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(upload))
            }
            None => Ok(None),
        }
    }

    /// Get all uploads attached to a report
    pub fn get_uploads_by_report(
        &self,
        report_id: &str,
    ) -> Result<Vec<UploadRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let report_table = read_txn.open_table(REPORT_UPLOADS)?;
        let uploads_table = read_txn.open_table(UPLOADS)?;

        let upload_ids: Vec<String> = match report_table.get(report_id)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => return Ok(Vec::new()),
        };

        let mut uploads = Vec::new();
        for upload_id in upload_ids {
            if let Some(data) = uploads_table.get(upload_id.as_str())? {
                let upload: UploadRecord = rmp_serde::from_slice(data.value())?;
                uploads.push(upload);
            }
        }

        Ok(uploads)
    }

    /// Delete an upload and clean up the report index. Returns the removed record.
    pub fn delete_upload(&self, id: &str) -> Result<Option<UploadRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let existing = read_upload(&write_txn, id)?;
        if let Some(ref upload) = existing {
            {
                let mut table = write_txn.open_table(UPLOADS)?;
                table.remove(id)?;
            }
            if let Some(ref report_id) = upload.report_id {
                index_remove(&write_txn, report_id, id)?;
            }
        }

        write_txn.commit()?;
        Ok(existing)
    }

    /// Apply a partial update in a single transaction. Returns the updated
    /// record, or `None` when the id is unknown.
    pub fn update_upload(
        &self,
        id: &str,
        patch: &UploadPatch,
    ) -> Result<Option<UploadRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let updated = match read_upload(&write_txn, id)? {
            Some(mut upload) => {
                if let Some(offset) = patch.offset {
                    upload.offset = offset;
                }
                if let Some(ref url) = patch.url {
                    upload.url = url.clone();
                }

                let new_report = match &patch.report_id {
                    Patch::Absent => None,
                    Patch::Null => Some(None),
                    Patch::Value(r) => Some(Some(r.clone())),
                };
                if let Some(new_report) = new_report {
                    if upload.report_id != new_report {
                        if let Some(ref old) = upload.report_id {
                            index_remove(&write_txn, old, id)?;
                        }
                        if let Some(ref new) = new_report {
                            index_add(&write_txn, new, id)?;
                        }
                        upload.report_id = new_report;
                    }
                }

                upload.updated_at = chrono::Utc::now();

                let serialized = rmp_serde::to_vec_named(&upload)?;
                let mut table = write_txn.open_table(UPLOADS)?;
                table.insert(id, serialized.as_slice())?;
                Some(upload)
            }
            None => None,
        };

        write_txn.commit()?;
        Ok(updated)
    }

    /// Get all uploads
    pub fn get_all_uploads(&self) -> Result<Vec<UploadRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(UPLOADS)?;

        let mut uploads = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let upload: UploadRecord = rmp_serde::from_slice(value.value())?;
            uploads.push(upload);
        }

        Ok(uploads)
    }
}

fn read_upload(
    write_txn: &WriteTransaction,
    id: &str,
) -> Result<Option<UploadRecord>, DatabaseError> {
    let table = write_txn.open_table(UPLOADS)?;
    let result = match table.get(id)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };
    Ok(result)
}

fn index_add(
    write_txn: &WriteTransaction,
    report_id: &str,
    upload_id: &str,
) -> Result<(), DatabaseError> {
    let mut report_table = write_txn.open_table(REPORT_UPLOADS)?;
    let mut ids: Vec<String> = match report_table.get(report_id)? {
        Some(data) => rmp_serde::from_slice(data.value())?,
        None => Vec::new(),
    };

    if !ids.iter().any(|u| u == upload_id) {
        ids.push(upload_id.to_string());
        let data = rmp_serde::to_vec_named(&ids)?;
        report_table.insert(report_id, data.as_slice())?;
    }
    Ok(())
}

fn index_remove(
    write_txn: &WriteTransaction,
    report_id: &str,
    upload_id: &str,
) -> Result<(), DatabaseError> {
    let mut report_table = write_txn.open_table(REPORT_UPLOADS)?;
    let ids: Option<Vec<String>> = match report_table.get(report_id)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };

    if let Some(mut ids) = ids {
        ids.retain(|u| u != upload_id);
        if ids.is_empty() {
            report_table.remove(report_id)?;
        } else {
            let data = rmp_serde::to_vec_named(&ids)?;
            report_table.insert(report_id, data.as_slice())?;
        }
    }
    Ok(())
}
