use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use photo_uploads::object_store::{BlobStore, LocalStore, ObjectStoreError};
use photo_uploads::storage::models::{UploadPatch, UploadRecord, UploadState};
use photo_uploads::storage::{Database, DatabaseError, UploadRecordStore};
use photo_uploads::upload::{
    final_key, temp_key, AppendChunk, CreateUpload, EngineConfig, Finalization, UploadEngine,
    UploadError,
};

/// Local store with switchable failures.
#[derive(Default)]
struct Faults {
    fail_write: AtomicBool,
    short_write: AtomicBool,
    short_append: AtomicBool,
    fail_rename: AtomicBool,
    fail_delete: AtomicBool,
    fail_next_update: AtomicBool,
}

struct FaultyStore {
    inner: LocalStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl BlobStore for FaultyStore {
    async fn write(&self, key: &str, data: Bytes) -> Result<u64, ObjectStoreError> {
        if self.faults.fail_write.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend("disk full".into()));
        }
        if self.faults.short_write.load(Ordering::SeqCst) {
            let half = data.slice(..data.len() / 2);
            self.inner.write(key, half).await?;
            return Ok(data.len() as u64);
        }
        self.inner.write(key, data).await
    }

    async fn append(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        if self.faults.short_append.load(Ordering::SeqCst) {
            return self.inner.append(key, data.slice(..data.len() / 2)).await;
        }
        self.inner.append(key, data).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        if self.faults.fail_rename.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend("rename refused".into()));
        }
        self.inner.rename(from, to).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        if self.faults.fail_delete.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend("delete refused".into()));
        }
        self.inner.delete(key).await
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, ObjectStoreError> {
        self.inner.size(key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get(key).await
    }

    async fn truncate(&self, key: &str, len: u64) -> Result<(), ObjectStoreError> {
        self.inner.truncate(key, len).await
    }
}

/// Record store whose next update can be made to fail once.
struct FaultyRecords {
    inner: Database,
    faults: Arc<Faults>,
}

#[async_trait]
impl UploadRecordStore for FaultyRecords {
    async fn create(&self, record: UploadRecord) -> Result<UploadRecord, DatabaseError> {
        self.inner.create(record).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UploadRecord>, DatabaseError> {
        self.inner.find_by_id(id).await
    }

    async fn update(
        &self,
        id: &str,
        patch: UploadPatch,
    ) -> Result<Option<UploadRecord>, DatabaseError> {
        if self.faults.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Io(std::io::Error::other("db blip")));
        }
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        self.inner.delete(id).await
    }

    async fn find_by_report(&self, report_id: &str) -> Result<Vec<UploadRecord>, DatabaseError> {
        self.inner.find_by_report(report_id).await
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    db: Database,
    faults: Arc<Faults>,
    engine: Arc<UploadEngine>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("uploads");
    let db = Database::open(dir.path().join("data")).unwrap();
    let faults = Arc::new(Faults::default());
    let store = FaultyStore {
        inner: LocalStore::new(&root).unwrap(),
        faults: Arc::clone(&faults),
    };
    let records = FaultyRecords {
        inner: db.clone(),
        faults: Arc::clone(&faults),
    };
    let engine = Arc::new(UploadEngine::new(
        Arc::new(records),
        Arc::new(store),
        EngineConfig {
            max_upload_size: 1000,
            lock_timeout: Duration::from_secs(5),
        },
    ));
    Harness {
        _dir: dir,
        root,
        db,
        faults,
        engine,
    }
}

impl Harness {
    fn file_len(&self, key: &str) -> Option<u64> {
        std::fs::metadata(self.root.join(key)).ok().map(|m| m.len())
    }

    fn file_count(&self) -> usize {
        std::fs::read_dir(&self.root).unwrap().count()
    }

    async fn create(&self, length: u64, metadata: Option<&str>, body: Vec<u8>) -> Result<String, UploadError> {
        let created = self
            .engine
            .create(CreateUpload {
                upload_length: length,
                upload_metadata: metadata.map(|m| m.to_string()),
                content_length: body.len() as u64,
                body: Bytes::from(body),
            })
            .await?;
        Ok(created.id)
    }

    async fn append(&self, id: &str, offset: u64, body: Vec<u8>) -> Result<u64, UploadError> {
        let appended = self
            .engine
            .append_chunk(AppendChunk {
                upload_id: id.to_string(),
                upload_offset: offset,
                content_length: body.len() as u64,
                body: Bytes::from(body),
            })
            .await?;
        Ok(appended.offset)
    }
}

fn filename_metadata(name: &str) -> String {
    format!(
        "filename {}",
        base64::engine::general_purpose::STANDARD.encode(name)
    )
}

#[tokio::test]
async fn test_single_request_upload_completes() {
    let h = harness();
    let meta = filename_metadata("test.jpg");

    let created = h
        .engine
        .create(CreateUpload {
            upload_length: 100,
            upload_metadata: Some(meta),
            content_length: 100,
            body: Bytes::from(vec![7u8; 100]),
        })
        .await
        .unwrap();
    assert_eq!(created.offset, 100);
    assert_eq!(created.state, UploadState::Complete);

    let status = h.engine.status(&created.id).await.unwrap();
    assert_eq!(status.offset, 100);
    assert_eq!(status.state, UploadState::Complete);

    let final_name = format!("{}_test.jpg", created.id);
    assert_eq!(status.url, final_name);
    assert_eq!(
        created.finalization,
        Some(Finalization::Renamed {
            url: final_name.clone()
        })
    );
    assert_eq!(h.file_len(&final_name), Some(100));
    assert_eq!(h.file_len(&format!("{}_temp.jpg", created.id)), None);
}

#[tokio::test]
async fn test_chunked_upload_completes_on_last_chunk() {
    let h = harness();
    let id = h
        .create(100, Some(&filename_metadata("test.jpg")), vec![1u8; 50])
        .await
        .unwrap();

    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 50);
    assert_eq!(status.state, UploadState::InProgress);
    assert_eq!(status.url, format!("{id}_temp.jpg"));
    assert_eq!(h.file_len(&status.url), Some(50));

    let appended = h
        .engine
        .append_chunk(AppendChunk {
            upload_id: id.clone(),
            upload_offset: 50,
            content_length: 50,
            body: Bytes::from(vec![2u8; 50]),
        })
        .await
        .unwrap();
    assert_eq!(appended.offset, 100);
    assert_eq!(appended.state, UploadState::Complete);

    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, appended.offset);
    assert_eq!(status.url, format!("{id}_test.jpg"));
    assert_eq!(h.file_len(&format!("{id}_temp.jpg")), None);

    let bytes = std::fs::read(h.root.join(&status.url)).unwrap();
    assert_eq!(&bytes[..50], &[1u8; 50][..]);
    assert_eq!(&bytes[50..], &[2u8; 50][..]);
}

#[tokio::test]
async fn test_stale_offset_is_rejected() {
    let h = harness();
    let id = h.create(100, None, vec![0u8; 50]).await.unwrap();

    let err = h.append(&id, 40, vec![0u8; 10]).await.unwrap_err();
    match err {
        UploadError::OffsetMismatch { expected, received } => {
            assert_eq!(expected, 50);
            assert_eq!(received, 40);
        }
        other => panic!("expected OffsetMismatch, got {other:?}"),
    }

    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 50);
    assert_eq!(h.file_len(&status.url), Some(50));
}

#[tokio::test]
async fn test_delete_complete_and_in_progress() {
    let h = harness();
    let meta = filename_metadata("done.png");
    let complete = h.create(10, Some(&meta), vec![0u8; 10]).await.unwrap();
    let partial = h.create(10, Some(&meta), vec![0u8; 4]).await.unwrap();

    let complete_key = final_key(&complete, "done.png");
    let partial_key = temp_key(&partial, "done.png");
    assert_eq!(partial_key, format!("{partial}_temp.png"));
    assert!(h.file_len(&complete_key).is_some());
    assert!(h.file_len(&partial_key).is_some());

    h.engine.delete(&complete).await.unwrap();
    assert!(h.file_len(&complete_key).is_none());
    assert!(h.db.get_upload(&complete).unwrap().is_none());

    h.engine.delete(&partial).await.unwrap();
    assert!(h.file_len(&partial_key).is_none());
    assert!(h.db.get_upload(&partial).unwrap().is_none());
    assert_eq!(h.file_count(), 0);

    assert!(matches!(
        h.engine.delete(&partial).await,
        Err(UploadError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_missing_or_garbled_metadata_uses_generated_name() {
    let h = harness();
    for metadata in [None, Some("filename %%%"), Some("no-pairs-here")] {
        let id = h.create(3, metadata, b"abc".to_vec()).await.unwrap();
        let record = h.db.get_upload(&id).unwrap().unwrap();
        assert_eq!(record.filename, format!("photo_{}.jpg", &id[..8]));
        assert_eq!(record.url, format!("{id}_photo_{}.jpg", &id[..8]));
        assert!(h.file_len(&record.url).is_some());
    }
}

#[tokio::test]
async fn test_create_length_mismatch_creates_nothing() {
    let h = harness();
    let err = h
        .engine
        .create(CreateUpload {
            upload_length: 10,
            upload_metadata: None,
            content_length: 8,
            body: Bytes::from_static(b"12345"),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UploadError::LengthMismatch {
            declared: 8,
            actual: 5
        }
    ));
    assert!(h.db.get_all_uploads().unwrap().is_empty());
    assert_eq!(h.file_count(), 0);
}

#[tokio::test]
async fn test_append_length_mismatch_writes_nothing() {
    let h = harness();
    let id = h.create(10, None, vec![0u8; 4]).await.unwrap();

    let err = h
        .engine
        .append_chunk(AppendChunk {
            upload_id: id.clone(),
            upload_offset: 4,
            content_length: 6,
            body: Bytes::from_static(b"123"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::LengthMismatch { .. }));

    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 4);
    assert_eq!(h.file_len(&status.url), Some(4));
}

#[tokio::test]
async fn test_unknown_upload_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.engine.status("missing").await,
        Err(UploadError::NotFound(_))
    ));
    assert!(matches!(
        h.append("missing", 0, vec![1]).await,
        Err(UploadError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.delete("missing").await,
        Err(UploadError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_offset_cannot_pass_size() {
    let h = harness();

    let err = h.create(4, None, vec![0u8; 5]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::SizeExceeded {
            limit: 4,
            attempted: 5
        }
    ));

    let err = h.create(5000, None, vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::SizeExceeded {
            limit: 1000,
            attempted: 5000
        }
    ));

    let id = h.create(10, None, vec![0u8; 8]).await.unwrap();
    let err = h.append(&id, 8, vec![0u8; 3]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::SizeExceeded {
            limit: 10,
            attempted: 11
        }
    ));
    assert_eq!(h.engine.status(&id).await.unwrap().offset, 8);
    assert_eq!(h.file_count(), 1);
}

#[tokio::test]
async fn test_offset_matches_file_length_after_every_chunk() {
    let h = harness();
    let id = h.create(30, None, vec![]).await.unwrap();
    assert_eq!(h.engine.status(&id).await.unwrap().state, UploadState::Pending);

    let mut offset = 0;
    for chunk in [7usize, 11, 5, 7] {
        offset = h.append(&id, offset, vec![9u8; chunk]).await.unwrap();
        let status = h.engine.status(&id).await.unwrap();
        assert_eq!(status.offset, offset);
        assert_eq!(h.file_len(&status.url), Some(offset));
        assert!(status.offset <= status.size);
    }
    assert_eq!(offset, 30);
    assert_eq!(h.engine.status(&id).await.unwrap().state, UploadState::Complete);
}

#[tokio::test]
async fn test_empty_chunk_is_a_noop() {
    let h = harness();
    let id = h.create(10, None, vec![0u8; 3]).await.unwrap();

    assert_eq!(h.append(&id, 3, vec![]).await.unwrap(), 3);
    assert_eq!(h.engine.status(&id).await.unwrap().offset, 3);
}

#[tokio::test]
async fn test_zero_length_upload_completes_immediately() {
    let h = harness();
    let id = h.create(0, None, vec![]).await.unwrap();
    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.state, UploadState::Complete);
    assert_eq!(h.file_len(&status.url), Some(0));
}

#[tokio::test]
async fn test_concurrent_chunks_at_same_offset() {
    let h = harness();
    let id = h.create(100, None, vec![0u8; 50]).await.unwrap();

    let first = {
        let engine = Arc::clone(&h.engine);
        let id = id.clone();
        tokio::spawn(async move {
            engine
                .append_chunk(AppendChunk {
                    upload_id: id,
                    upload_offset: 50,
                    content_length: 25,
                    body: Bytes::from(vec![1u8; 25]),
                })
                .await
        })
    };
    let second = {
        let engine = Arc::clone(&h.engine);
        let id = id.clone();
        tokio::spawn(async move {
            engine
                .append_chunk(AppendChunk {
                    upload_id: id,
                    upload_offset: 50,
                    content_length: 25,
                    body: Bytes::from(vec![2u8; 25]),
                })
                .await
        })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(UploadError::OffsetMismatch {
            expected: 75,
            received: 50
        })
    )));

    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 75);
    assert_eq!(h.file_len(&status.url), Some(75));
}

#[tokio::test]
async fn test_rename_failure_leaves_complete_record_at_temp_key() {
    let h = harness();
    let id = h
        .create(10, Some(&filename_metadata("pic.jpg")), vec![0u8; 6])
        .await
        .unwrap();
    h.faults.fail_rename.store(true, Ordering::SeqCst);

    let appended = h
        .engine
        .append_chunk(AppendChunk {
            upload_id: id.clone(),
            upload_offset: 6,
            content_length: 4,
            body: Bytes::from(vec![0u8; 4]),
        })
        .await
        .unwrap();
    assert_eq!(appended.offset, 10);
    assert_eq!(appended.state, UploadState::Complete);
    let temp = format!("{id}_temp.jpg");
    match appended.finalization {
        Some(Finalization::RenameFailed { ref url, .. }) => assert_eq!(url, &temp),
        ref other => panic!("expected RenameFailed, got {other:?}"),
    }

    let record = h.db.get_upload(&id).unwrap().unwrap();
    assert!(record.is_complete());
    assert_eq!(record.url, temp);
    assert_eq!(h.file_len(&temp), Some(10));

    // Deleting still removes the bytes where they actually live
    h.engine.delete(&id).await.unwrap();
    assert_eq!(h.file_len(&temp), None);
}

#[tokio::test]
async fn test_rename_failure_on_create_shortcut() {
    let h = harness();
    h.faults.fail_rename.store(true, Ordering::SeqCst);

    let created = h
        .engine
        .create(CreateUpload {
            upload_length: 3,
            upload_metadata: None,
            content_length: 3,
            body: Bytes::from_static(b"abc"),
        })
        .await
        .unwrap();
    assert_eq!(created.state, UploadState::Complete);
    assert!(matches!(
        created.finalization,
        Some(Finalization::RenameFailed { .. })
    ));
    let record = h.db.get_upload(&created.id).unwrap().unwrap();
    assert_eq!(record.url, format!("{}_temp.jpg", created.id));
}

#[tokio::test]
async fn test_failed_initial_write_creates_no_record() {
    let h = harness();
    h.faults.fail_write.store(true, Ordering::SeqCst);

    let err = h.create(10, None, vec![0u8; 5]).await.unwrap_err();
    assert!(matches!(err, UploadError::StorageWriteFailed(_)));
    assert!(h.db.get_all_uploads().unwrap().is_empty());
}

#[tokio::test]
async fn test_truncated_initial_write_is_detected() {
    let h = harness();
    h.faults.short_write.store(true, Ordering::SeqCst);

    let err = h.create(10, None, vec![0u8; 8]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::SizeVerificationFailed {
            expected: 8,
            actual: 4
        }
    ));
    assert!(h.db.get_all_uploads().unwrap().is_empty());
    assert_eq!(h.file_count(), 0);
}

#[tokio::test]
async fn test_truncated_append_is_rolled_back() {
    let h = harness();
    let id = h.create(20, None, vec![0u8; 4]).await.unwrap();
    h.faults.short_append.store(true, Ordering::SeqCst);

    let err = h.append(&id, 4, vec![0u8; 8]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::SizeVerificationFailed {
            expected: 12,
            actual: 8
        }
    ));
    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 4);
    assert_eq!(h.file_len(&status.url), Some(4));

    h.faults.short_append.store(false, Ordering::SeqCst);
    assert_eq!(h.append(&id, 4, vec![1u8; 8]).await.unwrap(), 12);
    assert_eq!(h.file_len(&status.url), Some(12));
}

#[tokio::test]
async fn test_failed_record_update_can_be_retried() {
    let h = harness();
    let id = h.create(20, None, vec![0u8; 4]).await.unwrap();
    h.faults.fail_next_update.store(true, Ordering::SeqCst);

    let err = h.append(&id, 4, vec![1u8; 3]).await.unwrap_err();
    assert!(matches!(err, UploadError::Record(_)));
    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 4);
    assert_eq!(h.file_len(&status.url), Some(4));

    assert_eq!(h.append(&id, 4, vec![1u8; 3]).await.unwrap(), 7);
    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.offset, 7);
    assert_eq!(h.file_len(&status.url), Some(7));
}

#[tokio::test]
async fn test_failed_update_on_last_chunk_restores_temp_key() {
    let h = harness();
    let id = h
        .create(10, Some(&filename_metadata("pic.jpg")), vec![0u8; 6])
        .await
        .unwrap();
    h.faults.fail_next_update.store(true, Ordering::SeqCst);

    let err = h.append(&id, 6, vec![0u8; 4]).await.unwrap_err();
    assert!(matches!(err, UploadError::Record(_)));
    let temp = format!("{id}_temp.jpg");
    assert_eq!(h.file_len(&temp), Some(6));
    assert_eq!(h.file_len(&format!("{id}_pic.jpg")), None);

    assert_eq!(h.append(&id, 6, vec![0u8; 4]).await.unwrap(), 10);
    let status = h.engine.status(&id).await.unwrap();
    assert_eq!(status.state, UploadState::Complete);
    assert_eq!(status.url, format!("{id}_pic.jpg"));
    assert_eq!(h.file_len(&status.url), Some(10));
}

#[tokio::test]
async fn test_bytes_past_recorded_offset_are_dropped() {
    let h = harness();
    let id = h.create(20, None, vec![0u8; 4]).await.unwrap();
    let url = h.engine.status(&id).await.unwrap().url;

    // Simulate a crash between the append and the record update
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(h.root.join(&url))
            .unwrap();
        file.write_all(&[9u8; 5]).unwrap();
    }
    assert_eq!(h.file_len(&url), Some(9));

    assert_eq!(h.append(&id, 4, vec![1u8; 6]).await.unwrap(), 10);
    let bytes = std::fs::read(h.root.join(&url)).unwrap();
    assert_eq!(bytes.len(), 10);
    assert_eq!(&bytes[..4], &[0u8; 4][..]);
    assert_eq!(&bytes[4..], &[1u8; 6][..]);
}

#[tokio::test]
async fn test_interior_dots_reach_final_key() {
    let h = harness();
    let created = h
        .engine
        .create(CreateUpload {
            upload_length: 4,
            upload_metadata: Some(filename_metadata("summer..trip.jpg")),
            content_length: 4,
            body: Bytes::from_static(b"abcd"),
        })
        .await
        .unwrap();

    let final_name = format!("{}_summer..trip.jpg", created.id);
    assert_eq!(
        created.finalization,
        Some(Finalization::Renamed {
            url: final_name.clone()
        })
    );
    assert_eq!(h.engine.status(&created.id).await.unwrap().url, final_name);
    assert_eq!(h.file_len(&final_name), Some(4));
}

#[tokio::test]
async fn test_delete_survives_blob_failure() {
    let h = harness();
    let id = h.create(10, None, vec![0u8; 10]).await.unwrap();
    h.faults.fail_delete.store(true, Ordering::SeqCst);

    h.engine.delete(&id).await.unwrap();
    assert!(h.db.get_upload(&id).unwrap().is_none());
    // The orphaned file is left behind
    assert_eq!(h.file_count(), 1);
}
