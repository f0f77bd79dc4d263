//! In-memory per-upload locks that serialize chunk writes for one identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{self, error::Elapsed};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Manages asynchronous mutexes keyed by upload id.
///
/// Entries live only while someone holds or waits on them; the last
/// [`UploadLock`] to drop removes its entry.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Arc<StdMutex<LockMap>>,
}

/// Held lock for one upload id.
#[derive(Debug)]
pub struct UploadLock {
    guard: Option<OwnedMutexGuard<()>>,
    upload_id: String,
    locks: Arc<StdMutex<LockMap>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `upload_id`, waiting at most `timeout`.
    pub async fn lock_with_timeout(
        &self,
        upload_id: &str,
        timeout: Duration,
    ) -> Result<UploadLock, Elapsed> {
        let lock = {
            let mut locks = lock_map(&self.locks);
            locks
                .entry(upload_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        match time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(UploadLock {
                guard: Some(guard),
                upload_id: upload_id.to_string(),
                locks: Arc::clone(&self.locks),
            }),
            Err(elapsed) => {
                prune(&self.locks, upload_id);
                Err(elapsed)
            }
        }
    }

    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        // Release first so the strong count reflects only waiters
        self.guard.take();
        prune(&self.locks, &self.upload_id);
    }
}

fn lock_map(locks: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the entry for `upload_id` when the map holds the only reference.
fn prune(locks: &StdMutex<LockMap>, upload_id: &str) {
    let mut map = lock_map(locks);
    if map
        .get(upload_id)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        map.remove(upload_id);
    }
}
