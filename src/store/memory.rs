use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::{ObjectEntry, RemoteStore, validate_path};

struct StoredObject {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-process store for tests and the offline demo.
///
/// [`set_unavailable`](MemoryStore::set_unavailable) simulates an outage: every
/// call fails with [`StoreError::Unavailable`] until it is cleared.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every object path currently held, in key order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn check(&self, path: Option<&str>) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        if let Some(path) = path {
            validate_path(path)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        // A poisoned map is still a consistent map: every mutation is a single insert/remove.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RemoteStore for MemoryStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.check(Some(path))?;
        self.lock().insert(
            path.to_string(),
            StoredObject {
                bytes,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(Some(path))?;
        Ok(self.lock().get(path).map(|o| o.bytes.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        self.check(None)?;
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, obj)| ObjectEntry {
                name: name.clone(),
                size: obj.bytes.len() as u64,
                modified: Some(obj.modified),
            })
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        self.check(Some(path))?;
        Ok(self.lock().remove(path).is_some())
    }
}
