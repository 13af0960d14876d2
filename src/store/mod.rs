//! Remote object store used as the relay medium between initiator and executor.
//!
//! The [`RemoteStore`] trait is the whole contract: put/get/list/delete of named
//! byte blobs, with no atomicity across calls. [`paths`] fixes the object layout
//! both agents agree on.

pub mod error;
pub mod fs;
pub mod http;
pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

pub use error::StoreError;
pub use fs::FsStore;
pub use http::HttpStore;
pub use memory::MemoryStore;

/// One entry of a `list` result. `name` is the full object path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Entries whose name starts with `prefix`, in the store's own order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete(&self, path: &str) -> Result<bool, StoreError>;
}

impl<S: RemoteStore> RemoteStore for Arc<S> {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        (**self).put(path, bytes).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        (**self).list(prefix).await
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        (**self).delete(path).await
    }
}

/// The backend picked by configuration at runtime.
pub enum ConfiguredStore {
    Http(HttpStore),
    Fs(FsStore),
    Memory(MemoryStore),
}

impl RemoteStore for ConfiguredStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        match self {
            ConfiguredStore::Http(s) => s.put(path, bytes).await,
            ConfiguredStore::Fs(s) => s.put(path, bytes).await,
            ConfiguredStore::Memory(s) => s.put(path, bytes).await,
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            ConfiguredStore::Http(s) => s.get(path).await,
            ConfiguredStore::Fs(s) => s.get(path).await,
            ConfiguredStore::Memory(s) => s.get(path).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        match self {
            ConfiguredStore::Http(s) => s.list(prefix).await,
            ConfiguredStore::Fs(s) => s.list(prefix).await,
            ConfiguredStore::Memory(s) => s.list(prefix).await,
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        match self {
            ConfiguredStore::Http(s) => s.delete(path).await,
            ConfiguredStore::Fs(s) => s.delete(path).await,
            ConfiguredStore::Memory(s) => s.delete(path).await,
        }
    }
}

/// Rejects absolute paths and parent-directory segments.
pub fn validate_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg == ".." || seg == ".")
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Fetch and deserialize a JSON object. Malformed content is a [`RelayError::Parse`].
pub async fn read_json<T: DeserializeOwned>(
    store: &impl RemoteStore,
    path: &str,
) -> Result<Option<T>> {
    match store.get(path).await? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RelayError::parse(path, e)),
    }
}

pub async fn write_json<T: Serialize>(store: &impl RemoteStore, path: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(path, bytes).await?;
    Ok(())
}

/// Object layout under the job namespace.
pub mod paths {
    use chrono::NaiveDate;

    pub const PENDING_PREFIX: &str = "pending/";
    pub const JOBS_PREFIX: &str = "jobs/";
    pub const COMMANDS_PREFIX: &str = "commands/";
    pub const OUTBOUND_SIGNALS: &str = "signals/outbound.json";
    pub const INBOUND_SIGNALS: &str = "signals/inbound.json";

    pub fn pending(job_id: &str) -> String {
        format!("{PENDING_PREFIX}{job_id}.json")
    }

    pub fn manifest(job_id: &str) -> String {
        format!("{JOBS_PREFIX}{job_id}/manifest.json")
    }

    pub fn status(job_id: &str) -> String {
        format!("status/{job_id}.json")
    }

    pub fn completed(job_id: &str) -> String {
        format!("completed/{job_id}.json")
    }

    pub fn archive(date: NaiveDate, job_id: &str) -> String {
        format!("archive/{}/{job_id}.json", date.format("%Y-%m-%d"))
    }

    pub fn cancel_marker(job_id: &str) -> String {
        format!("{COMMANDS_PREFIX}{job_id}-cancel.json")
    }

    /// `pending/<id>.json` -> `<id>`
    pub fn job_id_from_pending(name: &str) -> Option<&str> {
        name.strip_prefix(PENDING_PREFIX)?.strip_suffix(".json")
    }

    pub fn is_manifest(name: &str) -> bool {
        name.starts_with(JOBS_PREFIX) && name.ends_with("/manifest.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(paths::pending("j1"), "pending/j1.json");
        assert_eq!(paths::manifest("j1"), "jobs/j1/manifest.json");
        assert_eq!(paths::status("j1"), "status/j1.json");
        assert_eq!(paths::completed("j1"), "completed/j1.json");
        assert_eq!(paths::archive(date, "j1"), "archive/2026-03-07/j1.json");
        assert_eq!(paths::cancel_marker("j1"), "commands/j1-cancel.json");
        assert_eq!(paths::job_id_from_pending("pending/j1.json"), Some("j1"));
        assert_eq!(paths::job_id_from_pending("status/j1.json"), None);
        assert!(paths::is_manifest("jobs/j1/manifest.json"));
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("pending/j1.json").is_ok());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("jobs/../../x").is_err());
        assert!(validate_path("").is_err());
    }

    #[tokio::test]
    async fn read_json_reports_parse_errors_with_path() {
        let store = MemoryStore::new();
        store.put("pending/bad.json", b"{not json".to_vec()).await.unwrap();

        let err = read_json::<serde_json::Value>(&store, "pending/bad.json")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Parse { ref path, .. } if path == "pending/bad.json"));

        let missing = read_json::<serde_json::Value>(&store, "pending/none.json")
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
