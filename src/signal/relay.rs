use serde_json::Value;
use tracing::{debug, warn};

use super::envelope::Envelope;
use crate::error::{RelayError, Result};
use crate::store::{RemoteStore, paths};

/// Bounded ring buffers of envelopes kept as JSON arrays in the store,
/// plus the per-job cancel markers under `commands/`.
#[derive(Debug, Clone)]
pub struct SignalRelay {
    capacity: usize,
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

impl SignalRelay {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// Append to the ring at `path`, dropping the oldest entries past capacity.
    ///
    /// Read-then-write: two concurrent appenders can lose an entry.
    pub async fn append(&self, store: &impl RemoteStore, path: &str, envelope: Envelope) -> Result<()> {
        let mut ring = match self.read(store, path).await {
            Ok(ring) => ring,
            Err(RelayError::Parse { .. }) => {
                warn!(path, "signal ring is corrupt, starting a fresh one");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        ring.push(envelope);
        if ring.len() > self.capacity {
            let excess = ring.len() - self.capacity;
            ring.drain(..excess);
        }
        let bytes = serde_json::to_vec_pretty(&ring)?;
        store.put(path, bytes).await?;
        Ok(())
    }

    /// Entries that do not parse as envelopes are dropped with a warning; the
    /// ring lives on an untrusted medium.
    pub async fn read(&self, store: &impl RemoteStore, path: &str) -> Result<Vec<Envelope>> {
        let Some(bytes) = store.get(path).await? else {
            return Ok(Vec::new());
        };
        let raw: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| RelayError::parse(path, e))?;
        let total = raw.len();
        let envelopes: Vec<Envelope> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        if envelopes.len() != total {
            warn!(path, dropped = total - envelopes.len(), "skipped malformed envelopes");
        }
        Ok(envelopes)
    }

    pub async fn emit_outbound(&self, store: &impl RemoteStore, envelope: Envelope) -> Result<()> {
        self.append(store, paths::OUTBOUND_SIGNALS, envelope).await
    }

    pub async fn emit_inbound(&self, store: &impl RemoteStore, envelope: Envelope) -> Result<()> {
        self.append(store, paths::INBOUND_SIGNALS, envelope).await
    }

    pub async fn outbound(&self, store: &impl RemoteStore) -> Result<Vec<Envelope>> {
        self.read(store, paths::OUTBOUND_SIGNALS).await
    }

    pub async fn inbound(&self, store: &impl RemoteStore) -> Result<Vec<Envelope>> {
        self.read(store, paths::INBOUND_SIGNALS).await
    }

    pub async fn place_cancel_marker(
        &self,
        store: &impl RemoteStore,
        job_id: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(envelope)?;
        store.put(&paths::cancel_marker(job_id), bytes).await?;
        Ok(())
    }

    /// Read and remove the cancel marker for `job_id`.
    ///
    /// A marker that does not parse is removed too and reported as absent.
    pub async fn take_cancel_marker(
        &self,
        store: &impl RemoteStore,
        job_id: &str,
    ) -> Result<Option<Envelope>> {
        let path = paths::cancel_marker(job_id);
        let Some(bytes) = store.get(&path).await? else {
            return Ok(None);
        };
        store.delete(&path).await?;
        match serde_json::from_slice::<Envelope>(&bytes) {
            Ok(envelope) => {
                debug!(job_id, "consumed cancel marker");
                Ok(Some(envelope))
            }
            Err(e) => {
                warn!(job_id, error = %e, "discarded malformed cancel marker");
                Ok(None)
            }
        }
    }
}
