//! The submitting side of the relay.
//!
//! The initiator never talks to the executor directly: it writes manifests and
//! descriptors, drops cancel requests into the store, and reads back status,
//! audit history and the executor's outbound signals.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::manifest::{
    AuditEntry, BurnState, CompletionRecord, DiscSettings, FileRef, JobDescriptor, Manifest,
    Priority, StateMachine, StatusSnapshot,
};
use crate::scheduler::{load_pending, order_by_priority};
use crate::signal::{Direction, Envelope, SecurityGateway, SignalPayload, SignalRelay, codec};
use crate::store::{RemoteStore, paths, read_json, write_json};

/// Everything needed to submit a job.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub files: Vec<FileRef>,
    pub priority: Priority,
    pub targets: Vec<String>,
    pub disc_settings: DiscSettings,
}

impl JobRequest {
    pub fn new(files: Vec<FileRef>, priority: Priority) -> Self {
        Self {
            files,
            priority,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not been picked up and is now `cancelled`.
    Cancelled,
    /// The executor owns the job; a cancel request was delivered.
    Requested,
}

/// An audit entry tagged with the job it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct JobAuditEntry {
    pub job_id: String,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

pub struct Initiator<S> {
    store: S,
    agent_id: String,
    relay: SignalRelay,
    gateway: SecurityGateway,
    seen: HashSet<String>,
}

impl<S: RemoteStore> Initiator<S> {
    pub fn new(store: S, agent_id: impl Into<String>, relay: SignalRelay, gateway: SecurityGateway) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
            relay,
            gateway,
            seen: HashSet::new(),
        }
    }

    pub async fn submit_job(&self, files: Vec<FileRef>, priority: Priority) -> Result<String> {
        self.submit(JobRequest::new(files, priority)).await
    }

    /// Create the manifest in `pending` and publish its descriptor. Returns the job id.
    pub async fn submit(&self, request: JobRequest) -> Result<String> {
        if request.files.is_empty() {
            return Err(RelayError::InvalidJob("a job needs at least one file".into()));
        }
        if let Some(bad) = request.files.iter().find(|f| f.path.trim().is_empty()) {
            return Err(RelayError::InvalidJob(format!("empty file path: {bad:?}")));
        }

        let mut manifest = Manifest::new(request.files, request.priority, &self.agent_id);
        manifest.targets = request.targets;
        manifest.disc_settings = request.disc_settings;
        StateMachine::transition(&mut manifest, BurnState::Pending, &self.agent_id, Some("submitted"))?;

        // Manifest before descriptor: the executor discovers jobs via `pending/`.
        write_json(&self.store, &paths::manifest(&manifest.id), &manifest).await?;
        write_json(&self.store, &paths::pending(&manifest.id), &manifest.descriptor()).await?;
        let snapshot = StatusSnapshot::of(&manifest, 0, Some("submitted".to_string()));
        write_json(&self.store, &paths::status(&manifest.id), &snapshot).await?;

        info!(
            job_id = %manifest.id,
            priority = %manifest.priority,
            files = manifest.files.len(),
            "job submitted"
        );
        Ok(manifest.id)
    }

    /// Cancel directly if the executor has not picked the job up, otherwise ask it to.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut manifest = self.manifest(job_id).await?;
        let state = manifest.current_state;
        if !state.can_transition_to(BurnState::Cancelled) {
            return Err(RelayError::InvalidTransition {
                from: state,
                to: BurnState::Cancelled,
            });
        }

        if state.is_active() {
            let envelope = codec::encode(
                SignalPayload::cancel(job_id),
                Direction::Inbound,
                Some(&self.agent_id),
            )?;
            self.relay.place_cancel_marker(&self.store, job_id, &envelope).await?;
            self.relay.emit_inbound(&self.store, envelope).await?;
            info!(job_id, state = %state, "cancel requested from executor");
            return Ok(CancelOutcome::Requested);
        }

        let reason = format!("cancelled by {}", self.agent_id);
        StateMachine::transition(&mut manifest, BurnState::Cancelled, &self.agent_id, Some(&reason))?;
        write_json(&self.store, &paths::manifest(job_id), &manifest).await?;
        self.store.delete(&paths::pending(job_id)).await?;
        let snapshot = StatusSnapshot::of(&manifest, 0, Some(reason));
        write_json(&self.store, &paths::status(job_id), &snapshot).await?;
        info!(job_id, "job cancelled before pickup");
        Ok(CancelOutcome::Cancelled)
    }

    /// Latest status snapshot, or one derived from the manifest if none was written.
    pub async fn get_job_status(&self, job_id: &str) -> Result<StatusSnapshot> {
        if let Some(snapshot) = read_json::<StatusSnapshot>(&self.store, &paths::status(job_id)).await? {
            return Ok(snapshot);
        }
        let manifest = self.manifest(job_id).await?;
        Ok(StatusSnapshot::of(&manifest, 0, None))
    }

    pub async fn manifest(&self, job_id: &str) -> Result<Manifest> {
        read_json::<Manifest>(&self.store, &paths::manifest(job_id))
            .await?
            .ok_or_else(|| RelayError::JobNotFound(job_id.to_string()))
    }

    pub async fn completion(&self, job_id: &str) -> Result<Option<CompletionRecord>> {
        read_json(&self.store, &paths::completed(job_id)).await
    }

    /// Descriptors in `pending/`, in the order the executor would consider them.
    pub async fn list_pending(&self) -> Result<Vec<JobDescriptor>> {
        Ok(order_by_priority(load_pending(&self.store).await?))
    }

    /// Audit entries across all jobs, newest first.
    pub async fn get_audit_log(&self, limit: usize) -> Result<Vec<JobAuditEntry>> {
        let entries = self.store.list(paths::JOBS_PREFIX).await?;
        let mut log = Vec::new();
        for entry in entries.iter().filter(|e| paths::is_manifest(&e.name)) {
            match read_json::<Manifest>(&self.store, &entry.name).await {
                Ok(Some(manifest)) => log.extend(manifest.audit_log.into_iter().map(|e| JobAuditEntry {
                    job_id: manifest.id.clone(),
                    entry: e,
                })),
                Ok(None) => {}
                Err(e @ RelayError::Parse { .. }) => warn!(error = %e, "skipping unreadable manifest"),
                Err(e) => return Err(e),
            }
        }
        log.sort_by(|a, b| b.entry.at.cmp(&a.entry.at));
        log.truncate(limit);
        Ok(log)
    }

    /// Revive a failed or cancelled job with a fresh retry budget.
    pub async fn resubmit_job(&self, job_id: &str) -> Result<()> {
        let mut manifest = self.manifest(job_id).await?;
        let previous = manifest.retry_count;
        StateMachine::transition(
            &mut manifest,
            BurnState::Pending,
            &self.agent_id,
            Some("manual resubmission"),
        )?;
        manifest.retry_count = 0;
        manifest.not_before = None;
        manifest.record_action(
            &self.agent_id,
            "resubmitted",
            Some(format!("retry budget reset after {previous} retries")),
        );

        write_json(&self.store, &paths::manifest(job_id), &manifest).await?;
        write_json(&self.store, &paths::pending(job_id), &manifest.descriptor()).await?;
        // The archive copy stays as history; only the live terminal record goes.
        self.store.delete(&paths::completed(job_id)).await?;
        let snapshot = StatusSnapshot::of(&manifest, 0, Some("resubmitted".to_string()));
        write_json(&self.store, &paths::status(job_id), &snapshot).await?;
        info!(job_id, previous_retries = previous, "job resubmitted");
        Ok(())
    }

    /// Outbound envelopes not seen before that pass the gateway, oldest first.
    pub async fn recent_signals(&mut self) -> Result<Vec<Envelope>> {
        let ring = self.relay.outbound(&self.store).await?;
        let mut fresh = Vec::new();
        for envelope in ring {
            if !self.seen.insert(envelope.nonce.clone()) {
                continue;
            }
            if envelope.direction != Direction::Outbound {
                debug!(nonce = %envelope.nonce, "ignoring envelope with wrong direction");
                continue;
            }
            if self.gateway.evaluate(&envelope).allowed {
                fresh.push(envelope);
            }
        }
        Ok(fresh)
    }
}
