use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::device::BurnDevice;
use crate::error::{RelayError, Result};
use crate::manifest::{
    BurnState, CompletionRecord, JobDescriptor, Manifest, RetryConfig, StateMachine,
    StatusSnapshot,
};
use crate::signal::{Direction, SecurityGateway, SignalPayload, SignalRelay, codec};
use crate::store::{RemoteStore, paths, read_json, validate_path, write_json};

const SEEN_NONCE_CAPACITY: usize = 4096;

/// Executor parameters. Built from [`RelayConfig`](crate::config::RelayConfig)
/// or directly in tests.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub agent_id: String,
    pub poll_interval: Duration,
    /// Wait between burn slices.
    pub phase_delay: Duration,
    pub burn_steps: u32,
    pub retry: RetryConfig,
    pub ring_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_id: "burn-executor".to_string(),
            poll_interval: Duration::from_secs(5),
            phase_delay: Duration::from_secs(1),
            burn_steps: 4,
            retry: RetryConfig::default(),
            ring_capacity: 50,
        }
    }
}

/// What a single poll tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing eligible in `pending/`.
    Idle,
    /// The store could not be read or written; nothing changed.
    Skipped(String),
    /// One job was handled and left in `state`.
    Processed { job_id: String, state: BurnState },
}

/// Cooperative stop switch for [`Executor::run`].
#[derive(Debug, Clone)]
pub struct ExecutorHandle(Arc<AtomicBool>);

impl ExecutorHandle {
    /// The loop exits at its next safe point; an active job is drained first.
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum RunEnd {
    Completed,
    Cancelled,
}

/// Read every descriptor under `pending/`.
///
/// Malformed descriptors, and descriptors whose id does not match their
/// object name, are logged and skipped; store failures abort the read.
pub async fn load_pending(store: &impl RemoteStore) -> Result<Vec<JobDescriptor>> {
    let entries = store.list(paths::PENDING_PREFIX).await?;
    let mut descriptors = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(name_id) = paths::job_id_from_pending(&entry.name) else {
            continue;
        };
        match read_json::<JobDescriptor>(store, &entry.name).await {
            Ok(Some(desc)) => match descriptor_problem(name_id, &desc) {
                None => descriptors.push(desc),
                Some(problem) => {
                    warn!(path = %entry.name, id = %desc.id, problem, "skipping job descriptor")
                }
            },
            Ok(None) => debug!(path = %entry.name, "descriptor vanished after listing"),
            Err(e @ RelayError::Parse { .. }) => {
                warn!(error = %e, "skipping malformed job descriptor")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(descriptors)
}

/// Every object path of a job is derived from its id, so the id must be the
/// descriptor's own name and a single path segment.
fn descriptor_problem(name_id: &str, desc: &JobDescriptor) -> Option<&'static str> {
    if desc.id != name_id {
        return Some("id does not match object name");
    }
    if desc.id.is_empty() || desc.id.contains('/') || validate_path(&paths::manifest(&desc.id)).is_err() {
        return Some("id is not a usable path segment");
    }
    None
}

/// Stable sort by priority: equal priorities keep the store's order.
pub fn order_by_priority(mut descriptors: Vec<JobDescriptor>) -> Vec<JobDescriptor> {
    descriptors.sort_by_key(|d| d.priority);
    descriptors
}

/// The highest-priority descriptor eligible at `now`.
pub fn select_next(
    descriptors: Vec<JobDescriptor>,
    now: DateTime<Utc>,
    retry: &RetryConfig,
) -> Option<JobDescriptor> {
    order_by_priority(descriptors).into_iter().find(|d| {
        if retry.is_exhausted(d.retry_count) {
            debug!(job_id = %d.id, retries = d.retry_count, "descriptor over retry budget, ignoring");
        }
        d.is_eligible(now, retry)
    })
}

/// Polls the store and drives one job at a time through the burn lifecycle.
pub struct Executor<S, D> {
    store: S,
    device: D,
    gateway: SecurityGateway,
    relay: SignalRelay,
    config: ExecutorConfig,
    running: Arc<AtomicBool>,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
    /// Accepted cancels whose cleanup has not been stored yet, by job id.
    unfinished_cancels: HashMap<String, String>,
}

impl<S: RemoteStore, D: BurnDevice> Executor<S, D> {
    pub fn new(store: S, device: D, gateway: SecurityGateway, config: ExecutorConfig) -> Self {
        let relay = SignalRelay::new(config.ring_capacity);
        Self {
            store,
            device,
            gateway,
            relay,
            config,
            running: Arc::new(AtomicBool::new(true)),
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
            unfinished_cancels: HashMap::new(),
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle(Arc::clone(&self.running))
    }

    #[cfg(test)]
    pub fn device(&self) -> &D {
        &self.device
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Tick until stopped, sleeping `poll_interval` between ticks.
    pub async fn run(&mut self) {
        info!(
            agent = %self.config.agent_id,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "executor started"
        );
        while self.is_running() {
            match self.tick().await {
                TickOutcome::Processed { job_id, state } => {
                    info!(job_id = %job_id, state = %state, "tick finished")
                }
                TickOutcome::Skipped(reason) => debug!(reason = %reason, "tick skipped"),
                TickOutcome::Idle => debug!("tick idle"),
            }
            if !self.is_running() {
                break;
            }
            sleep(self.config.poll_interval).await;
        }
        info!(agent = %self.config.agent_id, "executor stopped");
    }

    /// One poll: pick at most one eligible job and process it to a resting state.
    pub async fn tick(&mut self) -> TickOutcome {
        let descriptors = match load_pending(&self.store).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to poll pending jobs, skipping tick");
                return TickOutcome::Skipped(e.to_string());
            }
        };
        let total = descriptors.len();
        let Some(next) = select_next(descriptors, Utc::now(), &self.config.retry) else {
            debug!(pending = total, "no eligible job");
            return TickOutcome::Idle;
        };

        let job_id = next.id.clone();
        info!(job_id = %job_id, priority = %next.priority, pending = total, "selected job");
        match self.process(next).await {
            Ok(state) => TickOutcome::Processed { job_id, state },
            Err(e) => {
                if e.is_transient() {
                    warn!(job_id = %job_id, error = %e, "store unavailable, job left for the next tick");
                } else {
                    error!(job_id = %job_id, error = %e, "job left for the next tick");
                }
                TickOutcome::Skipped(e.to_string())
            }
        }
    }

    async fn process(&mut self, desc: JobDescriptor) -> Result<BurnState> {
        let agent = self.config.agent_id.clone();
        let mut manifest = match read_json::<Manifest>(&self.store, &paths::manifest(&desc.id)).await
        {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!(job_id = %desc.id, "manifest missing, rebuilding from descriptor");
                Manifest::from_descriptor(&desc, &agent)
            }
            Err(e @ RelayError::Parse { .. }) => {
                warn!(job_id = %desc.id, error = %e, "manifest unreadable, rebuilding from descriptor");
                Manifest::from_descriptor(&desc, &agent)
            }
            Err(e) => return Err(e),
        };

        match manifest.current_state {
            BurnState::Pending | BurnState::Queued => {}
            BurnState::Created => {
                StateMachine::transition(&mut manifest, BurnState::Pending, &agent, Some("picked up"))?;
            }
            BurnState::Complete => {
                // A previous run finished but did not get to clean up.
                self.finalize(&manifest).await?;
                return Ok(BurnState::Complete);
            }
            BurnState::Cancelled => {
                info!(job_id = %manifest.id, "dropping descriptor of cancelled job");
                self.store.delete(&paths::pending(&manifest.id)).await?;
                if self.unfinished_cancels.contains_key(&manifest.id) {
                    self.acknowledge_cancel(&manifest.id).await?;
                    self.unfinished_cancels.remove(&manifest.id);
                }
                return Ok(BurnState::Cancelled);
            }
            BurnState::Failed => return self.requeue_or_archive(&mut manifest).await,
            BurnState::Downloading | BurnState::Burning | BurnState::Verifying => {
                // A cancel accepted before the interruption still wins over a retry.
                if manifest.current_state.can_transition_to(BurnState::Cancelled) {
                    let cancel = match self.unfinished_cancels.get(&manifest.id).cloned() {
                        Some(reason) => Some(reason),
                        None => self.poll_cancel(&manifest.id).await,
                    };
                    if let Some(reason) = cancel {
                        self.cancel(&mut manifest, reason).await?;
                        return Ok(BurnState::Cancelled);
                    }
                }
                let reason = format!("interrupted while {}", manifest.current_state);
                return self.fail_job(&mut manifest, &reason).await;
            }
        }

        match self.drive(&mut manifest).await {
            Ok(RunEnd::Completed) => {
                self.finish_completed(&mut manifest).await?;
                Ok(BurnState::Complete)
            }
            Ok(RunEnd::Cancelled) => Ok(BurnState::Cancelled),
            // The cancel is remembered; the next tick finishes it.
            Err(e) if manifest.current_state == BurnState::Cancelled => Err(e),
            Err(e) => self.fail_job(&mut manifest, &e.to_string()).await,
        }
    }

    async fn drive(&mut self, manifest: &mut Manifest) -> Result<RunEnd> {
        let agent = self.config.agent_id.clone();

        if manifest.current_state == BurnState::Pending {
            manifest.not_before = None;
            StateMachine::transition(manifest, BurnState::Queued, &agent, None)?;
            self.persist(manifest, 0, Some("queued".to_string())).await?;
        }

        StateMachine::transition(manifest, BurnState::Downloading, &agent, None)?;
        let staging = format!("staging {} file(s)", manifest.files.len());
        self.persist(manifest, 0, Some(staging)).await?;
        self.device.stage(manifest).await?;

        StateMachine::transition(manifest, BurnState::Burning, &agent, None)?;
        self.persist(manifest, 0, Some("burning".to_string())).await?;

        let total = self.config.burn_steps.max(1);
        for step in 1..=total {
            if !self.is_running() {
                info!(job_id = %manifest.id, step, "stop requested, draining active burn");
            }
            if let Some(reason) = self.poll_cancel(&manifest.id).await {
                self.cancel(manifest, reason).await?;
                return Ok(RunEnd::Cancelled);
            }
            self.device.burn_step(manifest, step, total).await?;
            let progress = (step * 100 / total) as u8;
            self.publish(manifest, progress, Some(format!("burned {step}/{total}")))
                .await?;
            if !self.config.phase_delay.is_zero() {
                sleep(self.config.phase_delay).await;
            }
        }

        StateMachine::transition(manifest, BurnState::Verifying, &agent, None)?;
        self.persist(manifest, 100, Some("verifying".to_string())).await?;
        if manifest.disc_settings.verify {
            self.device.verify(manifest).await?;
        } else {
            manifest.record_action(&agent, "verify_skipped", None);
        }

        StateMachine::transition(manifest, BurnState::Complete, &agent, None)?;
        Ok(RunEnd::Completed)
    }

    /// Record a failure, then requeue with backoff or archive as permanently failed.
    async fn fail_job(&mut self, manifest: &mut Manifest, reason: &str) -> Result<BurnState> {
        let state = manifest.current_state;
        if !state.can_transition_to(BurnState::Failed) {
            // Nothing reached the device yet (or the job already settled); the
            // descriptor is untouched, so the next tick resumes from the store.
            warn!(job_id = %manifest.id, state = %state, reason, "failure outside a device phase");
            return Ok(state);
        }

        let agent = self.config.agent_id.clone();
        manifest.retry_count += 1;
        StateMachine::transition(manifest, BurnState::Failed, &agent, Some(reason))?;
        error!(
            job_id = %manifest.id,
            retry = manifest.retry_count,
            max_retries = self.config.retry.max_retries,
            reason,
            "job failed"
        );
        self.persist(manifest, 0, Some(reason.to_string())).await?;
        self.requeue_or_archive(manifest).await
    }

    async fn requeue_or_archive(&mut self, manifest: &mut Manifest) -> Result<BurnState> {
        let agent = self.config.agent_id.clone();
        let retry = self.config.retry.clone();

        if retry.is_exhausted(manifest.retry_count) {
            let err = RelayError::MaxRetriesExceeded {
                job_id: manifest.id.clone(),
                retries: manifest.retry_count,
            };
            error!(job_id = %manifest.id, "{err}");
            manifest.record_action(&agent, "archived", Some(err.to_string()));
            self.finalize(manifest).await?;
            return Ok(BurnState::Failed);
        }

        let delay_ms = retry.delay_for_attempt(manifest.retry_count);
        let reason = format!(
            "retry {}/{} after {delay_ms}ms",
            manifest.retry_count, retry.max_retries
        );
        let delay = chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX / 2));
        manifest.not_before = Utc::now().checked_add_signed(delay);
        StateMachine::transition(manifest, BurnState::Pending, &agent, Some(&reason))?;
        info!(job_id = %manifest.id, delay_ms, "job requeued");

        write_json(&self.store, &paths::manifest(&manifest.id), manifest).await?;
        write_json(&self.store, &paths::pending(&manifest.id), &manifest.descriptor()).await?;
        self.publish(manifest, 0, Some(reason)).await?;
        Ok(BurnState::Pending)
    }

    /// Move the job to `cancelled` and clean up after it.
    ///
    /// The reason stays in `unfinished_cancels` until every write landed.
    async fn cancel(&mut self, manifest: &mut Manifest, reason: String) -> Result<()> {
        let agent = self.config.agent_id.clone();
        self.unfinished_cancels.insert(manifest.id.clone(), reason.clone());
        StateMachine::transition(manifest, BurnState::Cancelled, &agent, Some(&reason))?;
        manifest.record_action(&agent, "cancelled", Some(reason.clone()));
        self.persist(manifest, 0, Some(reason.clone())).await?;
        self.store.delete(&paths::pending(&manifest.id)).await?;
        self.acknowledge_cancel(&manifest.id).await?;
        self.unfinished_cancels.remove(&manifest.id);
        info!(job_id = %manifest.id, reason = %reason, "job cancelled");
        Ok(())
    }

    async fn acknowledge_cancel(&self, job_id: &str) -> Result<()> {
        self.emit(SignalPayload::Acknowledgement {
            job_id: job_id.to_string(),
            of: "cancel".to_string(),
            source: None,
        })
        .await
    }

    async fn finish_completed(&mut self, manifest: &mut Manifest) -> Result<()> {
        let agent = self.config.agent_id.clone();
        manifest.record_action(&agent, "archived", None);
        self.persist(manifest, 100, Some("complete".to_string())).await?;
        self.finalize(manifest).await?;
        info!(
            job_id = %manifest.id,
            retries = manifest.retry_count,
            requeues = manifest.retry_cycles(),
            "job complete"
        );
        Ok(())
    }

    /// Terminal record, date-partitioned archive copy, removal from `pending/`.
    async fn finalize(&self, manifest: &Manifest) -> Result<()> {
        let record = CompletionRecord::from_manifest(manifest, &self.config.retry);
        write_json(&self.store, &paths::manifest(&manifest.id), manifest).await?;
        write_json(&self.store, &paths::completed(&manifest.id), &record).await?;
        let archive = paths::archive(record.completed_at.date_naive(), &manifest.id);
        write_json(&self.store, &archive, &record).await?;
        self.store.delete(&paths::pending(&manifest.id)).await?;
        debug!(job_id = %manifest.id, archive = %archive, "archived");
        Ok(())
    }

    /// Write the manifest, then publish progress for its current state.
    async fn persist(&self, manifest: &Manifest, progress: u8, message: Option<String>) -> Result<()> {
        write_json(&self.store, &paths::manifest(&manifest.id), manifest).await?;
        if manifest.current_state.is_active() {
            write_json(&self.store, &paths::pending(&manifest.id), &manifest.descriptor()).await?;
        }
        self.publish(manifest, progress, message).await
    }

    /// Status snapshot plus the matching outbound signal.
    async fn publish(&self, manifest: &Manifest, progress: u8, message: Option<String>) -> Result<()> {
        let snapshot = StatusSnapshot::of(manifest, progress, message);
        write_json(&self.store, &paths::status(&manifest.id), &snapshot).await?;
        self.emit(SignalPayload::Status {
            job_id: snapshot.job_id,
            state: snapshot.state,
            progress: snapshot.progress,
            message: snapshot.message,
            source: None,
        })
        .await
    }

    async fn emit(&self, payload: SignalPayload) -> Result<()> {
        let envelope = codec::encode(payload, Direction::Outbound, Some(&self.config.agent_id))?;
        self.relay.emit_outbound(&self.store, envelope).await
    }

    /// A cancel check that cannot reach the store must not fail the burn.
    async fn poll_cancel(&mut self, job_id: &str) -> Option<String> {
        match self.find_cancel(job_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(job_id, error = %e, "cancel check failed");
                None
            }
        }
    }

    async fn find_cancel(&mut self, job_id: &str) -> Result<Option<String>> {
        let mut candidates = Vec::new();
        if let Some(marker) = self.relay.take_cancel_marker(&self.store, job_id).await? {
            candidates.push(marker);
        }
        candidates.extend(self.relay.inbound(&self.store).await?);

        for envelope in candidates {
            if !self.remember(&envelope.nonce) {
                continue;
            }
            if let Err(e) = self.gateway.evaluate(&envelope).into_result() {
                debug!(job_id, nonce = %envelope.nonce, error = %e, "inbound signal dropped");
                continue;
            }
            if envelope.payload.cancel_target() == Some(job_id) {
                let by = envelope.declared_source().unwrap_or("unknown");
                return Ok(Some(format!("cancel requested by {by}")));
            }
        }
        Ok(None)
    }

    /// `false` if the nonce was already processed.
    fn remember(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            debug!(nonce, "duplicate signal ignored");
            return false;
        }
        self.seen.insert(nonce.to_string());
        self.seen_order.push_back(nonce.to_string());
        if self.seen_order.len() > SEEN_NONCE_CAPACITY
            && let Some(oldest) = self.seen_order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DevicePhase, SimulatedDevice};
    use crate::initiator::{CancelOutcome, Initiator};
    use crate::manifest::{FileRef, Priority};
    use crate::signal::{Envelope, SecurityPolicy};
    use crate::store::{MemoryStore, ObjectEntry, StoreError};

    fn config(max_retries: u32) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::ZERO,
            phase_delay: Duration::ZERO,
            burn_steps: 3,
            retry: RetryConfig {
                max_retries,
                base_delay_ms: 0,
            },
            ..Default::default()
        }
    }

    fn gateway() -> SecurityGateway {
        SecurityGateway::new(SecurityPolicy::default()).unwrap()
    }

    fn initiator(store: &Arc<MemoryStore>) -> Initiator<Arc<MemoryStore>> {
        Initiator::new(Arc::clone(store), "initiator", SignalRelay::default(), gateway())
    }

    fn executor<D: BurnDevice>(
        store: &Arc<MemoryStore>,
        device: D,
        max_retries: u32,
    ) -> Executor<Arc<MemoryStore>, D> {
        Executor::new(Arc::clone(store), device, gateway(), config(max_retries))
    }

    async fn manifest_of(store: &Arc<MemoryStore>, id: &str) -> Manifest {
        read_json::<Manifest>(store, &paths::manifest(id))
            .await
            .unwrap()
            .unwrap()
    }

    fn files() -> Vec<FileRef> {
        vec![FileRef::new("photos/2026.zip")]
    }

    /// Device that asks for a cancel through the initiator halfway into the burn.
    struct CancellingDevice {
        initiator: Initiator<Arc<MemoryStore>>,
        job_id: String,
    }

    impl BurnDevice for CancellingDevice {
        async fn stage(&mut self, _manifest: &Manifest) -> Result<()> {
            Ok(())
        }

        async fn burn_step(&mut self, _manifest: &Manifest, step: u32, _total: u32) -> Result<()> {
            if step == 1 {
                let outcome = self.initiator.cancel_job(&self.job_id).await?;
                assert_eq!(outcome, CancelOutcome::Requested);
            }
            Ok(())
        }

        async fn verify(&mut self, _manifest: &Manifest) -> Result<()> {
            panic!("a cancelled job must never reach verification");
        }
    }

    /// Device that drops one envelope into the inbound ring after the first slice.
    struct InboundSignalDevice {
        store: Arc<MemoryStore>,
        envelope: Option<Envelope>,
    }

    impl InboundSignalDevice {
        fn new(store: &Arc<MemoryStore>, envelope: Envelope) -> Self {
            Self {
                store: Arc::clone(store),
                envelope: Some(envelope),
            }
        }
    }

    impl BurnDevice for InboundSignalDevice {
        async fn stage(&mut self, _manifest: &Manifest) -> Result<()> {
            Ok(())
        }

        async fn burn_step(&mut self, _manifest: &Manifest, step: u32, _total: u32) -> Result<()> {
            if step == 1
                && let Some(envelope) = self.envelope.take()
            {
                SignalRelay::default().emit_inbound(&self.store, envelope).await?;
            }
            Ok(())
        }

        async fn verify(&mut self, _manifest: &Manifest) -> Result<()> {
            Ok(())
        }
    }

    fn inbound_cancel(job_id: &str, source: &str, at: DateTime<Utc>) -> Envelope {
        codec::encode_at(SignalPayload::cancel(job_id), Direction::Inbound, Some(source), at).unwrap()
    }

    /// Memory store whose manifest writes fail while `failing` is set.
    struct ManifestOutageStore {
        inner: Arc<MemoryStore>,
        failing: Arc<AtomicBool>,
    }

    impl RemoteStore for ManifestOutageStore {
        async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) && path.starts_with("jobs/") {
                return Err(StoreError::Unavailable("manifest write refused".into()));
            }
            self.inner.put(path, bytes).await
        }

        async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, path: &str) -> Result<bool, StoreError> {
            self.inner.delete(path).await
        }
    }

    /// Requests a cancel after the first slice, then takes manifest writes offline.
    struct CancelThenOutageDevice {
        initiator: Initiator<Arc<MemoryStore>>,
        job_id: String,
        failing: Arc<AtomicBool>,
    }

    impl BurnDevice for CancelThenOutageDevice {
        async fn stage(&mut self, _manifest: &Manifest) -> Result<()> {
            Ok(())
        }

        async fn burn_step(&mut self, _manifest: &Manifest, step: u32, _total: u32) -> Result<()> {
            if step == 1 {
                self.initiator.cancel_job(&self.job_id).await?;
                self.failing.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn verify(&mut self, _manifest: &Manifest) -> Result<()> {
            panic!("a cancelled job must never reach verification");
        }
    }

    /// Runs one tick in which the cancel is accepted but its manifest write fails.
    async fn cancel_lost_to_outage(
        store: &Arc<MemoryStore>,
        id: &str,
    ) -> Executor<ManifestOutageStore, CancelThenOutageDevice> {
        let failing = Arc::new(AtomicBool::new(false));
        let device = CancelThenOutageDevice {
            initiator: initiator(store),
            job_id: id.to_string(),
            failing: Arc::clone(&failing),
        };
        let outage = ManifestOutageStore {
            inner: Arc::clone(store),
            failing: Arc::clone(&failing),
        };
        let mut exec = Executor::new(outage, device, gateway(), config(3));

        assert!(matches!(exec.tick().await, TickOutcome::Skipped(_)));
        let m = manifest_of(store, id).await;
        assert_eq!(m.current_state, BurnState::Burning);
        assert!(store.get(&paths::cancel_marker(id)).await.unwrap().is_none());

        failing.store(false, Ordering::SeqCst);
        exec
    }

    async fn assert_cancelled_cleanly(store: &Arc<MemoryStore>, id: &str) {
        let m = manifest_of(store, id).await;
        assert_eq!(m.current_state, BurnState::Cancelled);
        assert_eq!(m.retry_count, 0);
        assert!(m.transitions.iter().all(|t| t.to != BurnState::Failed));
        assert!(store.get(&paths::completed(id)).await.unwrap().is_none());
        assert!(store.get(&paths::pending(id)).await.unwrap().is_none());
    }

    async fn put_descriptor(store: &Arc<MemoryStore>, name: &str, id: &str) {
        let mut m = Manifest::new(files(), Priority::Urgent, "t");
        m.id = id.to_string();
        m.current_state = BurnState::Pending;
        write_json(store, name, &m.descriptor()).await.unwrap();
    }

    #[test]
    fn equal_priorities_keep_store_order() {
        let mk = |id: &str, priority| {
            let mut m = Manifest::new(files(), priority, "t");
            m.id = id.to_string();
            m.current_state = BurnState::Pending;
            m.descriptor()
        };
        let ordered = order_by_priority(vec![
            mk("a", Priority::Normal),
            mk("b", Priority::High),
            mk("c", Priority::Normal),
            mk("d", Priority::High),
        ]);
        let ids: Vec<_> = ordered.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn selects_jobs_in_priority_order() {
        let store = Arc::new(MemoryStore::new());
        let init = initiator(&store);
        let mut ids = Vec::new();
        for p in [Priority::Low, Priority::Urgent, Priority::Normal, Priority::High] {
            ids.push((p, init.submit_job(files(), p).await.unwrap()));
        }

        let mut exec = executor(&store, SimulatedDevice::default(), 3);
        let mut order = Vec::new();
        for _ in 0..4 {
            match exec.tick().await {
                TickOutcome::Processed { job_id, state } => {
                    assert_eq!(state, BurnState::Complete);
                    let (p, _) = ids.iter().find(|(_, id)| *id == job_id).unwrap();
                    order.push(*p);
                }
                other => panic!("unexpected tick outcome {other:?}"),
            }
        }
        assert_eq!(
            order,
            vec![Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]
        );
        assert_eq!(exec.tick().await, TickOutcome::Idle);
        assert_eq!(exec.device().completed_burns(), 4);
    }

    #[tokio::test]
    async fn completed_job_is_archived_and_removed_from_pending() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::default(), 3);

        exec.tick().await;

        let m = manifest_of(&store, &id).await;
        let states: Vec<_> = m.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                BurnState::Created,
                BurnState::Pending,
                BurnState::Queued,
                BurnState::Downloading,
                BurnState::Burning,
                BurnState::Verifying,
                BurnState::Complete,
            ]
        );
        assert!(store.get(&paths::pending(&id)).await.unwrap().is_none());
        let record: CompletionRecord = read_json(&store, &paths::completed(&id)).await.unwrap().unwrap();
        assert_eq!(record.outcome, BurnState::Complete);
        let archived = store
            .keys()
            .into_iter()
            .any(|k| k.starts_with("archive/") && k.ends_with(&format!("{id}.json")));
        assert!(archived);

        let status: StatusSnapshot = read_json(&store, &paths::status(&id)).await.unwrap().unwrap();
        assert_eq!(status.state, BurnState::Complete);
        assert_eq!(status.progress, 100);
    }

    #[tokio::test]
    async fn cancel_mid_burn_stops_the_job_without_completion() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::High).await.unwrap();
        let device = CancellingDevice {
            initiator: initiator(&store),
            job_id: id.clone(),
        };
        let mut exec = executor(&store, device, 3);

        let outcome = exec.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                job_id: id.clone(),
                state: BurnState::Cancelled
            }
        );

        let m = manifest_of(&store, &id).await;
        assert_eq!(m.current_state, BurnState::Cancelled);
        let last = m.transitions.last().unwrap();
        assert_eq!(last.from, Some(BurnState::Burning));
        assert!(store.get(&paths::completed(&id)).await.unwrap().is_none());
        assert!(store.get(&paths::pending(&id)).await.unwrap().is_none());
        assert!(store.keys().iter().all(|k| !k.starts_with("archive/")));

        let signals = SignalRelay::default().outbound(&store).await.unwrap();
        let completion = signals.iter().any(|e| {
            matches!(&e.payload, SignalPayload::Status { state: BurnState::Complete, .. })
        });
        assert!(!completion);
        assert!(signals.iter().any(|e| matches!(
            &e.payload,
            SignalPayload::Acknowledgement { of, .. } if of == "cancel"
        )));
        assert_eq!(exec.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn forged_cancel_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let device = InboundSignalDevice::new(&store, inbound_cancel(&id, "mallory", Utc::now()));
        let mut exec = executor(&store, device, 3);

        let outcome = exec.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                job_id: id,
                state: BurnState::Complete
            }
        );
    }

    #[tokio::test]
    async fn cancel_through_inbound_ring_alone_stops_the_burn() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let device = InboundSignalDevice::new(&store, inbound_cancel(&id, "initiator", Utc::now()));
        let mut exec = executor(&store, device, 3);

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id.clone(),
                state: BurnState::Cancelled
            }
        );
        let m = manifest_of(&store, &id).await;
        assert_eq!(m.last_reason(), Some("cancel requested by initiator"));
        assert!(store.keys().iter().all(|k| !k.starts_with("commands/")));
    }

    #[tokio::test]
    async fn cancel_for_another_job_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let device = InboundSignalDevice::new(&store, inbound_cancel("someone-else", "initiator", Utc::now()));
        let mut exec = executor(&store, device, 3);

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id,
                state: BurnState::Complete
            }
        );
    }

    #[tokio::test]
    async fn stale_cancel_is_rejected_mid_burn() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let sent = Utc::now() - chrono::Duration::minutes(5);
        let device = InboundSignalDevice::new(&store, inbound_cancel(&id, "initiator", sent));
        let mut exec = executor(&store, device, 3);

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id.clone(),
                state: BurnState::Complete
            }
        );
        assert_eq!(manifest_of(&store, &id).await.current_state, BurnState::Complete);
    }

    #[tokio::test]
    async fn cancel_survives_a_failed_manifest_write() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::High).await.unwrap();
        let mut exec = cancel_lost_to_outage(&store, &id).await;

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id.clone(),
                state: BurnState::Cancelled
            }
        );
        assert_cancelled_cleanly(&store, &id).await;
        assert_eq!(exec.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn restarted_executor_honours_a_cancel_left_in_the_inbound_ring() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::High).await.unwrap();
        drop(cancel_lost_to_outage(&store, &id).await);

        let mut exec = executor(&store, SimulatedDevice::default(), 3);
        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id.clone(),
                state: BurnState::Cancelled
            }
        );
        assert_cancelled_cleanly(&store, &id).await;
        assert_eq!(exec.device().completed_burns(), 0);
    }

    #[tokio::test]
    async fn descriptor_under_another_name_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        put_descriptor(&store, "pending/aaa.json", "other-id").await;
        let id = initiator(&store).submit_job(files(), Priority::Low).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::default(), 3);

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id,
                state: BurnState::Complete
            }
        );
        assert_eq!(exec.tick().await, TickOutcome::Idle);
        assert!(store.keys().iter().all(|k| !k.contains("other-id")));
        assert_eq!(load_pending(&store).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn descriptor_ids_that_are_not_path_segments_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        put_descriptor(&store, "pending/...json", "..").await;
        put_descriptor(&store, "pending/a/b.json", "a/b").await;
        let id = initiator(&store).submit_job(files(), Priority::Low).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::default(), 3);

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id,
                state: BurnState::Complete
            }
        );
        assert_eq!(exec.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn two_failures_then_success() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::failing(2, DevicePhase::Burn), 3);

        let mut states = Vec::new();
        for _ in 0..3 {
            match exec.tick().await {
                TickOutcome::Processed { state, .. } => states.push(state),
                other => panic!("unexpected tick outcome {other:?}"),
            }
        }
        assert_eq!(
            states,
            vec![BurnState::Pending, BurnState::Pending, BurnState::Complete]
        );

        let m = manifest_of(&store, &id).await;
        assert_eq!(m.current_state, BurnState::Complete);
        assert_eq!(m.retry_count, 2);
        assert_eq!(m.retry_cycles(), 2);

        let tail: Vec<_> = m.transitions.iter().rev().take(6).map(|t| t.to).collect();
        assert_eq!(
            tail,
            vec![
                BurnState::Complete,
                BurnState::Verifying,
                BurnState::Burning,
                BurnState::Downloading,
                BurnState::Queued,
                BurnState::Pending,
            ]
        );
        let failed: Vec<_> = m
            .transitions
            .iter()
            .filter(|t| t.to == BurnState::Failed)
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|t| t.reason.as_deref().unwrap().contains("simulated")));
    }

    #[tokio::test]
    async fn exhausted_job_is_archived_as_failed() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::failing(10, DevicePhase::Stage), 2);

        assert!(matches!(
            exec.tick().await,
            TickOutcome::Processed { state: BurnState::Pending, .. }
        ));
        assert!(matches!(
            exec.tick().await,
            TickOutcome::Processed { state: BurnState::Failed, .. }
        ));
        assert_eq!(exec.tick().await, TickOutcome::Idle);

        let record: CompletionRecord = read_json(&store, &paths::completed(&id)).await.unwrap().unwrap();
        assert_eq!(record.outcome, BurnState::Failed);
        assert_eq!(record.retry_count, 2);
        assert!(store.get(&paths::pending(&id)).await.unwrap().is_none());

        let m = manifest_of(&store, &id).await;
        let archived = m.audit_log.last().unwrap();
        assert_eq!(archived.action, "archived");
        assert!(archived.detail.as_deref().unwrap().contains("retry budget"));
    }

    #[tokio::test]
    async fn backoff_defers_the_retry() {
        let store = Arc::new(MemoryStore::new());
        initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let mut cfg = config(3);
        cfg.retry.base_delay_ms = 60_000;
        let mut exec = Executor::new(
            Arc::clone(&store),
            SimulatedDevice::failing(1, DevicePhase::Verify),
            gateway(),
            cfg,
        );

        assert!(matches!(
            exec.tick().await,
            TickOutcome::Processed { state: BurnState::Pending, .. }
        ));
        assert_eq!(exec.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn store_outage_skips_the_tick() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::default(), 3);

        store.set_unavailable(true);
        assert!(matches!(exec.tick().await, TickOutcome::Skipped(_)));

        store.set_unavailable(false);
        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id,
                state: BurnState::Complete
            }
        );
    }

    #[tokio::test]
    async fn malformed_descriptor_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("pending/000-garbage.json", b"{\"id\": 42".to_vec())
            .await
            .unwrap();
        let id = initiator(&store).submit_job(files(), Priority::Low).await.unwrap();
        let mut exec = executor(&store, SimulatedDevice::default(), 3);

        assert_eq!(
            exec.tick().await,
            TickOutcome::Processed {
                job_id: id,
                state: BurnState::Complete
            }
        );
    }

    #[tokio::test]
    async fn interrupted_burn_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Normal).await.unwrap();

        // Simulate a crash after the executor reached `burning`.
        let mut m = manifest_of(&store, &id).await;
        for s in [BurnState::Queued, BurnState::Downloading, BurnState::Burning] {
            StateMachine::transition(&mut m, s, "burn-executor", None).unwrap();
        }
        write_json(&store, &paths::manifest(&id), &m).await.unwrap();
        write_json(&store, &paths::pending(&id), &m.descriptor()).await.unwrap();

        let mut exec = executor(&store, SimulatedDevice::default(), 3);
        assert!(matches!(
            exec.tick().await,
            TickOutcome::Processed { state: BurnState::Pending, .. }
        ));
        let m = manifest_of(&store, &id).await;
        assert_eq!(m.retry_count, 1);
        assert!(m
            .transitions
            .iter()
            .any(|t| t.reason.as_deref() == Some("interrupted while burning")));

        assert!(matches!(
            exec.tick().await,
            TickOutcome::Processed { state: BurnState::Complete, .. }
        ));
    }

    #[tokio::test]
    async fn stopped_executor_returns_from_run() {
        let store = Arc::new(MemoryStore::new());
        let mut exec = executor(&store, SimulatedDevice::default(), 3);
        let handle = exec.handle();
        assert!(handle.is_running());
        handle.stop();
        exec.run().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn run_processes_then_stops_on_request() {
        let store = Arc::new(MemoryStore::new());
        let id = initiator(&store).submit_job(files(), Priority::Urgent).await.unwrap();
        let mut cfg = config(3);
        cfg.poll_interval = Duration::from_millis(1);
        let mut exec = Executor::new(Arc::clone(&store), SimulatedDevice::default(), gateway(), cfg);
        let handle = exec.handle();

        let watcher = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                loop {
                    if store.get(&paths::completed(&id)).await.unwrap().is_some() {
                        handle.stop();
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        exec.run().await;
        watcher.await.unwrap();
        assert_eq!(manifest_of(&store, &id).await.current_state, BurnState::Complete);
    }
}
