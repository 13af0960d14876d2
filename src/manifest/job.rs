use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::BurnState;

/// Scheduling priority. Declaration order is scheduling order: `Urgent` runs first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Reference to one file that ends up on the disc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl FileRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size_bytes: None,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failures tolerated before a job is archived as permanently failed.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

/// The scheduler's view of a job, stored at `pending/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub priority: Priority,
    pub files: Vec<FileRef>,
    pub created_at: DateTime<Utc>,
    pub status: BurnState,
    #[serde(default)]
    pub retry_count: u32,
    /// Backoff gate: the job is not eligible before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    /// Whether a poll tick at `now` may pick this descriptor.
    ///
    /// Active statuses count too: between ticks nothing is running, so such a
    /// descriptor belongs to an interrupted run and must be recovered.
    pub fn is_eligible(&self, now: DateTime<Utc>, retry: &RetryConfig) -> bool {
        (self.status == BurnState::Pending || self.status.is_active())
            && !retry.is_exhausted(self.retry_count)
            && self.not_before.is_none_or(|t| t <= now)
    }
}

/// Physical burn parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscSettings {
    #[serde(default)]
    pub label: Option<String>,
    /// Write speed multiplier; `None` lets the drive choose.
    #[serde(default)]
    pub write_speed: Option<u32>,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_true")]
    pub finalize: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DiscSettings {
    fn default() -> Self {
        Self {
            label: None,
            write_speed: None,
            verify: true,
            finalize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// `None` only on the very first record.
    pub from: Option<BurnState>,
    pub to: BurnState,
    pub at: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Authoritative record of a job, stored at `jobs/<id>/manifest.json`.
///
/// `current_state` always equals the `to` of the last transition record, and
/// `transitions` is append-only. Only [`StateMachine`](super::StateMachine)
/// moves the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub priority: Priority,
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub disc_settings: DiscSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Top-level mirror of `current_state` for readers that only want the status.
    pub status: BurnState,
    pub current_state: BurnState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    pub transitions: Vec<TransitionRecord>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
}

impl Manifest {
    pub fn new(files: Vec<FileRef>, priority: Priority, actor: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            priority,
            files,
            targets: Vec::new(),
            disc_settings: DiscSettings::default(),
            created_at: now,
            updated_at: now,
            status: BurnState::Created,
            current_state: BurnState::Created,
            retry_count: 0,
            not_before: None,
            transitions: vec![TransitionRecord {
                from: None,
                to: BurnState::Created,
                at: now,
                actor: actor.to_string(),
                reason: None,
            }],
            audit_log: vec![AuditEntry {
                at: now,
                actor: actor.to_string(),
                action: "created".to_string(),
                detail: None,
            }],
        }
    }

    /// Rebuild a manifest when only the pending descriptor survived in the store.
    pub fn from_descriptor(desc: &JobDescriptor, actor: &str) -> Self {
        let now = Utc::now();
        let reason = "reconstructed from pending descriptor".to_string();
        Self {
            id: desc.id.clone(),
            priority: desc.priority,
            files: desc.files.clone(),
            targets: Vec::new(),
            disc_settings: DiscSettings::default(),
            created_at: desc.created_at,
            updated_at: now,
            status: desc.status,
            current_state: desc.status,
            retry_count: desc.retry_count,
            not_before: desc.not_before,
            transitions: vec![TransitionRecord {
                from: None,
                to: desc.status,
                at: now,
                actor: actor.to_string(),
                reason: Some(reason.clone()),
            }],
            audit_log: vec![AuditEntry {
                at: now,
                actor: actor.to_string(),
                action: "reconstructed".to_string(),
                detail: Some(reason),
            }],
        }
    }

    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            id: self.id.clone(),
            priority: self.priority,
            files: self.files.clone(),
            created_at: self.created_at,
            status: self.current_state,
            retry_count: self.retry_count,
            not_before: self.not_before,
        }
    }

    /// Append an administrative action that is not a state change.
    pub fn record_action(&mut self, actor: &str, action: &str, detail: Option<String>) {
        let now = Utc::now();
        self.audit_log.push(AuditEntry {
            at: now,
            actor: actor.to_string(),
            action: action.to_string(),
            detail,
        });
        self.updated_at = now;
    }

    /// Reason attached to the most recent transition, if any.
    pub fn last_reason(&self) -> Option<&str> {
        self.transitions.last().and_then(|t| t.reason.as_deref())
    }

    /// Number of `failed -> pending` cycles in the history.
    pub fn retry_cycles(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.from == Some(BurnState::Failed) && t.to == BurnState::Pending)
            .count()
    }
}

/// Latest progress snapshot, stored at `status/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: String,
    pub state: BurnState,
    /// 0..=100
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn of(manifest: &Manifest, progress: u8, message: Option<String>) -> Self {
        Self {
            job_id: manifest.id.clone(),
            state: manifest.current_state,
            progress: progress.min(100),
            message,
            retry_count: manifest.retry_count,
            updated_at: Utc::now(),
        }
    }
}

/// Terminal record produced when a job completes or is permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_id: String,
    pub outcome: BurnState,
    pub priority: Priority,
    pub files: Vec<FileRef>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub reason: Option<String>,
    pub transitions: Vec<TransitionRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl CompletionRecord {
    pub fn from_manifest(manifest: &Manifest, retry: &RetryConfig) -> Self {
        let now = Utc::now();
        let duration: Duration = now - manifest.created_at;
        Self {
            job_id: manifest.id.clone(),
            outcome: manifest.current_state,
            priority: manifest.priority,
            files: manifest.files.clone(),
            retry_count: manifest.retry_count,
            max_retries: retry.max_retries,
            reason: manifest.last_reason().map(str::to_string),
            transitions: manifest.transitions.clone(),
            started_at: manifest.created_at,
            completed_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
