mod job;
mod state;

pub use job::{
    AuditEntry, CompletionRecord, DiscSettings, FileRef, JobDescriptor, Manifest, Priority,
    RetryConfig, StatusSnapshot,
};
pub use state::{BurnState, StateMachine};
