use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{AuditEntry, Manifest, TransitionRecord};
use crate::error::{RelayError, Result};

/// Lifecycle states of a burn job.
///
/// A job flows: CREATED → PENDING → QUEUED → DOWNLOADING → BURNING → VERIFYING → COMPLETE.
/// `failed` and `cancelled` are not terminal: both may go back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnState {
    Created,
    Pending,
    Queued,
    Downloading,
    Burning,
    Verifying,
    Complete,
    Failed,
    Cancelled,
}

impl BurnState {
    #[cfg(test)]
    pub const ALL: [BurnState; 9] = [
        BurnState::Created,
        BurnState::Pending,
        BurnState::Queued,
        BurnState::Downloading,
        BurnState::Burning,
        BurnState::Verifying,
        BurnState::Complete,
        BurnState::Failed,
        BurnState::Cancelled,
    ];

    /// The set of states reachable from `self` in one step.
    pub fn allowed_next(self) -> &'static [BurnState] {
        use BurnState::*;
        match self {
            Created => &[Pending, Cancelled],
            Pending => &[Queued, Cancelled],
            Queued => &[Downloading, Cancelled],
            Downloading => &[Burning, Failed, Cancelled],
            Burning => &[Verifying, Failed, Cancelled],
            Verifying => &[Complete, Failed],
            Complete => &[],
            Failed => &[Pending],
            Cancelled => &[Pending],
        }
    }

    pub fn can_transition_to(self, next: BurnState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// States in which the executor owns the job.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BurnState::Queued | BurnState::Downloading | BurnState::Burning | BurnState::Verifying
        )
    }

    /// States that end a burn attempt.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            BurnState::Complete | BurnState::Failed | BurnState::Cancelled
        )
    }
}

impl fmt::Display for BurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BurnState::Created => "created",
            BurnState::Pending => "pending",
            BurnState::Queued => "queued",
            BurnState::Downloading => "downloading",
            BurnState::Burning => "burning",
            BurnState::Verifying => "verifying",
            BurnState::Complete => "complete",
            BurnState::Failed => "failed",
            BurnState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Applies legal transitions to a [`Manifest`].
///
/// Pure: it touches nothing but the manifest passed in. Persisting the result
/// is up to the caller.
pub struct StateMachine;

impl StateMachine {
    /// Move `manifest` to `to`, recording who did it and why.
    ///
    /// On an illegal request the manifest is left untouched and
    /// [`RelayError::InvalidTransition`] is returned.
    pub fn transition(
        manifest: &mut Manifest,
        to: BurnState,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        Self::transition_at(manifest, to, actor, reason, Utc::now())
    }

    pub fn transition_at(
        manifest: &mut Manifest,
        to: BurnState,
        actor: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let from = manifest.current_state;
        if !from.can_transition_to(to) {
            return Err(RelayError::InvalidTransition { from, to });
        }

        manifest.transitions.push(TransitionRecord {
            from: Some(from),
            to,
            at,
            actor: actor.to_string(),
            reason: reason.map(str::to_string),
        });
        manifest.current_state = to;
        manifest.status = to;
        manifest.audit_log.push(AuditEntry {
            at,
            actor: actor.to_string(),
            action: format!("transition:{from}->{to}"),
            detail: reason.map(str::to_string),
        });
        manifest.updated_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::job::{FileRef, Priority};

    fn manifest_in(state: BurnState) -> Manifest {
        let mut m = Manifest::new(vec![FileRef::new("a.iso")], Priority::Normal, "test");
        // Force the state directly so every row of the table can be probed.
        m.transitions.last_mut().unwrap().to = state;
        m.current_state = state;
        m.status = state;
        m
    }

    #[test]
    fn every_legal_pair_appends_exactly_one_record() {
        for from in BurnState::ALL {
            for &to in from.allowed_next() {
                let mut m = manifest_in(from);
                let before = m.transitions.len();
                let audit_before = m.audit_log.len();

                StateMachine::transition(&mut m, to, "tester", Some("probe")).unwrap();

                assert_eq!(m.transitions.len(), before + 1);
                assert_eq!(m.audit_log.len(), audit_before + 1);
                assert_eq!(m.current_state, to);
                assert_eq!(m.status, to);
                let last = m.transitions.last().unwrap();
                assert_eq!(last.from, Some(from));
                assert_eq!(last.to, to);
                assert_eq!(last.reason.as_deref(), Some("probe"));
            }
        }
    }

    #[test]
    fn every_illegal_pair_fails_and_leaves_manifest_unmodified() {
        for from in BurnState::ALL {
            for to in BurnState::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let mut m = manifest_in(from);
                let snapshot = serde_json::to_value(&m).unwrap();

                let err = StateMachine::transition(&mut m, to, "tester", None).unwrap_err();
                assert!(
                    matches!(err, RelayError::InvalidTransition { from: f, to: t } if f == from && t == to)
                );
                assert_eq!(serde_json::to_value(&m).unwrap(), snapshot);
            }
        }
    }

    #[test]
    fn current_state_tracks_last_record() {
        let mut m = Manifest::new(vec![FileRef::new("a.iso")], Priority::High, "initiator");
        for to in [
            BurnState::Pending,
            BurnState::Queued,
            BurnState::Downloading,
            BurnState::Burning,
            BurnState::Failed,
            BurnState::Pending,
        ] {
            StateMachine::transition(&mut m, to, "executor", None).unwrap();
            assert_eq!(m.current_state, m.transitions.last().unwrap().to);
        }
    }

    #[test]
    fn complete_is_the_only_terminal_state() {
        let terminal: Vec<_> = BurnState::ALL.into_iter().filter(|s| s.allowed_next().is_empty()).collect();
        assert_eq!(terminal, vec![BurnState::Complete]);
    }

    #[test]
    fn transition_updates_last_modified() {
        let mut m = Manifest::new(vec![FileRef::new("a.iso")], Priority::Low, "initiator");
        let later = m.updated_at + chrono::Duration::seconds(5);
        StateMachine::transition_at(&mut m, BurnState::Pending, "initiator", None, later).unwrap();
        assert_eq!(m.updated_at, later);
        assert_eq!(m.transitions.last().unwrap().at, later);
    }

    #[test]
    fn state_display() {
        assert_eq!(BurnState::Created.to_string(), "created");
        assert_eq!(BurnState::Downloading.to_string(), "downloading");
        assert_eq!(BurnState::Cancelled.to_string(), "cancelled");
    }
}
