//! Security gateway applied to every inbound envelope.
//!
//! Checks run in a fixed order and the first failure wins:
//! source allow-list, freshness, rate limit, content patterns, integrity.
//! The gateway never errors; it answers with a [`GatewayDecision`].

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::codec;
use super::envelope::Envelope;
use crate::error::{RelayError, Result};

const RATE_WINDOW_SECS: i64 = 60;

/// Policy knobs, loaded from the `[security]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// When off, only the integrity check runs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,

    #[serde(default = "default_max_signal_age_secs")]
    pub max_signal_age_secs: u64,

    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Regular expressions matched against the canonical payload text.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_allowed_sources() -> Vec<String> {
    vec!["burn-executor".to_string(), "initiator".to_string()]
}

fn default_max_signal_age_secs() -> u64 {
    30
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

fn default_blocked_patterns() -> Vec<String> {
    [
        // script / code injection
        r"(?i)<\s*script",
        r"(?i)javascript:",
        r"(?i)\beval\s*\(",
        r"(?i)\bexec\s*\(",
        r"(?i)__import__",
        r"\$\([^)]*\)",
        r"`[^`]*`",
        // alternate transports
        r"(?i)\b(?:wss?|ftp|gopher)://",
        r"(?i)data:[a-z]+/[a-z0-9.+-]+;base64",
        r"(?i)\bngrok\b",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            allowed_sources: default_allowed_sources(),
            max_signal_age_secs: default_max_signal_age_secs(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            blocked_patterns: default_blocked_patterns(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownSource { source: Option<String> },
    TooOld { age_secs: i64, max_secs: u64 },
    FromFuture { ahead_secs: i64 },
    RateLimited { limit: u32 },
    BlockedContent { pattern: String },
    /// The payload could not be canonicalized for inspection.
    Unreadable,
    DigestMismatch,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownSource { source: Some(s) } => write!(f, "unknown source '{s}'"),
            RejectReason::UnknownSource { source: None } => write!(f, "missing source"),
            RejectReason::TooOld { age_secs, max_secs } => {
                write!(f, "too old: {age_secs}s exceeds {max_secs}s")
            }
            RejectReason::FromFuture { ahead_secs } => {
                write!(f, "timestamp {ahead_secs}s in the future")
            }
            RejectReason::RateLimited { limit } => write!(f, "rate limit exceeded ({limit}/min)"),
            RejectReason::BlockedContent { pattern } => {
                write!(f, "blocked content pattern '{pattern}'")
            }
            RejectReason::Unreadable => write!(f, "unreadable payload"),
            RejectReason::DigestMismatch => write!(f, "digest mismatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl GatewayDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }

    /// For callers that prefer `?` over inspecting the decision.
    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(reason) if !self.allowed => Err(RelayError::SecurityRejected(reason.to_string())),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    count: u32,
    resets_at: Option<DateTime<Utc>>,
}

/// Stateful policy gate. Owns nothing but its rolling rate counter.
#[derive(Debug)]
pub struct SecurityGateway {
    policy: SecurityPolicy,
    patterns: Vec<Regex>,
    window: RateWindow,
}

impl SecurityGateway {
    /// Fails only if a blocked pattern is not a valid regular expression.
    pub fn new(policy: SecurityPolicy) -> Result<Self> {
        let patterns = policy
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| RelayError::Config(format!("blocked pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            policy,
            patterns,
            window: RateWindow::default(),
        })
    }

    /// Envelopes counted in the current rate window.
    #[cfg(test)]
    pub fn window_count(&self) -> u32 {
        self.window.count
    }

    pub fn evaluate(&mut self, envelope: &Envelope) -> GatewayDecision {
        self.evaluate_at(envelope, Utc::now())
    }

    pub fn evaluate_at(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> GatewayDecision {
        let decision = self.check(envelope, now);
        match &decision.reason {
            None => debug!(
                nonce = %envelope.nonce,
                signal = %envelope.signal_type(),
                source = envelope.declared_source().unwrap_or("-"),
                "signal accepted"
            ),
            Some(reason) => warn!(
                nonce = %envelope.nonce,
                signal = %envelope.signal_type(),
                source = envelope.declared_source().unwrap_or("-"),
                reason = %reason,
                "signal rejected"
            ),
        }
        decision
    }

    fn check(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> GatewayDecision {
        if self.policy.enabled {
            if let Some(reason) = self.check_source(envelope) {
                return GatewayDecision::reject(reason);
            }
            if let Some(reason) = self.check_freshness(envelope, now) {
                return GatewayDecision::reject(reason);
            }
            if let Some(reason) = self.check_rate(now) {
                return GatewayDecision::reject(reason);
            }
            if let Some(reason) = self.check_content(envelope) {
                return GatewayDecision::reject(reason);
            }
        }
        if !codec::verify(envelope) {
            return GatewayDecision::reject(RejectReason::DigestMismatch);
        }
        GatewayDecision::allow()
    }

    fn check_source(&self, envelope: &Envelope) -> Option<RejectReason> {
        let candidates = [envelope.source.as_deref(), envelope.payload.source()];
        let known = candidates
            .into_iter()
            .flatten()
            .any(|s| self.policy.allowed_sources.iter().any(|a| a == s));
        if known {
            None
        } else {
            Some(RejectReason::UnknownSource {
                source: envelope.declared_source().map(str::to_string),
            })
        }
    }

    fn check_freshness(&self, envelope: &Envelope, now: DateTime<Utc>) -> Option<RejectReason> {
        let max = self.policy.max_signal_age_secs;
        // Ages past what a TimeDelta can hold mean "no limit".
        let limit = i64::try_from(max)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let age = now - envelope.timestamp;
        if age > limit {
            return Some(RejectReason::TooOld {
                age_secs: age.num_seconds(),
                max_secs: max,
            });
        }
        // A timestamp far ahead would stretch the replay window past `max`.
        if -age > limit {
            return Some(RejectReason::FromFuture {
                ahead_secs: (-age).num_seconds(),
            });
        }
        None
    }

    fn check_rate(&mut self, now: DateTime<Utc>) -> Option<RejectReason> {
        match self.window.resets_at {
            Some(resets_at) if now < resets_at => {}
            _ => {
                self.window.count = 0;
                self.window.resets_at = Some(now + Duration::seconds(RATE_WINDOW_SECS));
            }
        }
        self.window.count += 1;
        let limit = self.policy.rate_limit_per_minute;
        if self.window.count > limit {
            Some(RejectReason::RateLimited { limit })
        } else {
            None
        }
    }

    fn check_content(&self, envelope: &Envelope) -> Option<RejectReason> {
        self.scan_content(&envelope.payload)
    }

    fn scan_content<T: Serialize>(&self, value: &T) -> Option<RejectReason> {
        let text = match codec::canonical_json(value) {
            Ok(text) => text,
            Err(_) => return Some(RejectReason::Unreadable),
        };
        self.patterns
            .iter()
            .find(|re| re.is_match(&text))
            .map(|re| RejectReason::BlockedContent {
                pattern: re.as_str().to_string(),
            })
    }
}
