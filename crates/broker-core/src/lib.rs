// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the execution broker.
//!
//! This crate defines the wire/storage types shared by every other broker
//! crate — `Request`, `TrustRecord`, `SkillMetadata` — plus the error
//! catalog. If you only take one dependency, take this one.

/// Comprehensive error catalog for the execution broker.
pub mod error;
/// Skill metadata header parsing.
pub mod metadata;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use error::{BrokerError, ErrorCode, ErrorInfo};
pub use metadata::SkillMetadata;

/// Current contract version string, useful for log lines and diagnostics.
pub const CONTRACT_VERSION: &str = "broker/v1";

/// Default wall-clock timeout, in seconds, applied when a skill declares none.
pub const DEFAULT_TIMEOUT_SECS: u32 = 30;

/// Duration of a `24h` trust grant, in seconds.
pub const TRUST_24H_SECS: i64 = 86_400;

/// Compute the SHA-256 fingerprint of code bytes, as lowercase hex.
///
/// This is the sole identity used for trust decisions and for the
/// hash-to-execute binding invariant: the bytes handed to the sandbox must
/// always match the fingerprint shown to the operator.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Lifecycle state of a [`Request`].
///
/// See the crate-level transition diagram: `pending` is the only entry
/// state; `denied`, `completed`, and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Submitted, awaiting an operator decision.
    Pending,
    /// Approved; secrets are being checked.
    Approved,
    /// Approved, but one or more declared secrets are missing from the vault.
    AwaitingSecrets,
    /// All secrets present; the sandbox has been invoked.
    Executing,
    /// Ran to completion (regardless of the skill's own exit code).
    Completed,
    /// The operator denied the request. Terminal.
    Denied,
    /// Execution did not complete successfully, or a fatal internal error
    /// occurred. Terminal.
    Failed,
}

impl RequestState {
    /// Whether this state has no further legal transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::AwaitingSecrets => "awaiting_secrets",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Denied => "denied",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Scope of a code-trust grant.
///
/// `Once` is a runtime-only decision and is never persisted to the Request
/// Store — see [`crate::error::ErrorCode::OnceNotPersistable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrustScope {
    /// Approve this single invocation only; never persisted.
    Once,
    /// Persisted grant, valid for 24 hours from the grant timestamp.
    TwentyFourHours,
    /// Persisted grant with no expiry.
    Forever,
}

impl TrustScope {
    /// Parse the scope token used in button payloads (`approve:<id>:<scope>`).
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "once" => Some(Self::Once),
            "24h" => Some(Self::TwentyFourHours),
            "forever" => Some(Self::Forever),
            _ => None,
        }
    }

    /// Whether this scope is eligible for persistence in the trust table.
    #[must_use]
    pub fn is_persistable(self) -> bool {
        !matches!(self, Self::Once)
    }
}

/// Primary key for a [`TrustRecord`]: the pair of source locator and code
/// fingerprint that together identify "this exact code, from this place".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct TrustKey {
    /// The `skill_url` the code was originally fetched from.
    pub source_locator: String,
    /// SHA-256 hex fingerprint of the code bytes.
    pub fingerprint: String,
}

impl TrustKey {
    /// Construct a new trust key.
    pub fn new(source_locator: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            source_locator: source_locator.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// A persisted (or, for `once`, ephemeral) code-trust grant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TrustRecord {
    /// The `(source locator, fingerprint)` this grant applies to.
    pub key: TrustKey,
    /// The scope of the grant.
    pub scope: TrustScope,
    /// When the grant was issued.
    pub granted_at: DateTime<Utc>,
    /// When the grant lapses; unset for `forever`.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TrustRecord {
    /// Build a new trust record for the given scope, computing `expires_at`
    /// from `granted_at` for the `24h` scope.
    ///
    /// Returns `None` for [`TrustScope::Once`], which must never be
    /// constructed as a persisted record.
    #[must_use]
    pub fn new(key: TrustKey, scope: TrustScope, granted_at: DateTime<Utc>) -> Option<Self> {
        if !scope.is_persistable() {
            return None;
        }
        let expires_at = match scope {
            TrustScope::TwentyFourHours => {
                Some(granted_at + chrono::Duration::seconds(TRUST_24H_SECS))
            }
            TrustScope::Forever => None,
            TrustScope::Once => unreachable!("checked above"),
        };
        Some(Self {
            key,
            scope,
            granted_at,
            expires_at,
        })
    }

    /// Whether this record is still valid at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// Outcome of a finished sandbox invocation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    /// `true` iff the exit code was 0 and no timeout occurred.
    pub success: bool,
    /// Captured standard output, possibly truncated.
    pub stdout: String,
    /// Captured standard error, possibly truncated.
    pub stderr: String,
    /// The child's exit code, or `None` if it never started / was killed.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the invocation, in milliseconds.
    pub duration_ms: u64,
    /// Whether the wall-clock timeout fired.
    pub timed_out: bool,
}

/// A request to execute a named skill, and everything needed to render it,
/// approve it, and run it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Request {
    /// Opaque identifier, hex-encoded, ≥64 bits of entropy.
    pub id: Uuid,
    /// Logical skill name, as declared by the caller and confirmed by the
    /// skill's own metadata header.
    pub skill_id: String,
    /// Where the code was fetched from (for audit/display).
    pub source_locator: String,
    /// SHA-256 hex fingerprint of the fetched code bytes.
    pub fingerprint: String,
    /// Declared secret names, in the order the caller specified.
    pub secrets: Vec<String>,
    /// Invocation arguments, passed to the sandbox as environment.
    pub args: BTreeMap<String, String>,
    /// Parsed metadata header from the code bytes.
    pub metadata: SkillMetadata,
    /// Current lifecycle state.
    pub state: RequestState,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request was approved, if it has been.
    pub approved_at: Option<DateTime<Utc>>,
    /// When execution started, if it has.
    pub executed_at: Option<DateTime<Utc>>,
    /// Terminal result, once `completed` or `failed` *via the sandbox*.
    pub result: Option<ExecutionResult>,
    /// Set when the request became `failed` without ever reaching the
    /// sandbox (fetch failure, launch failure, any other internal error).
    pub failure_reason: Option<String>,
    /// Chat-message handle used to update the operator dialogue in place.
    pub chat_handle: Option<String>,
    /// Monotonically increasing counter bumped on every mutation; used only
    /// for diagnostics, never for correctness (`transition`'s compare-and-set
    /// on `state` is the sole correctness mechanism).
    pub revision: u64,
}

impl Request {
    /// Construct a freshly ingested request in state [`RequestState::Pending`].
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        skill_id: impl Into<String>,
        source_locator: impl Into<String>,
        fingerprint: impl Into<String>,
        secrets: Vec<String>,
        args: BTreeMap<String, String>,
        metadata: SkillMetadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            skill_id: skill_id.into(),
            source_locator: source_locator.into(),
            fingerprint: fingerprint.into(),
            secrets,
            args,
            metadata,
            state: RequestState::Pending,
            created_at,
            approved_at: None,
            executed_at: None,
            result: None,
            failure_reason: None,
            chat_handle: None,
            revision: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        let fp = fingerprint(b"HELLO");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(b"HELLO"));
        assert_ne!(fp, fingerprint(b"hello"));
    }

    #[test]
    fn once_scope_is_not_persistable() {
        assert!(!TrustScope::Once.is_persistable());
        assert!(TrustScope::TwentyFourHours.is_persistable());
        assert!(TrustScope::Forever.is_persistable());
    }

    #[test]
    fn trust_record_rejects_once() {
        let key = TrustKey::new("https://example.test/hello.skill", "abc123");
        let rec = TrustRecord::new(key, TrustScope::Once, Utc::now());
        assert!(rec.is_none());
    }

    #[test]
    fn trust_record_24h_expires_after_horizon() {
        let key = TrustKey::new("https://example.test/hello.skill", "abc123");
        let t0 = Utc::now();
        let rec = TrustRecord::new(key, TrustScope::TwentyFourHours, t0).unwrap();
        assert!(!rec.is_expired(t0 + chrono::Duration::seconds(TRUST_24H_SECS - 1)));
        assert!(rec.is_expired(t0 + chrono::Duration::seconds(TRUST_24H_SECS)));
    }

    #[test]
    fn forever_scope_never_expires() {
        let key = TrustKey::new("https://example.test/hello.skill", "abc123");
        let t0 = Utc::now();
        let rec = TrustRecord::new(key, TrustScope::Forever, t0).unwrap();
        assert!(!rec.is_expired(t0 + chrono::Duration::days(365 * 50)));
    }

    #[test]
    fn terminal_states_are_correct() {
        assert!(RequestState::Denied.is_terminal());
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(!RequestState::Pending.is_terminal());
        assert!(!RequestState::Approved.is_terminal());
        assert!(!RequestState::AwaitingSecrets.is_terminal());
        assert!(!RequestState::Executing.is_terminal());
    }
}
