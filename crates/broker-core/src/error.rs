// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Error catalog for the execution broker.
//!
//! Every error code follows the pattern `BROKER-X###` where `X` is the
//! category letter and `###` is a three-digit number:
//!
//! - **R** — Request / ingress errors
//! - **A** — Approval coordinator errors
//! - **T** — Trust cache errors
//! - **V** — Secret vault errors
//! - **X** — Sandbox executor errors
//! - **S** — System errors

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode enum
// ---------------------------------------------------------------------------

/// Enumeration of all broker error codes, organized by category.
///
/// These map onto the taxonomy in the orchestration spec: `bad-request`,
/// `fetch-failed`, `chat-send-failed`, `sandbox-launch-failed`,
/// `sandbox-timeout`, `sandbox-nonzero`, and `internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // ── Request / ingress (R) ─────────────────────────────────────────
    /// The submitted payload was malformed (missing `skill_id`/`skill_url`).
    BadRequest,
    /// The code at `skill_url` could not be retrieved.
    FetchFailed,
    /// The fetched code lacks a parseable metadata header.
    BadMetadata,
    /// A request with the given identifier does not exist.
    RequestNotFound,
    /// A request with the same identifier already exists.
    DuplicateRequestId,

    // ── Approval coordinator (A) ──────────────────────────────────────
    /// A transition's `from` state did not match the row's current state.
    TransitionConflict,
    /// Sending or editing a chat message failed; transient, non-fatal.
    ChatSendFailed,
    /// An inbound chat event referenced an unknown pending-secret dialogue.
    UnknownDialogue,

    // ── Trust cache (T) ────────────────────────────────────────────────
    /// Attempted to persist a `once` trust scope.
    OnceNotPersistable,

    // ── Secret vault (V) ───────────────────────────────────────────────
    /// The secret name is empty, which is never valid.
    EmptySecretName,

    // ── Sandbox executor (X) ──────────────────────────────────────────
    /// The sandboxed subprocess could not be spawned.
    SandboxLaunchFailed,
    /// The sandboxed subprocess exceeded its wall-clock timeout.
    SandboxTimeout,
    /// The sandboxed subprocess exited with a non-zero status.
    SandboxNonZero,

    // ── System (S) ─────────────────────────────────────────────────────
    /// An I/O operation failed.
    IoError,
    /// JSON serialization or deserialization failed.
    SerializationError,
    /// An unexpected internal error occurred; the request is failed, the
    /// process continues.
    Internal,
    /// The configuration is invalid or incomplete.
    ConfigurationError,
}

impl ErrorCode {
    /// Machine-readable code string (e.g. `"BROKER-R001"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest => "BROKER-R001",
            Self::FetchFailed => "BROKER-R002",
            Self::BadMetadata => "BROKER-R003",
            Self::RequestNotFound => "BROKER-R004",
            Self::DuplicateRequestId => "BROKER-R005",

            Self::TransitionConflict => "BROKER-A001",
            Self::ChatSendFailed => "BROKER-A002",
            Self::UnknownDialogue => "BROKER-A003",

            Self::OnceNotPersistable => "BROKER-T001",

            Self::EmptySecretName => "BROKER-V001",

            Self::SandboxLaunchFailed => "BROKER-X001",
            Self::SandboxTimeout => "BROKER-X002",
            Self::SandboxNonZero => "BROKER-X003",

            Self::IoError => "BROKER-S001",
            Self::SerializationError => "BROKER-S002",
            Self::Internal => "BROKER-S003",
            Self::ConfigurationError => "BROKER-S004",
        }
    }

    /// Human-readable category label.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::BadRequest
            | Self::FetchFailed
            | Self::BadMetadata
            | Self::RequestNotFound
            | Self::DuplicateRequestId => "request",

            Self::TransitionConflict | Self::ChatSendFailed | Self::UnknownDialogue => "approval",

            Self::OnceNotPersistable => "trust",

            Self::EmptySecretName => "vault",

            Self::SandboxLaunchFailed | Self::SandboxTimeout | Self::SandboxNonZero => "sandbox",

            Self::IoError | Self::SerializationError | Self::Internal | Self::ConfigurationError => {
                "system"
            }
        }
    }

    /// Short human-readable description of this error code.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::BadRequest => "The submitted payload was malformed",
            Self::FetchFailed => "The code at skill_url could not be retrieved",
            Self::BadMetadata => "The fetched code lacks a parseable metadata header",
            Self::RequestNotFound => "No request exists with the given identifier",
            Self::DuplicateRequestId => "A request with the same identifier already exists",
            Self::TransitionConflict => "The state transition's precondition was not met",
            Self::ChatSendFailed => "Sending or editing a chat message failed",
            Self::UnknownDialogue => "The chat event referenced an unknown pending-secret dialogue",
            Self::OnceNotPersistable => "The `once` trust scope is never persisted",
            Self::EmptySecretName => "Secret names must be non-empty",
            Self::SandboxLaunchFailed => "The sandboxed subprocess could not be spawned",
            Self::SandboxTimeout => "The sandboxed subprocess exceeded its wall-clock timeout",
            Self::SandboxNonZero => "The sandboxed subprocess exited with a non-zero status",
            Self::IoError => "An I/O operation failed",
            Self::SerializationError => "JSON serialization or deserialization failed",
            Self::Internal => "An unexpected internal error occurred",
            Self::ConfigurationError => "The configuration is invalid or incomplete",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::error::Error for ErrorCode {}

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// Rich error value carrying an [`ErrorCode`], a human message, optional
/// structured context, and an optional source error.
///
/// This is the shape surfaced at component boundaries (Store, Coordinator,
/// Executor); crate-local errors use [`BrokerError`] and convert into this
/// when crossing into the HTTP layer.
pub struct ErrorInfo {
    /// The catalog error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary key-value context (deterministic ordering), e.g. `request_id`.
    pub context: BTreeMap<String, String>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ErrorInfo {
    /// Start building an [`ErrorInfo`] for the given code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Add a key-value context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)?;
        if !self.context.is_empty() {
            write!(f, " (")?;
            let mut first = true;
            for (k, v) in &self.context {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
                first = false;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorInfo")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("context", &self.context)
            .field("source", &self.source.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

impl std::error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// BrokerError — the crate-wide thiserror enum
// ---------------------------------------------------------------------------

/// Top-level error type shared across broker crates.
///
/// Component crates (`broker-store`, `broker-approval`, `broker-sandbox`, …)
/// define their own narrower `thiserror` enums for local pattern matching and
/// convert into this one at the boundary where a caller only needs the code
/// plus a message (HTTP responses, chat-prompt formatting, logs).
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BrokerError {
    /// The catalog error code.
    pub code: ErrorCode,
    /// Human-readable message, safe to surface externally.
    pub message: String,
}

impl BrokerError {
    /// Construct a new [`BrokerError`].
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_are_unique() {
        let codes = [
            ErrorCode::BadRequest,
            ErrorCode::FetchFailed,
            ErrorCode::BadMetadata,
            ErrorCode::RequestNotFound,
            ErrorCode::DuplicateRequestId,
            ErrorCode::TransitionConflict,
            ErrorCode::ChatSendFailed,
            ErrorCode::UnknownDialogue,
            ErrorCode::OnceNotPersistable,
            ErrorCode::EmptySecretName,
            ErrorCode::SandboxLaunchFailed,
            ErrorCode::SandboxTimeout,
            ErrorCode::SandboxNonZero,
            ErrorCode::IoError,
            ErrorCode::SerializationError,
            ErrorCode::Internal,
            ErrorCode::ConfigurationError,
        ];
        let mut seen = std::collections::HashSet::new();
        for c in codes {
            assert!(seen.insert(c.code()), "duplicate code: {}", c.code());
        }
    }

    #[test]
    fn error_info_context_renders_sorted() {
        let info = ErrorInfo::new(ErrorCode::Internal, "boom")
            .with_context("b", "2")
            .with_context("a", "1");
        assert_eq!(info.to_string(), "[BROKER-S003] boom (a=1, b=2)");
    }

    #[test]
    fn broker_error_display() {
        let e = BrokerError::new(ErrorCode::RequestNotFound, "no such request");
        assert_eq!(e.to_string(), "BROKER-R004: no such request");
    }
}
