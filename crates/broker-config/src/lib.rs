// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the execution broker.
//!
//! This crate provides [`BrokerConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The default timeout is unusually large.
    LargeTimeout {
        /// Timeout value in seconds.
        secs: u64,
    },
    /// The ingress bind address is not restricted to loopback, which widens
    /// exposure of the admin secret-writing routes beyond what the design
    /// assumes.
    NonLoopbackBind {
        /// The configured bind address.
        addr: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeTimeout { secs } => {
                write!(f, "default timeout is unusually large ({secs}s)")
            }
            ConfigWarning::NonLoopbackBind { addr } => {
                write!(
                    f,
                    "bind address '{addr}' is not loopback-only; admin routes are not hardened for remote callers"
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Deployment mode for the Sandbox Executor.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMode {
    /// Run skills directly; assumes the executor itself already sits inside
    /// an outer isolation boundary (e.g. a confidential VM).
    Direct,
    /// Run skills through a configurable container runtime wrapper.
    Containerized {
        /// The runtime binary to shell out through (e.g. `runsc`, `firejail`).
        runtime_command: String,
        /// Extra arguments prepended before the skill's own command line.
        #[serde(default)]
        runtime_args: Vec<String>,
    },
}

impl Default for SandboxMode {
    fn default() -> Self {
        Self::Direct
    }
}

/// Top-level runtime configuration for the execution broker.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Address the Ingress API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory for the Request Store's durable JSON-per-row layout.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Deployment mode for the Sandbox Executor.
    #[serde(default)]
    pub sandbox_mode: SandboxMode,

    /// Wall-clock timeout applied to a skill that declares none, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u32,

    /// Loopback endpoint the Notification Emitter POSTs terminal events to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_endpoint: Option<String>,

    /// Fallback append-only file for notifications when the endpoint POST fails.
    #[serde(default = "default_notification_file")]
    pub notification_file: String,

    /// Chat principal (user/account id) permitted to act as the approving
    /// operator; inbound chat events from any other principal are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_principal: Option<String>,

    /// Age, in seconds, beyond which the Background Janitor may reap
    /// completed requests. `None` disables reaping (retention is indefinite).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_horizon_secs: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store_dir: default_store_dir(),
            log_level: Some("info".into()),
            sandbox_mode: SandboxMode::default(),
            default_timeout_secs: default_timeout_secs(),
            notification_endpoint: None,
            notification_file: default_notification_file(),
            operator_principal: None,
            retention_horizon_secs: None,
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_store_dir() -> String {
    "./broker-data".to_string()
}

fn default_timeout_secs() -> u32 {
    broker_core_default_timeout()
}

// Mirrors `broker_core::DEFAULT_TIMEOUT_SECS` without taking a dependency
// edge from config onto the contract crate; the two are kept in sync by a
// unit test below.
const fn broker_core_default_timeout() -> u32 {
    30
}

fn default_notification_file() -> String {
    "./broker-data/notifications.log".to_string()
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum allowed timeout in seconds (24 hours).
const MAX_TIMEOUT_SECS: u32 = 86_400;

/// Threshold above which a timeout generates a warning.
const LARGE_TIMEOUT_THRESHOLD: u32 = 3_600;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`BrokerConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`BrokerConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<BrokerConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => BrokerConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`BrokerConfig`].
pub fn parse_toml(content: &str) -> Result<BrokerConfig, ConfigError> {
    toml::from_str::<BrokerConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `BROKER_BIND_ADDR`
/// - `BROKER_STORE_DIR`
/// - `BROKER_LOG_LEVEL`
/// - `BROKER_DEFAULT_TIMEOUT_SECS`
/// - `BROKER_NOTIFICATION_ENDPOINT`
/// - `BROKER_OPERATOR_PRINCIPAL`
/// - `BROKER_RETENTION_HORIZON_SECS`
pub fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Ok(val) = std::env::var("BROKER_BIND_ADDR") {
        config.bind_addr = val;
    }
    if let Ok(val) = std::env::var("BROKER_STORE_DIR") {
        config.store_dir = val;
    }
    if let Ok(val) = std::env::var("BROKER_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("BROKER_DEFAULT_TIMEOUT_SECS")
        && let Ok(n) = val.parse::<u32>()
    {
        config.default_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("BROKER_NOTIFICATION_ENDPOINT") {
        config.notification_endpoint = Some(val);
    }
    if let Ok(val) = std::env::var("BROKER_OPERATOR_PRINCIPAL") {
        config.operator_principal = Some(val);
    }
    if let Ok(val) = std::env::var("BROKER_RETENTION_HORIZON_SECS")
        && let Ok(n) = val.parse::<u64>()
    {
        config.retention_horizon_secs = Some(n);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, out-of-range timeout, unparseable bind
/// address) are returned as a [`ConfigError::ValidationError`]; soft issues
/// come back as warnings.
pub fn validate_config(config: &BrokerConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.default_timeout_secs == 0 || config.default_timeout_secs > MAX_TIMEOUT_SECS {
        errors.push(format!(
            "default_timeout_secs {} out of range (1..{MAX_TIMEOUT_SECS})",
            config.default_timeout_secs
        ));
    } else if config.default_timeout_secs > LARGE_TIMEOUT_THRESHOLD {
        warnings.push(ConfigWarning::LargeTimeout {
            secs: u64::from(config.default_timeout_secs),
        });
    }

    match config.bind_addr.parse::<std::net::SocketAddr>() {
        Ok(addr) if !addr.ip().is_loopback() => {
            warnings.push(ConfigWarning::NonLoopbackBind {
                addr: config.bind_addr.clone(),
            });
        }
        Ok(_) => {}
        Err(_) => errors.push(format!("invalid bind_addr '{}'", config.bind_addr)),
    }

    if let SandboxMode::Containerized {
        runtime_command, ..
    } = &config.sandbox_mode
        && runtime_command.trim().is_empty()
    {
        errors.push("sandbox_mode: containerized runtime_command must not be empty".into());
    }

    if config.operator_principal.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "operator_principal".into(),
            hint: "inbound chat events from any principal will be accepted".into(),
        });
    }
    if config.notification_endpoint.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "notification_endpoint".into(),
            hint: "notifications will only be appended to notification_file".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`
/// whenever `overlay` differs from a freshly-defaulted config.
pub fn merge_configs(base: BrokerConfig, overlay: BrokerConfig) -> BrokerConfig {
    let default = BrokerConfig::default();
    BrokerConfig {
        bind_addr: pick(overlay.bind_addr, base.bind_addr, default.bind_addr),
        store_dir: pick(overlay.store_dir, base.store_dir, default.store_dir),
        log_level: overlay.log_level.or(base.log_level),
        sandbox_mode: if overlay.sandbox_mode == default.sandbox_mode {
            base.sandbox_mode
        } else {
            overlay.sandbox_mode
        },
        default_timeout_secs: pick(
            overlay.default_timeout_secs,
            base.default_timeout_secs,
            default.default_timeout_secs,
        ),
        notification_endpoint: overlay.notification_endpoint.or(base.notification_endpoint),
        notification_file: pick(
            overlay.notification_file,
            base.notification_file,
            default.notification_file,
        ),
        operator_principal: overlay.operator_principal.or(base.operator_principal),
        retention_horizon_secs: overlay
            .retention_horizon_secs
            .or(base.retention_horizon_secs),
    }
}

fn pick<T: PartialEq>(overlay: T, base: T, default: T) -> T {
    if overlay == default { base } else { overlay }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
