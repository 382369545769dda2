// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Best-effort notification delivery.
//!
//! Every terminal request transition produces exactly one notification.
//! Neither sink here is authoritative — the Request Store is — so a
//! delivery failure is logged and swallowed, never propagated back to the
//! caller driving the state transition.

use chrono::Utc;
use std::path::PathBuf;
use tracing::warn;

/// Emits best-effort notifications: an HTTP POST to a configured endpoint,
/// falling back to an append-only file when the endpoint is unset or
/// unreachable.
#[derive(Debug, Clone)]
pub struct NotificationEmitter {
    endpoint: Option<String>,
    fallback_file: PathBuf,
    client: reqwest::Client,
}

impl NotificationEmitter {
    /// Build an emitter. `endpoint`, if set, receives `POST {message}`;
    /// `fallback_file` is appended to on any endpoint failure (including a
    /// `None` endpoint).
    pub fn new(endpoint: Option<String>, fallback_file: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            fallback_file: fallback_file.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Emit one notification. Never returns an error — every failure mode
    /// is logged and this falls through to the file sink.
    pub async fn emit(&self, message: &str) {
        if let Some(endpoint) = &self.endpoint {
            match self
                .client
                .post(endpoint)
                .json(&serde_json::json!({ "message": message }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(target: "broker.notify", status = %resp.status(), "notification endpoint returned non-success");
                }
                Err(e) => {
                    warn!(target: "broker.notify", error = %e, "notification endpoint unreachable");
                }
            }
        }
        self.append_to_file(message).await;
    }

    async fn append_to_file(&self, message: &str) {
        let line = format!("{} {message}\n", Utc::now().to_rfc3339());
        if let Some(parent) = self.fallback_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(target: "broker.notify", error = %e, "failed to create notification file directory");
                return;
            }
        }
        use tokio::io::AsyncWriteExt;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_file)
            .await;
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!(target: "broker.notify", error = %e, "failed to append notification");
                }
            }
            Err(e) => {
                warn!(target: "broker.notify", error = %e, "failed to open notification file");
            }
        }
    }

    /// Build the notification text for a terminal request transition.
    #[must_use]
    pub fn terminal_message(
        request_id: uuid::Uuid,
        state: broker_core::RequestState,
        summary: &str,
    ) -> String {
        format!("request {request_id} -> {state}: {summary}")
    }
}
