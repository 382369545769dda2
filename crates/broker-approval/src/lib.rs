// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The approval state machine driver.
//!
//! Consumes two classes of inbound event — a freshly ingested [`Request`]
//! from Ingress, and a [`ChatEvent`] from the chat collaborator — and drives
//! requests through `pending -> approved -> (awaiting_secrets)? -> executing
//! -> {completed, failed}`, or to `denied`. Sandbox invocation is triggered
//! as a consequence of reaching `executing`, not a third inbound event
//! class: the Coordinator awaits it itself and folds the outcome back in.

use broker_chat::{Button, ChatEvent, ChatTransport, MessageHandle};
use broker_core::{ExecutionResult, Request, RequestState, TrustScope};
use broker_notify::NotificationEmitter;
use broker_sandbox::{SandboxExecutor, SandboxInput};
use broker_store::{RequestStore, StoreError};
use broker_trust::TrustCache;
use broker_vault::SecretVault;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors surfaced directly to the caller of [`Coordinator::submit`]. Event
/// handling (`handle_event`) never returns an error of its own — malformed
/// or stale events are logged and ignored, per the "tolerant of unknown
/// actions" and "double-click is a no-op" contract.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The store rejected the initial persist (e.g. duplicate id).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// State held for an in-flight secret-prompt dialogue. Process-local only;
/// losing it (e.g. on restart) degrades UX but never correctness — the
/// request simply sits in `awaiting_secrets` until re-approved is not
/// possible, but an operator can still supply the secret via `/add_secret`.
#[derive(Debug, Clone)]
struct PendingSecret {
    request_id: Uuid,
    secret_name: String,
}

/// Drives the approval lifecycle for every request in the system.
///
/// Cheaply cloneable: every field is itself a handle (`Arc`/clone-friendly
/// store wrapper), so a single `Coordinator` can be shared across the
/// Ingress API's handlers and the chat event loop.
#[derive(Clone)]
pub struct Coordinator {
    store: RequestStore,
    trust: TrustCache,
    vault: SecretVault,
    sandbox: SandboxExecutor,
    chat: Arc<dyn ChatTransport>,
    notify: NotificationEmitter,
    pending_secrets: Arc<Mutex<HashMap<MessageHandle, PendingSecret>>>,
}

impl Coordinator {
    /// Assemble a coordinator from its collaborators.
    pub fn new(
        store: RequestStore,
        trust: TrustCache,
        vault: SecretVault,
        sandbox: SandboxExecutor,
        chat: Arc<dyn ChatTransport>,
        notify: NotificationEmitter,
    ) -> Self {
        Self {
            store,
            trust,
            vault,
            sandbox,
            chat,
            notify,
            pending_secrets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ingest a freshly created, already-persisted request and emit its
    /// opening prompt. Prompt shape depends on whether the code's
    /// `(source_locator, fingerprint)` pair is currently trusted.
    pub async fn submit(&self, request: &Request) -> Result<(), CoordinatorError> {
        let now = chrono::Utc::now();
        let trusted = self
            .trust
            .is_trusted(&request.source_locator, &request.fingerprint, now)
            .await;
        let buttons = self.prompt_buttons(request.id, trusted);
        let text = render_prompt(request, trusted, &self.vault).await;
        let handle = match self.chat.send(&text, &buttons).await {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "broker.approval", error = %e, request_id = %request.id, "chat-send-failed");
                return Ok(());
            }
        };
        self.store
            .attach_chat_handle(request.id, handle.0)
            .await?;
        Ok(())
    }

    fn prompt_buttons(&self, id: Uuid, trusted: bool) -> Vec<Button> {
        let mut buttons = vec![
            Button::new(format!("approve:{id}:once"), "Approve once"),
            Button::new(format!("deny:{id}"), "Deny"),
        ];
        if !trusted {
            buttons.push(Button::new(format!("approve:{id}:forever"), "Trust this code"));
        }
        buttons
    }

    /// Handle one inbound chat event.
    pub async fn handle_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::ButtonClick { handle, payload } => {
                self.handle_button(&handle, &payload).await;
            }
            ChatEvent::TextMessage {
                handle,
                reply_to,
                text,
            } => {
                self.handle_text(reply_to.as_ref().unwrap_or(&handle), &text)
                    .await;
            }
        }
    }

    async fn handle_button(&self, handle: &MessageHandle, payload: &str) {
        let mut parts = payload.split(':');
        match parts.next() {
            Some("approve") => {
                let (Some(id_str), Some(scope_str)) = (parts.next(), parts.next()) else {
                    return;
                };
                let Ok(id) = id_str.parse::<Uuid>() else {
                    return;
                };
                let Some(scope) = TrustScope::parse(scope_str) else {
                    return;
                };
                self.handle_approve(id, scope).await;
            }
            Some("deny") => {
                let Some(Ok(id)) = parts.next().map(str::parse::<Uuid>) else {
                    return;
                };
                self.handle_deny(id).await;
            }
            Some("add_secret") => {
                let Some(name) = parts.next() else { return };
                let request_id = parts.next().and_then(|s| s.parse::<Uuid>().ok());
                self.handle_add_secret_command(name, request_id, handle)
                    .await;
            }
            _ => {
                // Tolerant of unknown actions, per the button-payload contract.
            }
        }
    }

    async fn handle_approve(&self, id: Uuid, scope: TrustScope) {
        let Some(request) = self.store.get(id).await else {
            return;
        };
        if scope.is_persistable() {
            let now = chrono::Utc::now();
            if let Err(e) = self
                .trust
                .grant(&request.source_locator, &request.fingerprint, scope, now)
                .await
            {
                warn!(target: "broker.approval", error = %e, request_id = %id, "trust grant failed");
            }
        }

        let approved = match self
            .store
            .transition(id, RequestState::Pending, RequestState::Approved, chrono::Utc::now())
            .await
        {
            Ok(req) => req,
            Err(StoreError::TransitionConflict { .. }) => return,
            Err(e) => {
                warn!(target: "broker.approval", error = %e, request_id = %id, "approve transition failed");
                return;
            }
        };

        self.advance_past_approval(approved).await;
    }

    /// After a request reaches `approved`, check for missing secrets and
    /// either open a secret-prompt dialogue or proceed straight to
    /// execution. Shared by the initial approval and by every subsequent
    /// secret-supplied step.
    async fn advance_past_approval(&self, request: Request) {
        let missing = self.vault.missing(&request.secrets).await;
        if let Some(next) = missing.first() {
            self.open_secret_prompt(&request, next).await;
            return;
        }

        match self
            .store
            .transition(
                request.id,
                RequestState::Approved,
                RequestState::Executing,
                chrono::Utc::now(),
            )
            .await
        {
            Ok(req) => self.invoke_sandbox(req).await,
            Err(e) => {
                warn!(target: "broker.approval", error = %e, request_id = %request.id, "executing transition failed");
            }
        }
    }

    async fn open_secret_prompt(&self, request: &Request, secret_name: &str) {
        let text = format!(
            "Skill `{}` needs secret `{secret_name}`. Reply with its value.",
            request.skill_id
        );
        let handle = match self.chat.send(&text, &[]).await {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "broker.approval", error = %e, request_id = %request.id, "chat-send-failed");
                return;
            }
        };
        if let Err(e) = self
            .store
            .transition(
                request.id,
                request.state,
                RequestState::AwaitingSecrets,
                chrono::Utc::now(),
            )
            .await
        {
            warn!(target: "broker.approval", error = %e, request_id = %request.id, "awaiting_secrets transition failed");
            return;
        }
        if let Err(e) = self
            .store
            .attach_chat_handle(request.id, handle.0.clone())
            .await
        {
            warn!(target: "broker.approval", error = %e, request_id = %request.id, "attach_chat_handle failed");
        }
        self.pending_secrets.lock().await.insert(
            handle,
            PendingSecret {
                request_id: request.id,
                secret_name: secret_name.to_string(),
            },
        );
    }

    async fn handle_deny(&self, id: Uuid) {
        let Some(request) = self.store.get(id).await else {
            return;
        };
        if request.state.is_terminal() {
            return;
        }
        let Ok(req) = self
            .store
            .transition(id, request.state, RequestState::Denied, chrono::Utc::now())
            .await
        else {
            return;
        };
        if let Some(handle) = req.chat_handle.clone().map(MessageHandle) {
            let _ = self.chat.edit(&handle, "Denied.", &[]).await;
        }
        self.notify
            .emit(&NotificationEmitter::terminal_message(
                id,
                RequestState::Denied,
                "denied by operator",
            ))
            .await;
    }

    async fn handle_add_secret_command(
        &self,
        name: &str,
        request_id: Option<Uuid>,
        _handle: &MessageHandle,
    ) {
        // Out-of-band `/add_secret` has no value attached to its own
        // payload in this slash-command shape; concrete transports that
        // support arguments should route the typed value through
        // `handle_text` instead. This path exists for transports whose
        // button already carries the value out-of-band (rare); here it's a
        // no-op beyond recomputing the missing set for the named request.
        if let Some(id) = request_id {
            if let Some(request) = self.store.get(id).await {
                if request.state == RequestState::AwaitingSecrets {
                    let _ = name;
                    self.advance_past_approval(request).await;
                }
            }
        }
    }

    async fn handle_text(&self, correlation: &MessageHandle, text: &str) {
        let pending = self.pending_secrets.lock().await.remove(correlation);
        let Some(pending) = pending else {
            return;
        };

        if let Err(e) = self
            .vault
            .put(&pending.secret_name, text.as_bytes().to_vec())
            .await
        {
            warn!(target: "broker.approval", error = %e, "failed to store supplied secret");
            return;
        }

        let _ = self.chat.delete(correlation).await;

        let Some(request) = self.store.get(pending.request_id).await else {
            return;
        };
        self.advance_past_approval(request).await;
    }

    async fn invoke_sandbox(&self, request: Request) {
        let code = match self.store.load_code(request.id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(request.id, format!("sandbox-launch-failed: {e}")).await;
                return;
            }
        };

        let mut secrets = BTreeMap::new();
        for name in &request.secrets {
            if let Some(value) = self.vault.get(name).await {
                secrets.insert(name.clone(), value);
            }
        }

        let input = SandboxInput {
            code,
            secrets,
            args: request.args.clone(),
            timeout_secs: request.metadata.timeout_secs,
            network_allow: request.metadata.network.clone(),
        };

        match self.sandbox.run(input).await {
            Ok(outcome) => {
                let terminal = if outcome.success {
                    RequestState::Completed
                } else {
                    RequestState::Failed
                };
                let result = ExecutionResult {
                    success: outcome.success,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    exit_code: outcome.exit_code,
                    duration_ms: outcome.duration_ms,
                    timed_out: outcome.timed_out,
                };
                let summary = format!(
                    "exit={:?} duration={}ms timed_out={}",
                    result.exit_code, result.duration_ms, result.timed_out
                );
                match self.store.set_result(request.id, terminal, result).await {
                    Ok(req) => self.finish_chat(&req, terminal, &summary).await,
                    Err(e) => {
                        warn!(target: "broker.approval", error = %e, request_id = %request.id, "failed to record sandbox result");
                    }
                }
            }
            Err(e) => {
                self.fail(request.id, format!("sandbox-launch-failed: {e}")).await;
            }
        }
    }

    async fn fail(&self, id: Uuid, reason: String) {
        match self.store.set_failure(id, reason.clone()).await {
            Ok(req) => self.finish_chat(&req, RequestState::Failed, &reason).await,
            Err(e) => {
                warn!(target: "broker.approval", error = %e, request_id = %id, "failed to record failure");
            }
        }
    }

    async fn finish_chat(&self, request: &Request, terminal: RequestState, summary: &str) {
        if let Some(handle) = request.chat_handle.clone().map(MessageHandle) {
            let text = format!("{terminal}: {summary}");
            let _ = self.chat.edit(&handle, &text, &[]).await;
        }
        self.notify
            .emit(&NotificationEmitter::terminal_message(
                request.id, terminal, summary,
            ))
            .await;
        info!(target: "broker.approval", request_id = %request.id, %terminal, "request reached terminal state");
    }
}

/// Render the full prompt payload: skill name, per-secret vault presence,
/// network allow-list, timeout, arguments, fingerprint prefix. The
/// code-view link itself is the caller's (daemon's) concern, since it
/// depends on the externally reachable base URL.
async fn render_prompt(request: &Request, trusted: bool, vault: &SecretVault) -> String {
    let mut lines = vec![format!(
        "Skill `{}` requests to run (fingerprint {}…).",
        request.skill_id,
        &request.fingerprint[..request.fingerprint.len().min(12)]
    )];
    if trusted {
        lines.push("This code is currently trusted.".to_string());
    }
    if !request.secrets.is_empty() {
        let mut secret_lines = Vec::new();
        for name in &request.secrets {
            let present = vault.get(name).await.is_some();
            secret_lines.push(format!("  - {name}: {}", if present { "present" } else { "missing" }));
        }
        lines.push(format!("Secrets:\n{}", secret_lines.join("\n")));
    }
    if !request.metadata.network.is_empty() {
        lines.push(format!("Network: {}", request.metadata.network.join(", ")));
    } else {
        lines.push("Network: none".to_string());
    }
    lines.push(format!("Timeout: {}s", request.metadata.timeout_secs));
    if !request.args.is_empty() {
        let args = request
            .args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Args: {args}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_chat::mock::MockTransport;
    use broker_config::SandboxMode;
    use broker_core::SkillMetadata;
    use std::collections::BTreeMap;

    async fn harness() -> (Coordinator, Arc<MockTransport>, RequestStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(dir.path().join("store")).await.unwrap();
        let trust = TrustCache::new(store.clone());
        let vault = SecretVault::hydrate(store.clone()).await.unwrap();
        let sandbox = SandboxExecutor::new(SandboxMode::Direct, dir.path().join("scratch"));
        let chat = Arc::new(MockTransport::new());
        let notify = NotificationEmitter::new(None, dir.path().join("notifications.log"));
        let coordinator = Coordinator::new(
            store.clone(),
            trust,
            vault,
            sandbox,
            chat.clone() as Arc<dyn ChatTransport>,
            notify,
        );
        (coordinator, chat, store, dir)
    }

    fn metadata(skill: &str, secrets: Vec<&str>, timeout: u32) -> SkillMetadata {
        SkillMetadata {
            skill: skill.to_string(),
            description: None,
            secrets: secrets.into_iter().map(String::from).collect(),
            network: Vec::new(),
            timeout_secs: timeout,
        }
    }

    async fn submit_request(
        coordinator: &Coordinator,
        store: &RequestStore,
        skill: &str,
        code: &[u8],
        secrets: Vec<&str>,
    ) -> Request {
        let meta = metadata(skill, secrets.clone(), 5);
        let request = Request::new(
            skill,
            "test://src",
            broker_core::fingerprint(code),
            secrets.into_iter().map(String::from).collect(),
            BTreeMap::new(),
            meta,
            chrono::Utc::now(),
        );
        store.create(request.clone()).await.unwrap();
        store.store_code(request.id, code).await.unwrap();
        coordinator.submit(&request).await.unwrap();
        request
    }

    #[tokio::test]
    async fn approve_once_with_no_secrets_runs_to_completion() {
        let (coordinator, chat, store, _dir) = harness().await;
        let code = b"#!/bin/sh\necho HELLO\nexit 0\n";
        let request = submit_request(&coordinator, &store, "hello", code, vec![]).await;

        coordinator
            .handle_event(ChatEvent::ButtonClick {
                handle: MessageHandle(store.get(request.id).await.unwrap().chat_handle.unwrap()),
                payload: format!("approve:{}:once", request.id),
            })
            .await;

        let req = store.get(request.id).await.unwrap();
        assert_eq!(req.state, RequestState::Completed);
        assert_eq!(req.result.as_ref().unwrap().stdout.trim(), "HELLO");
        let _ = chat;
    }

    #[tokio::test]
    async fn second_approve_click_is_a_no_op() {
        let (coordinator, _chat, store, _dir) = harness().await;
        let code = b"#!/bin/sh\nexit 0\n";
        let request = submit_request(&coordinator, &store, "hello", code, vec![]).await;
        let handle = MessageHandle(store.get(request.id).await.unwrap().chat_handle.unwrap());

        coordinator
            .handle_event(ChatEvent::ButtonClick {
                handle: handle.clone(),
                payload: format!("approve:{}:once", request.id),
            })
            .await;
        let after_first = store.get(request.id).await.unwrap();

        coordinator
            .handle_event(ChatEvent::ButtonClick {
                handle,
                payload: format!("deny:{}", request.id),
            })
            .await;
        let after_second = store.get(request.id).await.unwrap();

        assert_eq!(after_first.state, after_second.state);
        assert_eq!(after_first.revision, after_second.revision);
    }

    #[tokio::test]
    async fn deny_transitions_to_terminal_denied() {
        let (coordinator, _chat, store, _dir) = harness().await;
        let code = b"#!/bin/sh\nexit 0\n";
        let request = submit_request(&coordinator, &store, "hello", code, vec![]).await;

        coordinator
            .handle_event(ChatEvent::ButtonClick {
                handle: MessageHandle(store.get(request.id).await.unwrap().chat_handle.unwrap()),
                payload: format!("deny:{}", request.id),
            })
            .await;

        let req = store.get(request.id).await.unwrap();
        assert_eq!(req.state, RequestState::Denied);
    }

    #[tokio::test]
    async fn missing_secret_opens_prompt_then_completes_on_reply() {
        let (coordinator, _chat, store, _dir) = harness().await;
        let code = b"#!/bin/sh\necho \"K=$K\"\nexit 0\n";
        let request = submit_request(&coordinator, &store, "needs-secret", code, vec!["K"]).await;

        coordinator
            .handle_event(ChatEvent::ButtonClick {
                handle: MessageHandle(store.get(request.id).await.unwrap().chat_handle.unwrap()),
                payload: format!("approve:{}:once", request.id),
            })
            .await;

        let req = store.get(request.id).await.unwrap();
        assert_eq!(req.state, RequestState::AwaitingSecrets);
        let prompt_handle = MessageHandle(req.chat_handle.clone().unwrap());

        coordinator
            .handle_event(ChatEvent::TextMessage {
                handle: prompt_handle.clone(),
                reply_to: Some(prompt_handle),
                text: "v1".to_string(),
            })
            .await;

        let req = store.get(request.id).await.unwrap();
        assert_eq!(req.state, RequestState::Completed);
        assert!(req.result.as_ref().unwrap().stdout.contains("K=v1"));
    }

    #[tokio::test]
    async fn trust_forever_grants_trust_for_next_request() {
        let (coordinator, _chat, store, _dir) = harness().await;
        let code = b"#!/bin/sh\nexit 0\n";
        let r1 = submit_request(&coordinator, &store, "hello", code, vec![]).await;

        coordinator
            .handle_event(ChatEvent::ButtonClick {
                handle: MessageHandle(store.get(r1.id).await.unwrap().chat_handle.unwrap()),
                payload: format!("approve:{}:forever", r1.id),
            })
            .await;

        assert!(
            coordinator
                .trust
                .is_trusted(&r1.source_locator, &r1.fingerprint, chrono::Utc::now())
                .await
        );
    }
}
