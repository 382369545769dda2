// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Abstract chat transport: the set of operations the Approval Coordinator
//! invokes on a chat collaborator, and the inbound events it consumes.
//!
//! No concrete backend (Telegram, Slack, ...) lives here. A message-passing
//! seam — [`ChatEvent`] values arriving over a channel — keeps the
//! Coordinator testable without a live transport: tests and the daemon both
//! construct a [`ChatTransport`] and push events through an
//! [`tokio::sync::mpsc`] channel the transport owns.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// An inline action button attached to a prompt message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    /// Machine-readable payload delivered back via [`ChatEvent::ButtonClick`].
    pub payload: String,
    /// Human-readable label.
    pub label: String,
}

impl Button {
    /// Construct a button from a payload/label pair.
    pub fn new(payload: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            label: label.into(),
        }
    }
}

/// An opaque handle to a sent chat message. Used to edit or delete it
/// in place. A weak reference in spirit: losing it degrades UX (the
/// operator dialogue can't be updated in place) but never correctness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageHandle(pub String);

impl MessageHandle {
    /// Mint a fresh, process-unique handle. Concrete transports that hand
    /// back a provider-native message id should prefer that instead.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// An inbound event from the chat collaborator, restricted by the
/// transport to a single configured operator principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The operator pressed an inline button.
    ButtonClick {
        /// The message the button was attached to.
        handle: MessageHandle,
        /// The button's payload.
        payload: String,
    },
    /// The operator sent a plain text reply, optionally in reply to a
    /// specific message (used to correlate a secret-prompt reply).
    TextMessage {
        /// The message this text was sent in the context of, if the
        /// transport can determine one.
        handle: MessageHandle,
        /// The message being replied to, if any.
        reply_to: Option<MessageHandle>,
        /// The message text.
        text: String,
    },
}

/// Transient, recoverable chat transport error. A send failure is logged
/// and the caller proceeds — it never reverts a Store transition.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The transport could not reach the chat provider.
    #[error("chat send failed: {0}")]
    SendFailed(String),
    /// The referenced message handle is unknown to the transport.
    #[error("unknown message handle")]
    UnknownHandle,
}

/// The operations the Approval Coordinator invokes on a chat collaborator.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a new message with optional inline buttons. Returns a handle
    /// usable for later edits/deletes.
    async fn send(&self, text: &str, buttons: &[Button]) -> Result<MessageHandle, ChatError>;

    /// Edit a message in place — the mechanism the Coordinator uses to
    /// reflect prompt -> approved -> secret-prompt -> result transitions
    /// without spamming new messages.
    async fn edit(
        &self,
        handle: &MessageHandle,
        text: &str,
        buttons: &[Button],
    ) -> Result<(), ChatError>;

    /// Delete a message. Used best-effort to remove a secret prompt and the
    /// operator's reply once a secret has been consumed; failure here is
    /// not a correctness concern.
    async fn delete(&self, handle: &MessageHandle) -> Result<(), ChatError>;
}

/// An in-memory [`ChatTransport`] for tests, including downstream crates'.
pub mod mock;

#[cfg(test)]
mod tests {
    use crate::mock::MockTransport;
    use super::*;

    #[tokio::test]
    async fn send_then_edit_then_delete_roundtrips() {
        let transport = MockTransport::new();
        let handle = transport
            .send("prompt", &[Button::new("approve-once", "Approve")])
            .await
            .unwrap();
        transport.edit(&handle, "approved", &[]).await.unwrap();
        assert_eq!(transport.current_text(&handle), Some("approved".to_string()));
        transport.delete(&handle).await.unwrap();
        assert_eq!(transport.current_text(&handle), None);
    }

    #[tokio::test]
    async fn edit_unknown_handle_errors() {
        let transport = MockTransport::new();
        let err = transport
            .edit(&MessageHandle::new(), "x", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnknownHandle));
    }

    #[tokio::test]
    async fn injected_events_are_observable_by_the_coordinator() {
        let transport = MockTransport::new();
        let handle = transport.send("prompt", &[]).await.unwrap();
        transport.inject(ChatEvent::ButtonClick {
            handle: handle.clone(),
            payload: "approve-once".to_string(),
        });
        let events = transport.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ChatEvent::ButtonClick {
                handle,
                payload: "approve-once".to_string(),
            }
        );
    }
}
