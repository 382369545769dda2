//! An in-memory chat transport used by this crate's own tests and by
//! downstream crates (Approval Coordinator tests) that need a
//! [`ChatTransport`] without a live provider.

use crate::{Button, ChatError, ChatEvent, ChatTransport, MessageHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Records sent/edited message text by handle and queues injected events.
#[derive(Default)]
pub struct MockTransport {
    messages: Mutex<HashMap<MessageHandle, String>>,
    events: Mutex<Vec<ChatEvent>>,
}

impl MockTransport {
    /// Construct an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an inbound event as if the operator produced it. Call
    /// [`MockTransport::drain_events`] to observe it.
    pub fn inject(&self, event: ChatEvent) {
        self.events.lock().unwrap().push(event);
    }

    /// Take and clear all queued inbound events, in arrival order.
    pub fn drain_events(&self) -> Vec<ChatEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// The current text of a message, or `None` if never sent or deleted.
    pub fn current_text(&self, handle: &MessageHandle) -> Option<String> {
        self.messages.lock().unwrap().get(handle).cloned()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send(&self, text: &str, _buttons: &[Button]) -> Result<MessageHandle, ChatError> {
        let handle = MessageHandle::new();
        self.messages
            .lock()
            .unwrap()
            .insert(handle.clone(), text.to_string());
        Ok(handle)
    }

    async fn edit(
        &self,
        handle: &MessageHandle,
        text: &str,
        _buttons: &[Button],
    ) -> Result<(), ChatError> {
        let mut messages = self.messages.lock().unwrap();
        if !messages.contains_key(handle) {
            return Err(ChatError::UnknownHandle);
        }
        messages.insert(handle.clone(), text.to_string());
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), ChatError> {
        self.messages.lock().unwrap().remove(handle);
        Ok(())
    }
}
