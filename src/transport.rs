//! Messaging transport abstraction.
//!
//! This module defines the `Transport` trait used to talk back to the submitter (status
//! messages, per-file errors, converted artifacts), enabling testability with a mock
//! implementation. The chat protocol itself lives outside this crate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::domain::file::{ChatId, MessageId};
use crate::error::{Result, VolleyError};

/// Trait for sending messages and files to a chat.
///
/// # Example
/// ```ignore
/// let handle = transport.send_message(chat, "⏳ Please wait...").await?;
/// transport.edit_message(chat, handle, "🔄 Converting 3 files...").await?;
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post a new text message and return its handle.
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageId>;

    /// Replace the text of an existing message.
    async fn edit_message(&self, chat: ChatId, message: MessageId, text: &str) -> Result<()>;

    /// Deliver a file with a caption.
    async fn send_artifact(
        &self,
        chat: ChatId,
        content: Bytes,
        filename: &str,
        caption: &str,
    ) -> Result<()>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// What kind of transport call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Send,
    Edit,
    Artifact,
}

/// Record of a call made to the mock transport.
#[derive(Debug, Clone)]
pub struct TransportCall {
    pub kind: CallKind,
    pub chat: ChatId,
    /// Handle returned by a send, or targeted by an edit
    pub message: Option<MessageId>,
    /// Message text, or caption for artifacts
    pub text: String,
    pub filename: Option<String>,
    pub size: usize,
    pub at: tokio::time::Instant,
}

/// Mock transport for testing.
///
/// Records every call with the (possibly paused) tokio instant it was made at, and can
/// be told to fail specific kinds of calls.
///
/// # Example
/// ```ignore
/// let transport = MockTransport::new();
/// transport.fail_next(CallKind::Edit, "message is not modified");
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    failures: Arc<Mutex<VecDeque<(CallKind, String)>>>,
    fail_all: Arc<Mutex<Vec<CallKind>>>,
    panics: Arc<Mutex<Vec<CallKind>>>,
    send_latency: Arc<Mutex<Duration>>,
    next_message_id: Arc<AtomicI64>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            next_message_id: Arc::new(AtomicI64::new(1000)),
            ..Default::default()
        }
    }

    /// Make the next call of this kind fail with the given message.
    pub fn fail_next(&self, kind: CallKind, message: &str) {
        self.failures.lock().push_back((kind, message.to_string()));
    }

    /// Make every call of this kind fail until [`MockTransport::heal`] is called.
    pub fn fail_always(&self, kind: CallKind) {
        self.fail_all.lock().push(kind);
    }

    /// Panic on the next call of this kind.
    pub fn panic_next(&self, kind: CallKind) {
        self.panics.lock().push(kind);
    }

    /// Make every `send_message` take this long before it returns a handle.
    pub fn set_send_latency(&self, latency: Duration) {
        *self.send_latency.lock() = latency;
    }

    pub fn heal(&self) {
        self.fail_all.lock().clear();
        self.failures.lock().clear();
        self.panics.lock().clear();
    }

    /// Get all calls that have been made to this mock transport.
    pub fn get_calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<TransportCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    /// Texts of every edit targeting the given message, in order.
    pub fn edits_of(&self, message: MessageId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.kind == CallKind::Edit && c.message == Some(message))
            .map(|c| c.text.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn check_failure(&self, kind: CallKind) -> Result<()> {
        let panicking = {
            let mut panics = self.panics.lock();
            match panics.iter().position(|k| *k == kind) {
                Some(pos) => {
                    panics.remove(pos);
                    true
                }
                None => false,
            }
        };
        if panicking {
            panic!("mock transport panicked on {:?}", kind);
        }

        if self.fail_all.lock().contains(&kind) {
            return Err(VolleyError::Transport(format!("{:?} unavailable", kind)));
        }
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|(k, _)| *k == kind)
            && let Some((_, message)) = failures.remove(pos)
        {
            return Err(VolleyError::Transport(message));
        }
        Ok(())
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        let latency = *self.send_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_failure(CallKind::Send)?;
        let message = MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst));
        self.record(TransportCall {
            kind: CallKind::Send,
            chat,
            message: Some(message),
            text: text.to_string(),
            filename: None,
            size: 0,
            at: tokio::time::Instant::now(),
        });
        Ok(message)
    }

    async fn edit_message(&self, chat: ChatId, message: MessageId, text: &str) -> Result<()> {
        self.check_failure(CallKind::Edit)?;
        self.record(TransportCall {
            kind: CallKind::Edit,
            chat,
            message: Some(message),
            text: text.to_string(),
            filename: None,
            size: 0,
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }

    async fn send_artifact(
        &self,
        chat: ChatId,
        content: Bytes,
        filename: &str,
        caption: &str,
    ) -> Result<()> {
        self.check_failure(CallKind::Artifact)?;
        self.record(TransportCall {
            kind: CallKind::Artifact,
            chat,
            message: None,
            text: caption.to_string(),
            filename: Some(filename.to_string()),
            size: content.len(),
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }
}
