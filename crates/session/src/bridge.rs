use quill_thread::{Message, ThreadId};

/// External subscriber the session publishes partial and final text to.
///
/// Publishes are fire-and-forget and at-least-once; every partial publish
/// carries the full accumulated text so far, so the receiver converges on the
/// latest value even when rapid publishes are coalesced. Publishes for one
/// `(thread_id, chat_index)` key are strictly ordered relative to each other.
pub trait SubscriberBridge: Send + Sync {
    fn publish_partial(&self, thread_id: ThreadId, chat_index: usize, text: &str);

    fn publish_message_update(&self, thread_id: ThreadId, message_index: usize, message: &Message);
}

/// Caller-visible signal snapshot, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub loading: bool,
    pub streaming: bool,
    pub completed: bool,
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Request in flight; any previous error is cleared.
    pub fn requesting() -> Self {
        Self {
            loading: true,
            ..Self::default()
        }
    }

    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    /// Cancellation is a form of completion, not an error.
    pub fn cancelled() -> Self {
        Self::completed()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}
