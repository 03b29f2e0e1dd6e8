use std::future::Future;
use std::pin::Pin;

use quill_thread::{Chat, ChatThread, Message, ThreadId, UserId};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryThreadStore;
pub use sqlite::SqliteThreadStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persisted document shape: both denormalized views of one conversation,
/// keyed by `(user_id, thread_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDocument {
    pub messages: Vec<Message>,
    pub chats: Vec<Chat>,
}

impl ThreadDocument {
    pub fn new(messages: Vec<Message>, chats: Vec<Chat>) -> Self {
        Self { messages, chats }
    }
}

impl From<&ChatThread> for ThreadDocument {
    fn from(thread: &ChatThread) -> Self {
        Self {
            messages: thread.messages.clone(),
            chats: thread.chats.clone(),
        }
    }
}

/// Write-through store for finalized conversation state.
///
/// Both write shapes are idempotent: re-applying the same write leaves the
/// stored document unchanged beyond the second write being a no-op delta.
pub trait ThreadStore: Send + Sync {
    /// Bulk overwrite of the whole document.
    fn save_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        document: &'a ThreadDocument,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Targeted patch of `chats[chat_index].answer` only.
    fn patch_answer<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        chat_index: usize,
        answer: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;

    fn load_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> BoxFuture<'a, StorageResult<Option<ThreadDocument>>>;
}
