use std::collections::HashMap;
use std::sync::Arc;

use quill_thread::{ThreadId, UserId};
use tokio::sync::RwLock;

use super::error::{ChatIndexOutOfRangeSnafu, NotFoundSnafu, StorageResult};
use super::{BoxFuture, ThreadDocument, ThreadStore};

/// In-memory document store for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryThreadStore {
    documents: Arc<RwLock<HashMap<(UserId, ThreadId), ThreadDocument>>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one stored document, if present.
    pub async fn document(
        &self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> Option<ThreadDocument> {
        self.documents
            .read()
            .await
            .get(&(user_id, thread_id))
            .cloned()
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl ThreadStore for MemoryThreadStore {
    fn save_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        document: &'a ThreadDocument,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.documents
                .write()
                .await
                .insert((user_id, thread_id), document.clone());
            Ok(())
        })
    }

    fn patch_answer<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        chat_index: usize,
        answer: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut documents = self.documents.write().await;
            let Some(document) = documents.get_mut(&(user_id, thread_id)) else {
                return NotFoundSnafu {
                    stage: "memory-patch-answer",
                    user_id,
                    thread_id,
                }
                .fail();
            };

            let chat_count = document.chats.len();
            let Some(chat) = document.chats.get_mut(chat_index) else {
                return ChatIndexOutOfRangeSnafu {
                    stage: "memory-patch-answer",
                    chat_index,
                    chat_count,
                }
                .fail();
            };

            chat.answer = answer.to_string();
            Ok(())
        })
    }

    fn load_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> BoxFuture<'a, StorageResult<Option<ThreadDocument>>> {
        Box::pin(async move { Ok(self.document(user_id, thread_id).await) })
    }
}
