use std::sync::Arc;

use quill_storage::{ThreadDocument, ThreadStore};
use quill_thread::{ThreadId, UserId};
use tokio::sync::mpsc;

/// Order-preserving writer for one thread's stored documents.
///
/// All writes for a thread funnel through a single worker task, so the
/// completion answer patch can never overtake the submitted-turn save it
/// depends on. Submitters never wait; failures are logged and swallowed, and
/// loss of durability never surfaces to the stream. The worker exits once
/// every queue clone is dropped.
#[derive(Clone)]
pub(crate) struct PersistQueue {
    sender: mpsc::UnboundedSender<WriteJob>,
}

enum WriteJob {
    SaveThread(ThreadDocument),
    PatchAnswer { chat_index: usize, answer: String },
}

impl PersistQueue {
    pub(crate) fn spawn(
        store: Arc<dyn ThreadStore>,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let result = match job {
                    WriteJob::SaveThread(document) => {
                        store.save_thread(user_id, thread_id, &document).await
                    }
                    WriteJob::PatchAnswer { chat_index, answer } => {
                        store
                            .patch_answer(user_id, thread_id, chat_index, &answer)
                            .await
                    }
                };
                if let Err(error) = result {
                    tracing::warn!(%thread_id, error = %error, "thread write failed");
                }
            }
        });
        Self { sender }
    }

    pub(crate) fn save_thread(&self, document: ThreadDocument) {
        let _ = self.sender.send(WriteJob::SaveThread(document));
    }

    pub(crate) fn patch_answer(&self, chat_index: usize, answer: String) {
        let _ = self.sender.send(WriteJob::PatchAnswer { chat_index, answer });
    }
}
