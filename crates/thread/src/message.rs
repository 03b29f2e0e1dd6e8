use serde::{Deserialize, Serialize};

use super::ids::ThreadId;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the raw conversation transcript. Immutable once appended,
/// except for the reconciliation performed by [`ChatThread::finalize_answer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Generation mode of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ChatMode {
    #[default]
    Text,
    Image,
}

/// One question/answer turn. The answer stays empty while an attempt is in
/// flight and is treated as immutable after finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub question: String,
    pub answer: String,
    pub mode: ChatMode,
}

impl Chat {
    pub fn new(question: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            question: question.into(),
            answer: String::new(),
            mode,
        }
    }

    pub fn answered(question: impl Into<String>, answer: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            mode,
        }
    }

    pub fn has_answer(&self) -> bool {
        !self.answer.is_empty()
    }
}

/// Positions touched by one [`ChatThread::finalize_answer`] call.
///
/// `message_index` is `None` when no assistant message existed; the transcript
/// half of the update is then a no-op while the chat half still applies. The
/// two views are parallel projections and may transiently disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizedAnswer {
    pub chat_index: usize,
    pub message_index: Option<usize>,
}

/// A full conversation: the turn-structured view and the raw transcript view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: ThreadId,
    pub messages: Vec<Message>,
    pub chats: Vec<Chat>,
}

impl ChatThread {
    /// Creates an empty conversation.
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            chats: Vec::new(),
        }
    }

    /// Appends a new unanswered turn and its user transcript entry.
    ///
    /// Returns the index of the new chat, which addresses all partial-answer
    /// publishes for the attempt that answers it.
    pub fn push_turn(&mut self, question: impl Into<String>, mode: ChatMode) -> usize {
        let question = question.into();
        self.messages.push(Message::user(question.clone()));
        self.chats.push(Chat::new(question, mode));
        self.chats.len() - 1
    }

    /// Appends an assistant transcript entry.
    pub fn push_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    pub fn last_chat(&self) -> Option<&Chat> {
        self.chats.last()
    }

    pub fn last_chat_index(&self) -> Option<usize> {
        self.chats.len().checked_sub(1)
    }

    /// Index of the most recent assistant transcript entry, searched from the end.
    pub fn last_assistant_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|message| message.role == Role::Assistant)
    }

    /// Writes the finalized answer into both views: the last chat first, then
    /// the last assistant message. The message half is a no-op when no
    /// assistant entry exists.
    ///
    /// Returns `None` when the thread has no turns at all.
    pub fn finalize_answer(&mut self, text: &str) -> Option<FinalizedAnswer> {
        let chat_index = self.last_chat_index()?;
        self.chats[chat_index].answer = text.to_string();

        let message_index = self.last_assistant_index();
        if let Some(index) = message_index {
            self.messages[index].content = text.to_string();
        }

        Some(FinalizedAnswer {
            chat_index,
            message_index,
        })
    }
}
