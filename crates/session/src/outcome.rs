use quill_stream::{AnswerRequest, WireMessage, WireRole};
use quill_thread::{Message, Role, ThreadId};
use serde::{Deserialize, Serialize};

use super::params::AiParams;

/// Whether the attempt answers a new question or regenerates the last answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptKind {
    Fresh,
    Rewrite,
}

/// A plain, re-submittable description of one answer attempt.
///
/// Retrying a failed attempt re-submits this value as-is: a fresh request from
/// scratch with the identical context and parameter snapshot, never a resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerAttempt {
    pub thread_id: ThreadId,
    pub chat_index: usize,
    pub kind: AttemptKind,
    pub messages: Vec<Message>,
    pub params: AiParams,
}

impl AnswerAttempt {
    /// Maps the attempt onto the backend wire body.
    pub fn to_request(&self) -> AnswerRequest {
        AnswerRequest {
            messages: self
                .messages
                .iter()
                .map(|message| WireMessage::new(wire_role(message.role), message.content.clone()))
                .collect(),
            model: self.params.model.clone(),
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
            top_p: self.params.top_p,
            frequency_penalty: self.params.frequency_penalty,
            presence_penalty: self.params.presence_penalty,
        }
    }
}

fn wire_role(role: Role) -> WireRole {
    match role {
        Role::System => WireRole::System,
        Role::User => WireRole::User,
        Role::Assistant => WireRole::Assistant,
    }
}

/// Terminal result of one driven attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        text: String,
    },
    /// User abort; the partial text was kept and saved, not rolled back.
    Cancelled {
        text: String,
    },
    Failed {
        error_message: String,
        /// Re-submittable value for the "try again" path.
        retry: AnswerAttempt,
    },
}

impl Outcome {
    pub fn is_terminal_completion(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Cancelled { .. })
    }
}
