use snafu::ensure;

use super::error::{NothingToRewriteSnafu, ThreadResult};
use super::message::{ChatMode, ChatThread, Message, Role};

/// Model forced for image-turn rewrites so their semantics stay reproducible
/// regardless of the caller-selected model.
pub const IMAGE_REWRITE_MODEL: &str = "gpt-4o";

/// Separator between a question and attached extra data in the user message.
const EXTRA_DATA_SEPARATOR: &str = "\n\n";

/// Request context for regenerating the most recent answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    pub messages: Vec<Message>,
    /// Overrides the caller-supplied model when set.
    pub forced_model: Option<String>,
}

/// Builds the message sequence for a fresh answer: the prior transcript plus
/// the new user message, with optional attached data folded into it.
pub fn build_initial_context(
    thread: &ChatThread,
    question: &str,
    extra_data: Option<&str>,
) -> Vec<Message> {
    let mut messages = thread.messages.clone();

    let content = match extra_data.filter(|data| !data.trim().is_empty()) {
        Some(data) => format!("{question}{EXTRA_DATA_SEPARATOR}{data}"),
        None => question.to_string(),
    };
    messages.push(Message::user(content));

    messages
}

/// Builds the message sequence for rewriting the last turn's answer.
///
/// The finalized answer being rewritten is dropped; earlier turns are replayed
/// as alternating user/assistant pairs under the original system message, and
/// the most recent user message is re-appended last. A non-empty
/// `custom_prompt` lands immediately before that final user message so it
/// applies only to the regenerated turn.
pub fn build_rewrite_context(
    thread: &ChatThread,
    custom_prompt: Option<&str>,
) -> ThreadResult<RewriteContext> {
    let Some(last_chat) = thread.last_chat() else {
        return NothingToRewriteSnafu {
            stage: "build-rewrite-context-empty-thread",
        }
        .fail();
    };
    ensure!(
        last_chat.has_answer(),
        NothingToRewriteSnafu {
            stage: "build-rewrite-context",
        }
    );

    let mut messages = Vec::new();

    if let Some(system) = thread
        .messages
        .iter()
        .find(|message| message.role == Role::System)
    {
        messages.push(system.clone());
    }

    for chat in &thread.chats[..thread.chats.len() - 1] {
        messages.push(Message::user(chat.question.clone()));
        if chat.has_answer() {
            messages.push(Message::assistant(chat.answer.clone()));
        }
    }

    if let Some(prompt) = custom_prompt.filter(|prompt| !prompt.is_empty()) {
        messages.push(Message::system(prompt));
    }

    // The transcript is the source of truth for the final user message, but a
    // desynchronized thread may hold no matching entry; fall back to the raw
    // question rather than refusing the rewrite.
    let final_user_content = thread
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.content.clone())
        .unwrap_or_else(|| last_chat.question.clone());
    messages.push(Message::user(final_user_content));

    let forced_model =
        (last_chat.mode == ChatMode::Image).then(|| IMAGE_REWRITE_MODEL.to_string());

    Ok(RewriteContext {
        messages,
        forced_model,
    })
}
