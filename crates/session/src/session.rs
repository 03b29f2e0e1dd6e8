use std::sync::{Arc, Mutex};

use quill_storage::{ThreadDocument, ThreadStore};
use quill_stream::{AnswerBackend, BoxFuture, StreamError};
use quill_thread::{
    ChatMode, ChatThread, FinalizedAnswer, ThreadId, UserId, build_initial_context,
    build_rewrite_context,
};
use snafu::Snafu;
use tokio::sync::{RwLock, watch};

use super::bridge::{SessionStatus, SubscriberBridge};
use super::cancel::{CancelHandle, CancelSignal};
use super::outcome::{AnswerAttempt, AttemptKind, Outcome};
use super::params::{AiDefaultsStore, AiOverrides};
use super::persist::PersistQueue;
use super::phase::{AttemptId, PhaseTransition, SessionKey, SessionPhase, SessionTarget};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display(
        "another attempt is already hot for thread '{thread_id}' chat {chat_index}"
    ))]
    AttemptInFlight {
        stage: &'static str,
        thread_id: ThreadId,
        chat_index: usize,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Capabilities one session depends on. Injected at construction; the session
/// never reaches into ambient global state.
#[derive(Clone)]
pub struct SessionDeps {
    pub backend: Arc<dyn AnswerBackend>,
    pub bridge: Arc<dyn SubscriberBridge>,
    pub store: Arc<dyn ThreadStore>,
    pub defaults: AiDefaultsStore,
    /// Persistence is skipped entirely for anonymous use.
    pub user: Option<UserId>,
}

/// Caller's view of one running attempt: latest status plus the abort handle.
pub struct SessionHandle {
    target: SessionTarget,
    status: watch::Receiver<SessionStatus>,
    cancel: Arc<CancelHandle>,
}

impl SessionHandle {
    pub fn target(&self) -> SessionTarget {
        self.target
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// User-initiated abort. A no-op once the attempt is terminal.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }
}

pub type SessionDriver = BoxFuture<'static, Outcome>;

/// One started attempt: the caller keeps the handle and drives (or spawns)
/// the driver future to completion.
pub struct AttemptRun {
    pub handle: SessionHandle,
    pub driver: SessionDriver,
}

/// Per-thread orchestrator for answer attempts.
///
/// Holds the lifecycle phase that enforces the one-hot-attempt rule per
/// `(thread_id, chat_index)` and mints a fresh attempt id per submit/retry.
pub struct ThreadSession {
    deps: SessionDeps,
    thread: Arc<RwLock<ChatThread>>,
    phase: Arc<Mutex<SessionPhase>>,
    persist: Option<PersistQueue>,
    next_attempt: u64,
}

impl ThreadSession {
    pub fn new(deps: SessionDeps, thread: Arc<RwLock<ChatThread>>) -> Self {
        Self {
            deps,
            thread,
            phase: Arc::new(Mutex::new(SessionPhase::Idle)),
            persist: None,
            next_attempt: 0,
        }
    }

    pub fn thread(&self) -> Arc<RwLock<ChatThread>> {
        Arc::clone(&self.thread)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
            .lock()
            .map(|phase| phase.clone())
            .unwrap_or_default()
    }

    /// Starts an attempt answering a new question.
    ///
    /// The new turn is appended to the thread before the request goes out;
    /// the request context holds the prior transcript plus the new user
    /// message, with `extra_data` folded in.
    pub async fn begin_answer(
        &mut self,
        question: &str,
        mode: ChatMode,
        extra_data: Option<&str>,
        overrides: &AiOverrides,
    ) -> SessionResult<AttemptRun> {
        let (thread_id, chat_index, messages, document) = {
            let mut thread = self.thread.write().await;
            // A rejected start must leave the thread untouched, so the
            // one-hot-attempt rule is checked before anything is appended.
            self.ensure_not_hot(thread.id, thread.chats.len())?;
            let messages = build_initial_context(&thread, question, extra_data);
            let chat_index = thread.push_turn(question, mode);
            (thread.id, chat_index, messages, ThreadDocument::from(&*thread))
        };

        // The submitted question is saved right away; the answer is patched in
        // on completion.
        if let Some(queue) = self.persist_queue(thread_id) {
            queue.save_thread(document);
        }

        let params = overrides.resolve(&self.deps.defaults.snapshot());
        self.start(AnswerAttempt {
            thread_id,
            chat_index,
            kind: AttemptKind::Fresh,
            messages,
            params,
        })
    }

    /// Starts an attempt regenerating the last turn's answer.
    ///
    /// Returns `Ok(None)` without issuing any request when the last turn has
    /// no answer yet: rewriting an unanswered turn is simply disallowed, not
    /// a reportable error.
    pub async fn begin_rewrite(
        &mut self,
        overrides: &AiOverrides,
    ) -> SessionResult<Option<AttemptRun>> {
        let defaults = self.deps.defaults.snapshot();
        let custom_prompt =
            (!defaults.custom_prompt.is_empty()).then_some(defaults.custom_prompt.as_str());

        let (thread_id, chat_index, context) = {
            let thread = self.thread.read().await;
            match build_rewrite_context(&thread, custom_prompt) {
                Ok(context) => {
                    let Some(chat_index) = thread.last_chat_index() else {
                        return Ok(None);
                    };
                    (thread.id, chat_index, context)
                }
                Err(error) => {
                    tracing::debug!(thread_id = %thread.id, error = %error, "rewrite skipped");
                    return Ok(None);
                }
            }
        };

        let mut params = overrides.resolve(&defaults);
        if let Some(model) = context.forced_model {
            params.model = model;
        }

        let run = self.start(AnswerAttempt {
            thread_id,
            chat_index,
            kind: AttemptKind::Rewrite,
            messages: context.messages,
            params,
        })?;
        Ok(Some(run))
    }

    /// Re-submits a failed attempt from scratch: a fresh request, not a resume.
    pub fn resume(&mut self, attempt: AnswerAttempt) -> SessionResult<AttemptRun> {
        self.start(attempt)
    }

    /// Rejects a new attempt while another is still hot.
    ///
    /// Phase can only move into a hot state through `&mut self`, so a clear
    /// check here cannot be invalidated before `start` applies `Begin`.
    fn ensure_not_hot(&self, thread_id: ThreadId, chat_index: usize) -> SessionResult<()> {
        let hot = self.phase.lock().ok().and_then(|phase| phase.hot_target());
        if let Some(active) = hot {
            tracing::warn!(
                thread_id = %thread_id,
                chat_index,
                active_attempt = active.attempt_id.0,
                "rejected concurrent attempt"
            );
            return AttemptInFlightSnafu {
                stage: "begin-answer-while-hot",
                thread_id,
                chat_index,
            }
            .fail();
        }
        Ok(())
    }

    /// Lazily starts the per-thread write worker; `None` for anonymous use.
    fn persist_queue(&mut self, thread_id: ThreadId) -> Option<PersistQueue> {
        if self.persist.is_none() {
            let user_id = self.deps.user?;
            self.persist = Some(PersistQueue::spawn(
                Arc::clone(&self.deps.store),
                user_id,
                thread_id,
            ));
        }
        self.persist.clone()
    }

    fn start(&mut self, attempt: AnswerAttempt) -> SessionResult<AttemptRun> {
        self.next_attempt += 1;
        let target = SessionTarget::new(
            SessionKey::new(attempt.thread_id, attempt.chat_index),
            AttemptId::new(self.next_attempt),
        );

        {
            let Ok(mut phase) = self.phase.lock() else {
                return AttemptInFlightSnafu {
                    stage: "start-attempt-lock",
                    thread_id: attempt.thread_id,
                    chat_index: attempt.chat_index,
                }
                .fail();
            };
            match phase.apply(PhaseTransition::Begin(target)) {
                Ok(next) => *phase = next,
                Err(rejection) => {
                    tracing::warn!(
                        thread_id = %attempt.thread_id,
                        chat_index = attempt.chat_index,
                        ?rejection,
                        "rejected concurrent attempt"
                    );
                    return AttemptInFlightSnafu {
                        stage: "start-attempt-begin",
                        thread_id: attempt.thread_id,
                        chat_index: attempt.chat_index,
                    }
                    .fail();
                }
            }
        }

        let (status_tx, status_rx) = watch::channel(SessionStatus::requesting());
        let (cancel_handle, cancel_signal) = CancelHandle::new_pair();

        let persist = self.persist_queue(attempt.thread_id);
        let driver = AttemptDriver {
            deps: self.deps.clone(),
            thread: Arc::clone(&self.thread),
            phase: Arc::clone(&self.phase),
            persist,
            status: status_tx,
            attempt,
            target,
        };

        Ok(AttemptRun {
            handle: SessionHandle {
                target,
                status: status_rx,
                cancel: Arc::new(cancel_handle),
            },
            driver: Box::pin(driver.run(cancel_signal)),
        })
    }
}

/// How the chunk loop ended; decides the terminal path.
enum StreamEnd {
    Completed(String),
    Cancelled(String),
    Failed(StreamError),
}

struct AttemptDriver {
    deps: SessionDeps,
    thread: Arc<RwLock<ChatThread>>,
    phase: Arc<Mutex<SessionPhase>>,
    persist: Option<PersistQueue>,
    status: watch::Sender<SessionStatus>,
    attempt: AnswerAttempt,
    target: SessionTarget,
}

impl AttemptDriver {
    async fn run(self, mut cancel: CancelSignal) -> Outcome {
        let request = self.attempt.to_request();
        tracing::debug!(
            thread_id = %self.attempt.thread_id,
            chat_index = self.attempt.chat_index,
            attempt_id = self.target.attempt_id.0,
            model = %self.attempt.params.model,
            "opening answer stream"
        );

        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.deps.backend.open(&request) => Some(result),
        };
        let mut stream = match opened {
            // Abort landed while the request was in flight: nothing
            // accumulated, the thread state is left untouched.
            None => return self.finish_cancelled(String::new()).await,
            Some(Err(error)) => return self.finish_failed(error),
            Some(Ok(stream)) => stream,
        };

        self.transition(PhaseTransition::StreamOpened(self.target));
        let _ = self.status.send(SessionStatus::streaming());

        let mut accumulated = String::new();
        let end = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                chunk = stream.next_chunk() => Some(chunk),
            };
            match next {
                None => break StreamEnd::Cancelled(accumulated),
                Some(Ok(Some(fragment))) => {
                    accumulated.push_str(&fragment);
                    // Publish the full buffer, not the delta, so the bridge
                    // converges even when publishes are coalesced.
                    self.deps.bridge.publish_partial(
                        self.attempt.thread_id,
                        self.attempt.chat_index,
                        &accumulated,
                    );
                }
                Some(Ok(None)) => break StreamEnd::Completed(accumulated),
                Some(Err(error)) => break StreamEnd::Failed(error),
            }
        };
        // Release the connection before any finalization work.
        drop(stream);

        match end {
            StreamEnd::Completed(text) => self.finish_completed(text).await,
            StreamEnd::Cancelled(text) => self.finish_cancelled(text).await,
            StreamEnd::Failed(error) => self.finish_failed(error),
        }
    }

    async fn finish_completed(self, text: String) -> Outcome {
        self.transition(PhaseTransition::Complete(self.target));

        let (message_update, document) = {
            let mut thread = self.thread.write().await;
            let finalized = Self::write_answer(self.attempt.kind, &mut thread, &text);
            let message_update = match (self.attempt.kind, finalized) {
                (AttemptKind::Rewrite, Some(finalized)) => finalized
                    .message_index
                    .map(|index| (index, thread.messages[index].clone())),
                _ => None,
            };
            (message_update, ThreadDocument::from(&*thread))
        };

        if let Some((message_index, message)) = message_update {
            self.deps
                .bridge
                .publish_message_update(self.attempt.thread_id, message_index, &message);
        }

        let _ = self.status.send(SessionStatus::completed());
        tracing::debug!(
            thread_id = %self.attempt.thread_id,
            chat_index = self.attempt.chat_index,
            answer_chars = text.chars().count(),
            "answer attempt completed"
        );

        match self.attempt.kind {
            AttemptKind::Fresh => self.persist_patch(text.clone()),
            AttemptKind::Rewrite => self.persist_save(document),
        }

        Outcome::Completed { text }
    }

    async fn finish_cancelled(self, text: String) -> Outcome {
        self.transition(PhaseTransition::Cancel(self.target));

        // The partial answer is kept, never rolled back. An abort before any
        // chunk arrived leaves both views of the thread untouched.
        let document = {
            let mut thread = self.thread.write().await;
            if !text.is_empty() {
                Self::write_answer(self.attempt.kind, &mut thread, &text);
            }
            ThreadDocument::from(&*thread)
        };

        let _ = self.status.send(SessionStatus::cancelled());
        tracing::debug!(
            thread_id = %self.attempt.thread_id,
            chat_index = self.attempt.chat_index,
            partial_chars = text.chars().count(),
            "answer attempt cancelled"
        );

        self.persist_save(document);
        Outcome::Cancelled { text }
    }

    fn finish_failed(self, error: StreamError) -> Outcome {
        let message = error.user_message();
        tracing::warn!(
            thread_id = %self.attempt.thread_id,
            chat_index = self.attempt.chat_index,
            error = %error,
            "answer attempt failed"
        );

        self.transition(PhaseTransition::Fail {
            target: self.target,
            message: message.clone(),
        });
        let _ = self.status.send(SessionStatus::failed(message.clone()));

        Outcome::Failed {
            error_message: message,
            retry: self.attempt,
        }
    }

    /// Writes the answer into both thread views. A fresh attempt has no
    /// assistant transcript entry yet, so one is appended before finalizing;
    /// a rewrite replaces the entry already there.
    fn write_answer(
        kind: AttemptKind,
        thread: &mut ChatThread,
        text: &str,
    ) -> Option<FinalizedAnswer> {
        if kind == AttemptKind::Fresh {
            thread.push_assistant_message(text);
        }
        thread.finalize_answer(text)
    }

    /// Fire-and-forget: the attempt reports terminal without waiting for
    /// durability. Queued writes for the thread apply in submission order, so
    /// this patch always lands after the submitted-turn save.
    fn persist_patch(&self, answer: String) {
        match &self.persist {
            Some(queue) => queue.patch_answer(self.attempt.chat_index, answer),
            None => tracing::debug!("anonymous user, skipping persistence"),
        }
    }

    fn persist_save(&self, document: ThreadDocument) {
        match &self.persist {
            Some(queue) => queue.save_thread(document),
            None => tracing::debug!("anonymous user, skipping persistence"),
        }
    }

    fn transition(&self, transition: PhaseTransition) {
        let Ok(mut phase) = self.phase.lock() else {
            return;
        };
        match phase.apply(transition) {
            Ok(next) => *phase = next,
            Err(rejection) => {
                tracing::warn!(?rejection, "phase transition rejected");
            }
        }
    }
}
