use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quill_session::{
    AiDefaultsStore, AiOverrides, AttemptRun, DEFAULT_MODEL, Outcome, SessionDeps, SessionError,
    SessionPhase, SubscriberBridge, ThreadSession,
};
use quill_storage::{
    BoxFuture as StorageBoxFuture, MemoryThreadStore, StorageResult, ThreadDocument, ThreadStore,
};
use quill_stream::{
    AnswerBackend, AnswerRequest, BoxChunkStream, BoxFuture, ChunkStream, StreamError,
    StreamResult, WireMessage, WireRole,
};
use quill_thread::{ChatMode, ChatThread, IMAGE_REWRITE_MODEL, Message, ThreadId, UserId};
use tokio::sync::{RwLock, mpsc};

/// One scripted response of the backend, consumed per `open` call.
enum Script {
    /// Chunks arrive through the channel; closing the sender ends the stream.
    Stream(mpsc::UnboundedReceiver<StreamResult<String>>),
    Fail { status: u16, body: &'static str },
    /// The open call never resolves; only cancellation gets out.
    Hang,
}

#[derive(Default)]
struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<AnswerRequest>>,
}

impl ScriptedBackend {
    fn push_stream(&self) -> mpsc::UnboundedSender<StreamResult<String>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Stream(receiver));
        sender
    }

    fn push_failure(&self, status: u16, body: &'static str) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Fail { status, body });
    }

    fn push_hang(&self) {
        self.scripts.lock().unwrap().push_back(Script::Hang);
    }

    fn requests(&self) -> Vec<AnswerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl AnswerBackend for ScriptedBackend {
    fn open<'a>(
        &'a self,
        request: &'a AnswerRequest,
    ) -> BoxFuture<'a, StreamResult<BoxChunkStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Stream(receiver)) => {
                    Ok(Box::new(ChannelChunkStream { receiver }) as BoxChunkStream)
                }
                Some(Script::Fail { status, body }) => Err(StreamError::Backend {
                    stage: "scripted-open",
                    status,
                    body: body.to_string(),
                }),
                Some(Script::Hang) | None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        })
    }
}

struct ChannelChunkStream {
    receiver: mpsc::UnboundedReceiver<StreamResult<String>>,
}

impl ChunkStream for ChannelChunkStream {
    fn next_chunk(&mut self) -> BoxFuture<'_, StreamResult<Option<String>>> {
        Box::pin(async move {
            match self.receiver.recv().await {
                Some(Ok(text)) => Ok(Some(text)),
                Some(Err(error)) => Err(error),
                None => Ok(None),
            }
        })
    }
}

#[derive(Default)]
struct RecordingBridge {
    partials: Mutex<Vec<(usize, String)>>,
    message_updates: Mutex<Vec<(usize, Message)>>,
}

impl RecordingBridge {
    fn partials(&self) -> Vec<(usize, String)> {
        self.partials.lock().unwrap().clone()
    }

    fn message_updates(&self) -> Vec<(usize, Message)> {
        self.message_updates.lock().unwrap().clone()
    }
}

impl SubscriberBridge for RecordingBridge {
    fn publish_partial(&self, _thread_id: ThreadId, chat_index: usize, text: &str) {
        self.partials
            .lock()
            .unwrap()
            .push((chat_index, text.to_string()));
    }

    fn publish_message_update(
        &self,
        _thread_id: ThreadId,
        message_index: usize,
        message: &Message,
    ) {
        self.message_updates
            .lock()
            .unwrap()
            .push((message_index, message.clone()));
    }
}

/// Bulk saves land after a delay; answer patches and loads go straight
/// through to the wrapped store.
struct SlowSaveStore {
    inner: MemoryThreadStore,
}

impl ThreadStore for SlowSaveStore {
    fn save_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        document: &'a ThreadDocument,
    ) -> StorageBoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.save_thread(user_id, thread_id, document).await
        })
    }

    fn patch_answer<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
        chat_index: usize,
        answer: &'a str,
    ) -> StorageBoxFuture<'a, StorageResult<()>> {
        self.inner.patch_answer(user_id, thread_id, chat_index, answer)
    }

    fn load_thread<'a>(
        &'a self,
        user_id: UserId,
        thread_id: ThreadId,
    ) -> StorageBoxFuture<'a, StorageResult<Option<ThreadDocument>>> {
        self.inner.load_thread(user_id, thread_id)
    }
}

struct Harness {
    backend: Arc<ScriptedBackend>,
    bridge: Arc<RecordingBridge>,
    store: Arc<MemoryThreadStore>,
    thread: Arc<RwLock<ChatThread>>,
    thread_id: ThreadId,
    user_id: UserId,
    session: ThreadSession,
}

fn build(user: Option<UserId>, thread: ChatThread) -> Harness {
    let backend = Arc::new(ScriptedBackend::default());
    let bridge = Arc::new(RecordingBridge::default());
    let store = Arc::new(MemoryThreadStore::new());
    let thread_id = thread.id;
    let thread = Arc::new(RwLock::new(thread));
    let session = ThreadSession::new(
        SessionDeps {
            backend: backend.clone(),
            bridge: bridge.clone(),
            store: store.clone(),
            defaults: AiDefaultsStore::default(),
            user,
        },
        thread.clone(),
    );

    Harness {
        backend,
        bridge,
        store,
        thread,
        thread_id,
        user_id: user.unwrap_or_else(UserId::new_v7),
        session,
    }
}

fn harness() -> Harness {
    build(Some(UserId::new_v7()), ChatThread::new(ThreadId::new_v7()))
}

fn harness_anonymous() -> Harness {
    build(None, ChatThread::new(ThreadId::new_v7()))
}

fn harness_with_thread(thread: ChatThread) -> Harness {
    build(Some(UserId::new_v7()), thread)
}

fn answered_thread(question: &str, answer: &str, mode: ChatMode) -> ChatThread {
    let mut thread = ChatThread::new(ThreadId::new_v7());
    thread.push_turn(question, mode);
    thread.push_assistant_message(answer);
    thread.finalize_answer(answer);
    thread
}

/// Persistence is fire-and-forget, so stored state is observed by polling.
async fn wait_for_document<F>(
    store: &MemoryThreadStore,
    user_id: UserId,
    thread_id: ThreadId,
    predicate: F,
) -> ThreadDocument
where
    F: Fn(&ThreadDocument) -> bool,
{
    for _ in 0..400 {
        if let Some(document) = store.document(user_id, thread_id).await {
            if predicate(&document) {
                return document;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stored document did not reach the expected state");
}

async fn wait_for_partials(bridge: &RecordingBridge, count: usize) {
    for _ in 0..400 {
        if bridge.partials().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} partial publishes");
}

#[tokio::test]
async fn fresh_answer_streams_completes_and_patches_the_store() {
    let mut h = harness();
    let sender = h.backend.push_stream();

    let AttemptRun { handle, driver } = h
        .session
        .begin_answer("What is Rust?", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    assert!(handle.status().loading);

    let driver = tokio::spawn(driver);
    sender.send(Ok("Rust is".to_string())).unwrap();
    sender.send(Ok(" a language.".to_string())).unwrap();
    drop(sender);

    let outcome = driver.await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Completed {
            text: "Rust is a language.".to_string(),
        }
    );

    // Every publish carries the full accumulated text and extends the
    // previous one.
    let partials = h.bridge.partials();
    assert_eq!(
        partials,
        vec![
            (0, "Rust is".to_string()),
            (0, "Rust is a language.".to_string()),
        ]
    );
    assert!(partials[1].1.starts_with(&partials[0].1));

    let status = handle.status();
    assert!(status.completed);
    assert_eq!(status.error, None);

    {
        let thread = h.thread.read().await;
        assert_eq!(thread.chats[0].answer, "Rust is a language.");
        assert_eq!(
            thread.messages.last(),
            Some(&Message::assistant("Rust is a language."))
        );
    }

    let document = wait_for_document(&h.store, h.user_id, h.thread_id, |document| {
        document.chats[0].has_answer()
    })
    .await;
    assert_eq!(document.chats[0].answer, "Rust is a language.");

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].messages,
        vec![WireMessage::new(WireRole::User, "What is Rust?")]
    );
    assert_eq!(requests[0].model, DEFAULT_MODEL);
}

#[tokio::test]
async fn cancel_mid_stream_keeps_and_saves_the_partial_answer() {
    let mut h = harness();
    let sender = h.backend.push_stream();

    let AttemptRun { handle, driver } = h
        .session
        .begin_answer("Tell me a story", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    let driver = tokio::spawn(driver);

    sender.send(Ok("Once upon".to_string())).unwrap();
    sender.send(Ok(" a time".to_string())).unwrap();
    wait_for_partials(&h.bridge, 2).await;

    assert!(handle.cancel());
    let outcome = driver.await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Cancelled {
            text: "Once upon a time".to_string(),
        }
    );
    assert!(outcome.is_terminal_completion());

    // Cancelling an already-terminal attempt is a quiet no-op.
    assert!(!handle.cancel());

    // Cancellation reads as completion, never as an error.
    let status = handle.status();
    assert!(status.completed);
    assert_eq!(status.error, None);

    let document = wait_for_document(&h.store, h.user_id, h.thread_id, |document| {
        document.chats[0].has_answer()
    })
    .await;
    assert_eq!(document.chats[0].answer, "Once upon a time");
    assert_eq!(
        document.messages.last(),
        Some(&Message::assistant("Once upon a time"))
    );

    drop(sender);
}

#[tokio::test]
async fn cancel_while_requesting_leaves_the_turn_unanswered() {
    let mut h = harness();
    h.backend.push_hang();

    let AttemptRun { handle, driver } = h
        .session
        .begin_answer("Hello?", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    let driver = tokio::spawn(driver);

    assert!(handle.cancel());
    let outcome = driver.await.unwrap();
    assert_eq!(outcome, Outcome::Cancelled { text: String::new() });

    assert!(h.bridge.partials().is_empty());
    {
        let thread = h.thread.read().await;
        assert!(!thread.chats[0].has_answer());
        assert_eq!(thread.messages.len(), 1);
    }

    // The submitted question was still saved.
    let document = wait_for_document(&h.store, h.user_id, h.thread_id, |document| {
        document.chats.len() == 1
    })
    .await;
    assert!(!document.chats[0].has_answer());
}

#[tokio::test]
async fn failed_attempt_is_retryable_with_the_identical_request() {
    let mut h = harness();
    h.backend.push_failure(500, "server error");

    let AttemptRun { handle, driver } = h
        .session
        .begin_answer("Hi", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    let outcome = driver.await;

    let Outcome::Failed {
        error_message,
        retry,
    } = outcome
    else {
        panic!("expected a failed outcome");
    };
    assert_eq!(
        error_message,
        "The answer service returned an error (status 500)."
    );
    assert!(handle.status().error.is_some());
    assert!(h.bridge.partials().is_empty());
    {
        let thread = h.thread.read().await;
        assert!(!thread.chats[0].has_answer());
    }

    let sender = h.backend.push_stream();
    let AttemptRun { driver, .. } = h.session.resume(retry).unwrap();
    sender.send(Ok("Hello!".to_string())).unwrap();
    drop(sender);
    let outcome = driver.await;
    assert!(matches!(outcome, Outcome::Completed { .. }));

    // The retry re-submits the identical request from scratch.
    let requests = h.backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);

    let document = wait_for_document(&h.store, h.user_id, h.thread_id, |document| {
        document.chats[0].has_answer()
    })
    .await;
    assert_eq!(document.chats[0].answer, "Hello!");
}

#[tokio::test]
async fn rewrite_replays_the_transcript_and_updates_the_last_message() {
    let mut h = harness_with_thread(answered_thread("A", "X", ChatMode::Text));
    let sender = h.backend.push_stream();

    let AttemptRun { driver, .. } = h
        .session
        .begin_rewrite(&AiOverrides::default())
        .await
        .unwrap()
        .expect("last turn is answered");
    sender.send(Ok("Y".to_string())).unwrap();
    drop(sender);

    let outcome = driver.await;
    assert_eq!(
        outcome,
        Outcome::Completed {
            text: "Y".to_string(),
        }
    );

    // The rewritten answer is dropped from the request context.
    let requests = h.backend.requests();
    assert_eq!(
        requests[0].messages,
        vec![WireMessage::new(WireRole::User, "A")]
    );

    {
        let thread = h.thread.read().await;
        assert_eq!(thread.messages, vec![Message::user("A"), Message::assistant("Y")]);
        assert_eq!(thread.chats[0].answer, "Y");
    }
    assert_eq!(
        h.bridge.message_updates(),
        vec![(1, Message::assistant("Y"))]
    );

    let document = wait_for_document(&h.store, h.user_id, h.thread_id, |document| {
        document.chats[0].answer == "Y"
    })
    .await;
    assert_eq!(document.messages[1], Message::assistant("Y"));
}

#[tokio::test]
async fn rewrite_of_an_unanswered_turn_is_a_silent_no_op() {
    let mut thread = ChatThread::new(ThreadId::new_v7());
    thread.push_turn("A", ChatMode::Text);
    let mut h = harness_with_thread(thread);

    let run = h.session.begin_rewrite(&AiOverrides::default()).await.unwrap();

    assert!(run.is_none());
    assert!(h.backend.requests().is_empty());
    assert_eq!(h.session.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn rewrite_of_an_image_turn_forces_the_image_model() {
    let mut h = harness_with_thread(answered_thread("draw a cat", "a cat", ChatMode::Image));
    let sender = h.backend.push_stream();

    let AttemptRun { driver, .. } = h
        .session
        .begin_rewrite(&AiOverrides::default())
        .await
        .unwrap()
        .expect("last turn is answered");
    sender.send(Ok("a better cat".to_string())).unwrap();
    drop(sender);
    let outcome = driver.await;
    assert!(matches!(outcome, Outcome::Completed { .. }));

    assert_eq!(h.backend.requests()[0].model, IMAGE_REWRITE_MODEL);
}

#[tokio::test]
async fn concurrent_attempt_on_a_hot_session_is_rejected() {
    let mut h = harness();
    h.backend.push_hang();

    let AttemptRun { handle, driver } = h
        .session
        .begin_answer("first", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    let driver = tokio::spawn(driver);

    let Err(error) = h
        .session
        .begin_answer("second", ChatMode::Text, None, &AiOverrides::default())
        .await
    else {
        panic!("expected the second start to be rejected");
    };
    assert!(matches!(error, SessionError::AttemptInFlight { .. }));

    // The rejected start leaves no orphan turn behind.
    {
        let thread = h.thread.read().await;
        assert_eq!(thread.chats.len(), 1);
        assert_eq!(thread.chats[0].question, "first");
        assert_eq!(thread.messages.len(), 1);
    }

    handle.cancel();
    let outcome = driver.await.unwrap();
    assert!(matches!(outcome, Outcome::Cancelled { .. }));
}

#[tokio::test]
async fn anonymous_sessions_never_touch_the_store() {
    let mut h = harness_anonymous();
    let sender = h.backend.push_stream();

    let AttemptRun { driver, .. } = h
        .session
        .begin_answer("Hi", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    sender.send(Ok("Hello!".to_string())).unwrap();
    drop(sender);
    let outcome = driver.await;
    assert!(matches!(outcome, Outcome::Completed { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.document_count().await, 0);
}

#[tokio::test]
async fn completion_patch_never_overtakes_the_submitted_turn_save() {
    let backend = Arc::new(ScriptedBackend::default());
    let store = Arc::new(SlowSaveStore {
        inner: MemoryThreadStore::new(),
    });
    let user_id = UserId::new_v7();
    let thread_id = ThreadId::new_v7();
    let thread = Arc::new(RwLock::new(ChatThread::new(thread_id)));
    let mut session = ThreadSession::new(
        SessionDeps {
            backend: backend.clone(),
            bridge: Arc::new(RecordingBridge::default()),
            store: store.clone(),
            defaults: AiDefaultsStore::default(),
            user: Some(user_id),
        },
        thread,
    );

    // The whole answer is buffered before the attempt starts, so the
    // completion patch is issued while the slow bulk save is still in
    // flight.
    let sender = backend.push_stream();
    sender.send(Ok("Quick".to_string())).unwrap();
    drop(sender);

    let AttemptRun { driver, .. } = session
        .begin_answer("Hi", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    let outcome = driver.await;
    assert!(matches!(outcome, Outcome::Completed { .. }));

    // Writes apply in submission order, so the patch lands on the saved
    // turn instead of racing past it.
    let document = wait_for_document(&store.inner, user_id, thread_id, |document| {
        !document.chats.is_empty() && document.chats[0].has_answer()
    })
    .await;
    assert_eq!(document.chats[0].answer, "Quick");
    assert_eq!(document.chats[0].question, "Hi");
}

#[tokio::test]
async fn mid_stream_failure_keeps_the_published_partial_unsaved() {
    let mut h = harness();
    let sender = h.backend.push_stream();

    let AttemptRun { handle, driver } = h
        .session
        .begin_answer("Hi", ChatMode::Text, None, &AiOverrides::default())
        .await
        .unwrap();
    sender.send(Ok("Par".to_string())).unwrap();
    sender
        .send(Err(StreamError::Backend {
            stage: "scripted-chunk",
            status: 502,
            body: "bad gateway".to_string(),
        }))
        .unwrap();
    drop(sender);

    let outcome = driver.await;
    let Outcome::Failed { retry, .. } = outcome else {
        panic!("expected a failed outcome");
    };
    assert_eq!(retry.chat_index, 0);
    assert!(handle.status().error.is_some());

    // The published partial stays on screen, but nothing is finalized or
    // written past the submitted question.
    assert_eq!(h.bridge.partials().last().unwrap().1, "Par");
    {
        let thread = h.thread.read().await;
        assert!(!thread.chats[0].has_answer());
        assert_eq!(thread.messages.len(), 1);
    }
    let document = wait_for_document(&h.store, h.user_id, h.thread_id, |document| {
        document.chats.len() == 1
    })
    .await;
    assert!(!document.chats[0].has_answer());
}
