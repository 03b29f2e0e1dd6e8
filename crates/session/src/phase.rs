use quill_thread::ThreadId;

/// Identifier for one answer attempt.
///
/// This must change on every submit/retry so stale transitions can be
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub u64);

impl AttemptId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Addressing key for one turn's answer buffer. At most one attempt may be
/// hot per key at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub thread_id: ThreadId,
    pub chat_index: usize,
}

impl SessionKey {
    pub const fn new(thread_id: ThreadId, chat_index: usize) -> Self {
        Self {
            thread_id,
            chat_index,
        }
    }
}

/// Routing target of one attempt, used for stale-transition rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTarget {
    pub key: SessionKey,
    pub attempt_id: AttemptId,
}

impl SessionTarget {
    pub const fn new(key: SessionKey, attempt_id: AttemptId) -> Self {
        Self { key, attempt_id }
    }
}

/// Lifecycle state of the answer attempt for one turn.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: no further transitions
/// for that attempt, no further publishes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Requesting(SessionTarget),
    Streaming(SessionTarget),
    Completed(SessionTarget),
    Failed {
        target: SessionTarget,
        message: String,
    },
    Cancelled(SessionTarget),
}

/// State transition input for the attempt lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    /// New attempt issues its request.
    Begin(SessionTarget),
    /// The backend accepted the request and the chunk stream is open.
    StreamOpened(SessionTarget),
    /// End of stream reached.
    Complete(SessionTarget),
    /// Open or chunk read failed.
    Fail {
        target: SessionTarget,
        message: String,
    },
    /// User-initiated abort.
    Cancel(SessionTarget),
    ResetToIdle,
}

/// Rejection reason for illegal transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyActive {
        active: SessionTarget,
        attempted: SessionTarget,
    },
    NoActiveAttempt,
    AttemptMismatch {
        active: SessionTarget,
        attempted: SessionTarget,
    },
}

pub type PhaseResult = Result<SessionPhase, PhaseRejection>;

impl SessionPhase {
    /// Returns the target while the attempt is hot (requesting or streaming).
    pub fn hot_target(&self) -> Option<SessionTarget> {
        match self {
            Self::Requesting(target) | Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_)
        )
    }

    /// Applies one transition deterministically.
    ///
    /// Idle and terminal states may begin a new attempt directly. Every other
    /// transition must name the currently hot attempt exactly.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseResult {
        match transition {
            PhaseTransition::Begin(target) => self.apply_begin(target),
            PhaseTransition::StreamOpened(target) => self.apply_stream_opened(target),
            PhaseTransition::Complete(target) => {
                self.apply_terminal(target, SessionPhase::Completed(target))
            }
            PhaseTransition::Fail { target, message } => {
                self.apply_terminal(target, SessionPhase::Failed { target, message })
            }
            PhaseTransition::Cancel(target) => {
                self.apply_terminal(target, SessionPhase::Cancelled(target))
            }
            PhaseTransition::ResetToIdle => Ok(SessionPhase::Idle),
        }
    }

    fn apply_begin(&self, target: SessionTarget) -> PhaseResult {
        match self.hot_target() {
            Some(active) => Err(PhaseRejection::AlreadyActive {
                active,
                attempted: target,
            }),
            None => Ok(Self::Requesting(target)),
        }
    }

    fn apply_stream_opened(&self, target: SessionTarget) -> PhaseResult {
        match self {
            Self::Requesting(active) if *active == target => Ok(Self::Streaming(target)),
            Self::Requesting(active) | Self::Streaming(active) => {
                Err(PhaseRejection::AttemptMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => {
                Err(PhaseRejection::NoActiveAttempt)
            }
        }
    }

    /// Terminal transitions are legal from both hot states: cancellation and
    /// failure can land while the request is still being opened.
    fn apply_terminal(&self, target: SessionTarget, next: SessionPhase) -> PhaseResult {
        match self.hot_target() {
            Some(active) if active == target => Ok(next),
            Some(active) => Err(PhaseRejection::AttemptMismatch {
                active,
                attempted: target,
            }),
            None => Err(PhaseRejection::NoActiveAttempt),
        }
    }
}
