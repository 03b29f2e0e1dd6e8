pub mod bridge;
pub mod cancel;
pub mod outcome;
pub mod params;
mod persist;
pub mod phase;
pub mod session;

pub use bridge::{SessionStatus, SubscriberBridge};
pub use cancel::{CancelHandle, CancelSignal};
pub use outcome::{AnswerAttempt, AttemptKind, Outcome};
pub use params::{AiDefaults, AiDefaultsStore, AiOverrides, AiParams, DEFAULT_MODEL};
pub use phase::{
    AttemptId, PhaseRejection, PhaseTransition, SessionKey, SessionPhase, SessionTarget,
};
pub use session::{
    AttemptRun, SessionDeps, SessionError, SessionHandle, SessionResult, ThreadSession,
};
