pub mod context;
pub mod error;
pub mod ids;
pub mod message;

pub use context::{IMAGE_REWRITE_MODEL, RewriteContext, build_initial_context, build_rewrite_context};
pub use error::{ThreadError, ThreadResult};
pub use ids::{ThreadId, UserId};
pub use message::{Chat, ChatMode, ChatThread, FinalizedAnswer, Message, Role};
