pub mod backend;
pub mod decoder;
pub mod error;
pub mod request;

pub use backend::{AnswerBackend, BoxChunkStream, BoxFuture, ChunkStream, HttpAnswerBackend};
pub use decoder::TextChunkDecoder;
pub use error::{StreamError, StreamResult};
pub use request::{AnswerRequest, WireMessage, WireRole};
