use std::future::Future;
use std::pin::Pin;

use futures::StreamExt;
use futures::stream::BoxStream;
use snafu::ResultExt;

use super::decoder::TextChunkDecoder;
use super::error::{BackendSnafu, NetworkSnafu, StreamResult};
use super::request::AnswerRequest;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy sequence of decoded text fragments from one answer request.
///
/// A stream is restartable only by opening a new one. Dropping it releases the
/// underlying connection on every exit path, including mid-stream abandonment.
pub trait ChunkStream: Send {
    /// Next decoded fragment; `None` is end of stream.
    fn next_chunk(&mut self) -> BoxFuture<'_, StreamResult<Option<String>>>;
}

pub type BoxChunkStream = Box<dyn ChunkStream>;

/// Seam between the answer session and the generation backend.
pub trait AnswerBackend: Send + Sync {
    fn open<'a>(&'a self, request: &'a AnswerRequest)
    -> BoxFuture<'a, StreamResult<BoxChunkStream>>;
}

/// Backend adapter for the chunked-text answer endpoint.
#[derive(Debug, Clone)]
pub struct HttpAnswerBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnswerBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_stream(&self, request: &AnswerRequest) -> StreamResult<HttpChunkStream> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context(NetworkSnafu {
                stage: "send-answer-request",
            })?;

        let status = response.status();
        if !status.is_success() {
            // Error bodies are surfaced raw; parsing them is the caller's problem.
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                endpoint = %self.endpoint,
                "answer endpoint rejected the request"
            );
            return BackendSnafu {
                stage: "answer-http-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(HttpChunkStream {
            body: response.bytes_stream().boxed(),
            decoder: TextChunkDecoder::new(),
            finished: false,
        })
    }
}

impl AnswerBackend for HttpAnswerBackend {
    fn open<'a>(
        &'a self,
        request: &'a AnswerRequest,
    ) -> BoxFuture<'a, StreamResult<BoxChunkStream>> {
        Box::pin(async move {
            let stream = self.open_stream(request).await?;
            Ok(Box::new(stream) as BoxChunkStream)
        })
    }
}

struct HttpChunkStream {
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: TextChunkDecoder,
    finished: bool,
}

impl ChunkStream for HttpChunkStream {
    fn next_chunk(&mut self) -> BoxFuture<'_, StreamResult<Option<String>>> {
        Box::pin(async move {
            if self.finished {
                return Ok(None);
            }

            while let Some(next) = self.body.next().await {
                let bytes = next.context(NetworkSnafu {
                    stage: "read-answer-chunk",
                })?;
                let decoded = self.decoder.push(&bytes);
                // An empty decode means the chunk held only a partial character.
                if !decoded.is_empty() {
                    return Ok(Some(decoded));
                }
            }

            self.finished = true;
            let tail = self.decoder.finish();
            if tail.is_empty() { Ok(None) } else { Ok(Some(tail)) }
        })
    }
}
