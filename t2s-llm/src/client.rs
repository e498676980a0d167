use crate::error::Result;
use crate::types::{ChatMessage, StreamChunk, Usage};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Lazy, finite sequence of chunks for one completion. Dropping it cancels the
/// underlying request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable backend name used in health tables and audit records.
    fn name(&self) -> &str;

    /// Whether `complete(.., streaming = true)` yields incremental deltas.
    /// Clients that answer in one piece keep the default.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Runs one completion for `prompt` on top of the ordered `context`.
    ///
    /// Non-streaming calls still return a [`ChunkStream`]; it simply carries the
    /// whole answer as a single delta followed by `Done`.
    async fn complete(
        &self,
        prompt: &str,
        context: &[ChatMessage],
        streaming: bool,
    ) -> Result<ChunkStream>;
}

/// Wraps an already-complete answer as a stream.
pub fn once(content: String, usage: Usage) -> ChunkStream {
    let chunks = vec![
        Ok(StreamChunk::Delta { content }),
        Ok(StreamChunk::Done { usage }),
    ];
    Box::pin(futures_util::stream::iter(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn once_yields_answer_then_done() {
        let usage = Usage {
            prompt_tokens: 3,
            completion_tokens: 1,
        };
        let chunks: Vec<StreamChunk> = once("pong".to_string(), usage)
            .map(|chunk| chunk.expect("chunk"))
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Delta {
                    content: "pong".to_string()
                },
                StreamChunk::Done { usage },
            ]
        );
    }
}
