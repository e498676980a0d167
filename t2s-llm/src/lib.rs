//! Provider-client boundary for t2s.
//!
//! Every language-model backend is reached through [`ProviderClient`]. The
//! router in `t2s-core` treats all of them uniformly and never branches on
//! backend-specific protocol.

mod client;
mod error;
mod openai;
mod types;

pub use client::{ChunkStream, ProviderClient, once};
pub use error::{LlmError, Result};
pub use openai::OpenAiCompatibleClient;
pub use types::{ChatMessage, Role, StreamChunk, Usage};
