//! Model-call boundary: wire types, provider trait, and the OpenAI client.

pub mod openai;
pub mod provider;
pub mod sse;

pub use openai::OpenAiProvider;
pub use provider::{ChatCompletionChunk, ChatCompletionRequest, LlmProvider};
