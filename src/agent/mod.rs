pub mod chat_loop;
pub mod gemini;
pub mod provider;
pub mod rag;

pub use chat_loop::{ChatAgent, ChatSession, RetryPolicy, SessionEnd};
pub use gemini::GeminiProvider;
pub use provider::{ChatMessage, ChatProvider, EmbeddingsProvider};
pub use rag::{RagAgent, RagAgentConfig};
