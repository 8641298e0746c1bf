use std::sync::Arc;

use async_trait::async_trait;

use super::chat_loop::ChatAgent;
use super::provider::{ChatMessage, ChatProvider, EmbeddingsProvider};
use crate::core::errors::ApiError;
use crate::history::ChatHistoryStore;
use crate::rag::{StoredChunk, TextChunk, VectorStore};

const DEFAULT_TOP_K: usize = 4;
const DEFAULT_HISTORY_WINDOW: usize = 20;

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer using the provided context \
when it is relevant; say so when it is not.";

/// Capabilities injected into the RAG agent.
///
/// Composition replaces the subclass-per-choice pattern: each collaborator
/// is swappable behind its trait.
pub struct RagAgentConfig {
    pub provider: Arc<dyn ChatProvider>,
    pub embeddings: Arc<dyn EmbeddingsProvider>,
    pub vector_store: Arc<dyn VectorStore>,
    pub history: ChatHistoryStore,
    pub thread_id: String,
    pub top_k: usize,
    pub history_window: usize,
}

pub struct RagAgent {
    config: RagAgentConfig,
}

impl RagAgent {
    pub fn new(config: RagAgentConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults(
        provider: Arc<dyn ChatProvider>,
        embeddings: Arc<dyn EmbeddingsProvider>,
        vector_store: Arc<dyn VectorStore>,
        history: ChatHistoryStore,
        thread_id: String,
    ) -> Self {
        Self::new(RagAgentConfig {
            provider,
            embeddings,
            vector_store,
            history,
            thread_id,
            top_k: DEFAULT_TOP_K,
            history_window: DEFAULT_HISTORY_WINDOW,
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.config.thread_id
    }

    /// One-time ingestion: embed chunks and hand them to the vector store.
    pub async fn add_documents(&self, chunks: Vec<TextChunk>) -> Result<usize, ApiError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let inputs: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = self.config.embeddings.embed(&inputs).await?;

        let items: Vec<(StoredChunk, Vec<f32>)> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                (
                    StoredChunk {
                        chunk_id: format!("{}#{}", chunk.source, chunk.chunk_index),
                        content: chunk.text,
                        source: chunk.source,
                    },
                    embedding,
                )
            })
            .collect();

        let count = items.len();
        self.config.vector_store.insert_batch(items).await?;
        tracing::info!("Ingested {} chunks into the vector store", count);
        Ok(count)
    }

    async fn retrieve_context(&self, input: &str) -> Result<Vec<StoredChunk>, ApiError> {
        if self.config.vector_store.count().await? == 0 {
            return Ok(Vec::new());
        }

        let query_text = vec![input.to_string()];
        let query = self.config.embeddings.embed(&query_text).await?;
        let Some(query) = query.first() else {
            return Ok(Vec::new());
        };

        let results = self
            .config
            .vector_store
            .search(query, self.config.top_k)
            .await?;
        Ok(results.into_iter().map(|result| result.chunk).collect())
    }

    async fn build_messages(&self, input: &str) -> Result<Vec<ChatMessage>, ApiError> {
        let mut messages = Vec::new();

        let context = self.retrieve_context(input).await?;
        if context.is_empty() {
            messages.push(ChatMessage::new("system", SYSTEM_PROMPT));
        } else {
            let mut prompt = String::from(SYSTEM_PROMPT);
            prompt.push_str("\n\nContext:\n");
            for chunk in &context {
                prompt.push_str(&format!("[{}] {}\n", chunk.source, chunk.content));
            }
            messages.push(ChatMessage::new("system", prompt));
        }

        let thread = self
            .config
            .history
            .get_by_thread_id(&self.config.thread_id)
            .await?;
        let window = thread
            .messages
            .iter()
            .rev()
            .take(self.config.history_window)
            .collect::<Vec<_>>();
        for message in window.into_iter().rev() {
            messages.push(ChatMessage::new(message.role.as_str(), &message.content));
        }

        messages.push(ChatMessage::new("user", input));
        Ok(messages)
    }
}

#[async_trait]
impl ChatAgent for RagAgent {
    async fn chat(&self, input: &str) -> Result<String, ApiError> {
        let messages = self.build_messages(input).await?;
        self.config.provider.chat(messages).await
    }
}
