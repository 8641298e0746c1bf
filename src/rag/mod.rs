pub mod engine;
pub mod store;

pub use engine::{load_documents_from_dir, split_into_chunks, RagConfig, TextChunk};
pub use store::{ChunkSearchResult, MemoryVectorStore, StoredChunk, VectorStore};
