pub mod openai;

pub use openai::OpenAiEmbeddings;

use anyhow::Result;
use async_trait::async_trait;

/// Query embedding endpoint
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding vector dimension, if known ahead of the first call
    fn dimension(&self) -> Option<usize>;
}
