pub mod milvus;
pub mod registry;

pub use milvus::{MilvusCollection, MilvusFactory};
pub use registry::{KnowledgeBaseFactory, KnowledgeBaseKey, KnowledgeBaseRegistry};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::PassageHit;

/// Read-only, query-capable handle on one knowledge base collection.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Nearest passages to `query` by embedding similarity, at most `k`.
    async fn vector_search(&self, query: &str, k: usize) -> Result<Vec<PassageHit>>;

    /// Passages matching a boolean filter `expression` over `fields`.
    async fn lexical_search(
        &self,
        expression: &str,
        limit: usize,
        fields: &[String],
    ) -> Result<Vec<PassageHit>>;

    /// Release any connection state. Called once when the registry drops the handle.
    async fn close(&self) {}
}
