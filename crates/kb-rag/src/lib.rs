pub mod chat;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod rag;
pub mod reranking;
pub mod search;
pub mod storage;
pub mod tokens;
pub mod types;

// Re-export primary types for convenience
pub use chat::{
    PipelineEvent, PipelineOrchestrator, PipelineOutput, PipelineRequest, Stage, StageStatus,
    UsageReport,
};
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use storage::{KnowledgeBase, KnowledgeBaseFactory, KnowledgeBaseKey, KnowledgeBaseRegistry};
pub use types::{
    CandidatePassage, ConversationMessage, MergedPassage, PassageHit, Query, QueryChannel,
    RetrievalChannel, ScoredPassage, ThresholdMethod, ThresholdResult, TurnRole,
};

// Re-export LLM types
pub use llm::{ApiProvider, ChatMessage, ChatStreamEvent, GenerationConfig, LLMProvider, ProviderInfo};

// Re-export common types
pub use anyhow::{Error, Result};
pub use tokio_util::sync::CancellationToken;
