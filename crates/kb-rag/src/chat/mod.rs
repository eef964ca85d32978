pub mod engine;

pub use engine::PipelineOrchestrator;

use serde::{Deserialize, Serialize};

use crate::storage::KnowledgeBaseKey;
use crate::types::ConversationMessage;

// ============================================================================
// Types
// ============================================================================

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    QueryExpansion,
    Retrieval,
    Rerank,
    AdaptiveFilter,
    Merge,
    ContextBuild,
    Generation,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::QueryExpansion,
        Stage::Retrieval,
        Stage::Rerank,
        Stage::AdaptiveFilter,
        Stage::Merge,
        Stage::ContextBuild,
        Stage::Generation,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Stage::QueryExpansion => "Generating search queries",
            Stage::Retrieval => "Searching knowledge base",
            Stage::Rerank => "Scoring relevance",
            Stage::AdaptiveFilter => "Filtering by adaptive cutoff",
            Stage::Merge => "Merging adjacent chunks",
            Stage::ContextBuild => "Building context",
            Stage::Generation => "Generating answer",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Completed,
    Error,
}

/// Progress record for one stage transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEvent {
    pub stage: Stage,
    pub status: StageStatus,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl PipelineEvent {
    pub fn new(stage: Stage, status: StageStatus, description: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            title: stage.title().to_string(),
            description: description.into(),
            content: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Everything the orchestrator sends outward, in emission order.
///
/// Serialized as `{"type": ..., "payload": ...}` so consumers can tell
/// progress apart from answer text on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PipelineOutput {
    Process(PipelineEvent),
    Content(String),
    Reasoning(String),
    /// Completed non-generation stage events, replayed once the answer is done.
    RagSummary(Vec<PipelineEvent>),
    Usage(UsageReport),
    /// Terminal failure of the request.
    Error(String),
    Done,
}

impl PipelineOutput {
    /// One server-sent-events frame.
    pub fn to_sse(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {}\n\n", json),
            Err(e) => format!(
                "data: {}\n\n",
                serde_json::json!({ "type": "error", "payload": e.to_string() })
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineOutput::Done | PipelineOutput::Error(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageReport {
    pub prompt_tokens: usize,
    /// Characters of answer text; streaming endpoints do not report completion tokens.
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub latency_ms: u64,
}

/// One question against (optionally) one knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub question: String,
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
    #[serde(default)]
    pub knowledge_base: Option<KnowledgeBaseKey>,
    /// Replaces the default answer instructions; context is still appended.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl PipelineRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            history: Vec::new(),
            knowledge_base: None,
            system_prompt: None,
        }
    }

    pub fn with_knowledge_base(mut self, key: KnowledgeBaseKey) -> Self {
        self.knowledge_base = Some(key);
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }
}

// ============================================================================
// Prompts
// ============================================================================

pub const RAG_SYSTEM_PROMPT: &str = r#"You are a knowledgeable assistant. Answer the user's question using the reference documents and the conversation history.

Rules:
1. Prefer facts stated in the reference documents. Cite them inline as [N], matching the document numbers below.
2. If the documents do not fully answer the question, reason from the conversation history or say clearly what is missing.
3. Keep the conversation coherent with earlier turns.
4. Answer clearly and concisely."#;

/// Context used when no knowledge base was requested or nothing survived filtering.
pub const NO_DOCUMENTS_CONTEXT: &str = "No relevant documents.";

/// Context used when a stage failed before context could be built.
pub fn retrieval_failed_context(err: &impl std::fmt::Display) -> String {
    format!("Retrieval failed: {}", err)
}

pub fn build_system_prompt(custom: Option<&str>, context: &str) -> String {
    let instructions = custom
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(RAG_SYSTEM_PROMPT);
    format!("{}\n\nReference documents:\n{}", instructions, context)
}
