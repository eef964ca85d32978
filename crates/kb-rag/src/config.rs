use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::llm::ApiProvider;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub expansion: ExpansionConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub threshold: ThresholdConfig,
    pub merge: MergeConfig,
    pub budget: BudgetConfig,
    pub timeouts: TimeoutConfig,
    pub llm: LlmEndpointConfig,
    pub embedding: EmbeddingEndpointConfig,
    pub vector_store: VectorStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    pub min_queries: usize,
    pub max_queries: usize,
    /// History turns (user + assistant pairs) shown to the expansion model.
    pub max_history_turns: usize,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Vector hits requested per sub-query.
    pub top_k: usize,
    /// Lexical hits allowed per extracted keyword.
    pub per_keyword_limit: usize,
    /// Queries shorter than this (in chars) are matched whole.
    pub whole_query_max_chars: usize,
    /// Tokens shorter than this (in chars) are dropped from lexical matching.
    pub min_keyword_chars: usize,
    /// Fields the lexical expression matches against.
    pub lexical_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub top_n: usize,
    pub score_floor: f32,
    pub model: String,
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub high_confidence: f32,
    pub buffer_ratio: f32,
    pub seed: u64,
    pub n_init: usize,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Longest suffix/prefix overlap searched when stitching chunks.
    pub max_overlap_chars: usize,
    /// Seed length; shorter overlaps are not trusted.
    pub min_seed_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub final_top_n: usize,
    pub preview_token_budget: usize,
    /// History turns replayed to the answer model.
    pub max_history_turns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub expansion_secs: u64,
    pub retrieval_secs: u64,
    pub rerank_secs: u64,
    pub generation_connect_secs: u64,
    pub generation_idle_secs: u64,
}

impl TimeoutConfig {
    pub fn expansion(&self) -> Duration {
        Duration::from_secs(self.expansion_secs)
    }
    pub fn retrieval(&self) -> Duration {
        Duration::from_secs(self.retrieval_secs)
    }
    pub fn rerank(&self) -> Duration {
        Duration::from_secs(self.rerank_secs)
    }
    pub fn generation_connect(&self) -> Duration {
        Duration::from_secs(self.generation_connect_secs)
    }
    pub fn generation_idle(&self) -> Duration {
        Duration::from_secs(self.generation_idle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmEndpointConfig {
    pub provider: ApiProvider,
    pub model: String,
    pub api_key: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub enable_web_search: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingEndpointConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub dimensions: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub uri: String,
    pub token: String,
    pub vector_field: String,
    pub text_field: String,
    pub document_id_field: String,
    pub chunk_index_field: String,
    pub file_name_field: String,
    pub id_field: String,
    /// Seconds a knowledge base handle may stay unused before eviction.
    pub idle_timeout_secs: u64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            min_queries: 3,
            max_queries: 10,
            max_history_turns: 5,
            temperature: 0.3,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 12,
            per_keyword_limit: 5,
            whole_query_max_chars: 10,
            min_keyword_chars: 2,
            lexical_fields: vec!["text".to_string()],
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            top_n: 8,
            score_floor: 0.35,
            model: "qwen3-rerank".to_string(),
            endpoint: "http://localhost:8001/rerank".to_string(),
            api_key: String::new(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.8,
            buffer_ratio: 0.3,
            seed: 42,
            n_init: 10,
            max_iterations: 300,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_overlap_chars: 200,
            min_seed_chars: 3,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            final_top_n: 8,
            preview_token_budget: 2048,
            max_history_turns: 5,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            expansion_secs: 20,
            retrieval_secs: 10,
            rerank_secs: 15,
            generation_connect_secs: 60,
            generation_idle_secs: 90,
        }
    }
}

impl Default for LlmEndpointConfig {
    fn default() -> Self {
        Self {
            provider: ApiProvider::OpenAI,
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            max_tokens: 4096,
            temperature: 0.7,
            enable_web_search: false,
        }
    }
}

impl Default for EmbeddingEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: String::new(),
            dimensions: None,
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:19530".to_string(),
            token: String::new(),
            vector_field: "vector".to_string(),
            text_field: "text".to_string(),
            document_id_field: "documentId".to_string(),
            chunk_index_field: "chunkIndex".to_string(),
            file_name_field: "fileName".to_string(),
            id_field: "pk".to_string(),
            idle_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.expansion.min_queries == 0 || self.expansion.max_queries < self.expansion.min_queries {
            return Err(invalid("expansion.max_queries must be >= min_queries >= 1"));
        }
        if self.retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k must be > 0"));
        }
        if self.retrieval.per_keyword_limit == 0 {
            return Err(invalid("retrieval.per_keyword_limit must be > 0"));
        }
        if self.retrieval.lexical_fields.is_empty() {
            return Err(invalid("retrieval.lexical_fields must not be empty"));
        }
        if self.rerank.top_n == 0 {
            return Err(invalid("rerank.top_n must be > 0"));
        }
        for (name, value) in [
            ("rerank.score_floor", self.rerank.score_floor),
            ("threshold.high_confidence", self.threshold.high_confidence),
            ("threshold.buffer_ratio", self.threshold.buffer_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{} must be in [0.0, 1.0]", name)));
            }
        }
        if self.threshold.n_init == 0 || self.threshold.max_iterations == 0 {
            return Err(invalid("threshold.n_init and threshold.max_iterations must be > 0"));
        }
        if self.merge.min_seed_chars == 0 {
            return Err(invalid("merge.min_seed_chars must be > 0"));
        }
        if self.merge.min_seed_chars > self.merge.max_overlap_chars {
            return Err(invalid("merge.min_seed_chars must be <= max_overlap_chars"));
        }
        if self.budget.final_top_n == 0 {
            return Err(invalid("budget.final_top_n must be > 0"));
        }
        let t = &self.timeouts;
        for (name, secs) in [
            ("timeouts.expansion_secs", t.expansion_secs),
            ("timeouts.retrieval_secs", t.retrieval_secs),
            ("timeouts.rerank_secs", t.rerank_secs),
            ("timeouts.generation_connect_secs", t.generation_connect_secs),
            ("timeouts.generation_idle_secs", t.generation_idle_secs),
        ] {
            if secs == 0 {
                return Err(invalid(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| invalid(format!("failed to parse {}: {}", path.display(), e)))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Secrets from the environment take precedence over file values.
    pub fn apply_env(&mut self) {
        let overrides: [(&str, &mut String); 4] = [
            ("KB_RAG_LLM_API_KEY", &mut self.llm.api_key),
            ("KB_RAG_RERANK_API_KEY", &mut self.rerank.api_key),
            ("KB_RAG_EMBEDDING_API_KEY", &mut self.embedding.api_key),
            ("KB_RAG_VECTOR_TOKEN", &mut self.vector_store.token),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rerank.score_floor, 0.35);
        assert_eq!(config.retrieval.per_keyword_limit, 5);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"rerank": {"top_n": 3}, "threshold": {"buffer_ratio": 0.5}}"#)
                .unwrap();
        assert_eq!(config.rerank.top_n, 3);
        assert_eq!(config.rerank.score_floor, 0.35);
        assert_eq!(config.threshold.buffer_ratio, 0.5);
        assert_eq!(config.threshold.high_confidence, 0.8);
        assert_eq!(config.budget.final_top_n, 8);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut config = PipelineConfig::default();
        config.threshold.buffer_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.merge.min_seed_chars = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let mut config = PipelineConfig::default();
        config.timeouts.rerank_secs = 0;
        match config.validate() {
            Err(PipelineError::Config(message)) => {
                assert_eq!(message, "timeouts.rerank_secs must be > 0")
            }
            other => panic!("expected config error, got {:?}", other),
        }

        let mut config = PipelineConfig::default();
        config.timeouts.generation_idle_secs = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_from_file_reports_config_errors() {
        let dir = std::env::temp_dir().join(format!("kb-rag-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let broken = dir.join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        let err = PipelineConfig::from_file(&broken).unwrap_err();
        assert!(err.to_string().starts_with("invalid configuration: failed to parse"));

        let zero = dir.join("zero.json");
        std::fs::write(&zero, r#"{"timeouts": {"expansion_secs": 0}}"#).unwrap();
        let err = PipelineConfig::from_file(&zero).unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: timeouts.expansion_secs must be > 0");

        let missing = PipelineConfig::from_file(&dir.join("absent.json"));
        assert!(matches!(missing, Err(PipelineError::Config(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
