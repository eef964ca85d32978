//! Multi-angle query expansion.
//!
//! One LLM call turns the question (plus recent history) into several
//! complementary retrieval queries and a single self-contained "grading"
//! restatement used for relevance scoring. Any failure falls back to the
//! question itself, so expansion never blocks a request.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;

use crate::config::ExpansionConfig;
use crate::error::{with_timeout, PipelineError};
use crate::llm::{ChatMessage, GenerationConfig, LLMProvider};
use crate::types::{recent_history, ConversationMessage, TurnRole};

const EXPANSION_OUTPUT_TOKENS: usize = 1024;

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("code fence regex is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedQueries {
    pub queries: Vec<String>,
    pub grade_query: String,
    pub reasoning: Option<String>,
    /// Why the question itself was used instead of model output.
    pub fallback: Option<String>,
}

impl ExpandedQueries {
    fn fallback(question: &str, reason: String) -> Self {
        Self {
            queries: vec![question.to_string()],
            grade_query: question.to_string(),
            reasoning: None,
            fallback: Some(reason),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExpansionReply {
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default, alias = "gradeQuery")]
    grade_query: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct QueryExpander {
    llm: Arc<dyn LLMProvider>,
    config: ExpansionConfig,
    timeout: Duration,
}

impl QueryExpander {
    pub fn new(llm: Arc<dyn LLMProvider>, config: ExpansionConfig, timeout: Duration) -> Self {
        Self {
            llm,
            config,
            timeout,
        }
    }

    pub async fn expand(&self, question: &str, history: &[ConversationMessage]) -> ExpandedQueries {
        let history = recent_history(history, self.config.max_history_turns);
        let prompt = self.build_prompt(question, history);
        let generation = GenerationConfig {
            max_tokens: EXPANSION_OUTPUT_TOKENS,
            temperature: self.config.temperature,
            web_search: false,
            json_output: true,
        };

        let started = Instant::now();
        let messages = [ChatMessage::system(prompt), ChatMessage::user(question)];
        let raw = match with_timeout("query expansion", self.timeout, self.llm.chat(&messages, &generation)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Query expansion call failed, using the question as-is");
                let reason = PipelineError::endpoint("query expansion", e).to_string();
                return ExpandedQueries::fallback(question, reason);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query expansion timed out, using the question as-is");
                return ExpandedQueries::fallback(question, e.to_string());
            }
        };

        let Some(reply) = parse_reply(&raw) else {
            tracing::warn!(
                output = %raw.chars().take(200).collect::<String>(),
                "Could not parse query expansion output, using the question as-is"
            );
            return ExpandedQueries::fallback(question, "unparseable expansion output".to_string());
        };

        let queries = normalize_queries(reply.queries, self.config.max_queries);
        if queries.is_empty() {
            tracing::warn!("Query expansion returned no queries, using the question as-is");
            return ExpandedQueries::fallback(question, "empty query list".to_string());
        }
        let grade_query = reply
            .grade_query
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| question.to_string());

        tracing::info!(
            queries = queries.len(),
            grade_query = %grade_query,
            duration_ms = started.elapsed().as_millis() as u64,
            "Query expansion complete"
        );
        ExpandedQueries {
            queries,
            grade_query,
            reasoning: reply.reasoning,
            fallback: None,
        }
    }

    fn build_prompt(&self, question: &str, history: &[ConversationMessage]) -> String {
        let history_block = if history.is_empty() {
            "(no prior conversation)".to_string()
        } else {
            history
                .iter()
                .map(|m| {
                    let who = match m.role {
                        TurnRole::User => "User",
                        TurnRole::Assistant => "Assistant",
                    };
                    format!("{}: {}", who, m.content)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "You are a search query optimization expert. Rewrite the user's current question into \
             {min}-{max} complementary search queries for a knowledge base that supports both \
             vector similarity and literal keyword search.\n\n\
             Guidelines:\n\
             1. Resolve pronouns and ellipsis from the conversation history.\n\
             2. Cover different angles: definition, mechanism, application, comparison.\n\
             3. Mix natural-language paraphrases with short keyword-bearing variants that \
             preserve exact names, codes and numbers from the question.\n\
             4. Keep each query concise and self-contained.\n\
             5. Also write exactly one grade_query: a fully resolved, pronoun-free restatement of \
             the current question that can be understood without the history.\n\n\
             Conversation history:\n{history}\n\n\
             Current question: {question}\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"queries\": [\"...\"], \"grade_query\": \"...\", \"reasoning\": \"...\"}}",
            min = self.config.min_queries,
            max = self.config.max_queries,
            history = history_block,
            question = question,
        )
    }
}

/// Three-tier parse: whole output, first `{...}` span, bare string array.
fn parse_reply(output: &str) -> Option<ExpansionReply> {
    let trimmed = match CODE_FENCE_RE.captures(output) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
        None => output.trim(),
    };

    if let Ok(reply) = serde_json::from_str::<ExpansionReply>(trimmed) {
        return Some(reply);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(reply) = serde_json::from_str::<ExpansionReply>(&trimmed[start..=end]) {
                return Some(reply);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            if let Ok(queries) = serde_json::from_str::<Vec<String>>(&trimmed[start..=end]) {
                return Some(ExpansionReply {
                    queries,
                    grade_query: None,
                    reasoning: None,
                });
            }
        }
    }
    None
}

fn normalize_queries(queries: Vec<String>, max_queries: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.clone()))
        .take(max_queries)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatStreamEvent, ProviderInfo};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct CannedLlm {
        reply: Result<String, String>,
        delay: Duration,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedLlm {
        fn ok(reply: &str) -> Self {
            Self { reply: Ok(reply.to_string()), delay: Duration::ZERO, prompts: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl LLMProvider for CannedLlm {
        async fn chat(&self, messages: &[ChatMessage], _config: &GenerationConfig) -> Result<String> {
            self.prompts.lock().push(messages[0].content.clone());
            tokio::time::sleep(self.delay).await;
            self.reply.clone().map_err(anyhow::Error::msg)
        }

        async fn chat_stream(&self, _m: &[ChatMessage], _c: &GenerationConfig) -> Result<mpsc::Receiver<ChatStreamEvent>> {
            anyhow::bail!("not used")
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "canned".into(),
                model: "canned".into(),
                supports_web_search: false,
                supports_thinking: false,
            }
        }
    }

    fn expander(llm: CannedLlm) -> QueryExpander {
        QueryExpander::new(Arc::new(llm), ExpansionConfig::default(), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_structured_reply() {
        let reply = r#"```json
{"queries": ["supervised learning definition", "labeled data training", "supervised learning definition", " "],
 "grade_query": "What is supervised learning?", "reasoning": "cover definition and data"}
```"#;
        let out = expander(CannedLlm::ok(reply)).expand("What is it?", &[]).await;
        assert_eq!(out.queries, vec!["supervised learning definition", "labeled data training"]);
        assert_eq!(out.grade_query, "What is supervised learning?");
        assert!(out.fallback.is_none());
    }

    #[tokio::test]
    async fn test_history_in_prompt_is_truncated() {
        let history: Vec<ConversationMessage> = (0..14)
            .map(|i| if i % 2 == 0 { ConversationMessage::user(format!("q{}", i)) } else { ConversationMessage::assistant(format!("a{}", i)) })
            .collect();
        let llm = Arc::new(CannedLlm::ok(r#"{"queries": ["x"]}"#));
        let expander = QueryExpander::new(llm.clone(), ExpansionConfig::default(), Duration::from_millis(100));
        let out = expander.expand("and then?", &history).await;

        assert_eq!(out.grade_query, "and then?");
        let prompt = llm.prompts.lock()[0].clone();
        assert!(prompt.contains("User: q4"));
        assert!(!prompt.contains("User: q2\n"));
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_question() {
        let failing = CannedLlm { reply: Err("503".into()), delay: Duration::ZERO, prompts: Mutex::new(Vec::new()) };
        let out = expander(failing).expand("What is RAG?", &[]).await;
        assert_eq!(out.queries, vec!["What is RAG?"]);
        assert_eq!(out.grade_query, "What is RAG?");
        assert_eq!(out.fallback.as_deref(), Some("query expansion endpoint failed: 503"));

        let slow = CannedLlm { reply: Ok(r#"{"queries":["x"]}"#.into()), delay: Duration::from_secs(5), prompts: Mutex::new(Vec::new()) };
        let out = expander(slow).expand("What is RAG?", &[]).await;
        assert_eq!(out.queries, vec!["What is RAG?"]);

        let out = expander(CannedLlm::ok(r#"{"queries": []}"#)).expand("What is RAG?", &[]).await;
        assert_eq!(out.fallback.as_deref(), Some("empty query list"));

        let out = expander(CannedLlm::ok("I cannot help")).expand("What is RAG?", &[]).await;
        assert_eq!(out.queries, vec!["What is RAG?"]);
    }

    #[test]
    fn test_parse_tiers() {
        let embedded = parse_reply("Sure! {\"queries\": [\"a\"], \"gradeQuery\": \"g\"} hope this helps").unwrap();
        assert_eq!(embedded.queries, vec!["a"]);
        assert_eq!(embedded.grade_query.as_deref(), Some("g"));

        let bare = parse_reply("queries: [\"a\", \"b\"]").unwrap();
        assert_eq!(bare.queries, vec!["a", "b"]);
        assert!(bare.grade_query.is_none());
    }

    #[test]
    fn test_clamps_to_max() {
        let many: Vec<String> = (0..15).map(|i| format!("q{}", i)).collect();
        assert_eq!(normalize_queries(many, 10).len(), 10);
    }
}
