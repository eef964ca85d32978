//! Multi-query hybrid retrieval: vector and lexical search per sub-query, run concurrently

use std::time::{Duration, Instant};

use futures::future::join_all;

use super::dedup::ResultsByChannel;
use crate::config::RetrievalConfig;
use crate::error::{with_timeout, PipelineError};
use crate::storage::KnowledgeBase;
use crate::types::{CandidatePassage, Query, QueryChannel, RetrievalChannel};

/// How a single search call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Hits(usize),
    Empty,
    Failed(String),
    TimedOut,
}

impl CallOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CallOutcome::Failed(_) | CallOutcome::TimedOut)
    }
}

#[derive(Debug, Clone)]
pub struct CallReport {
    pub query: Query,
    pub outcome: CallOutcome,
    pub duration: Duration,
}

/// Everything one retrieval fan-out produced.
#[derive(Debug, Clone, Default)]
pub struct RetrievalBatch {
    pub results: ResultsByChannel,
    pub calls: Vec<CallReport>,
}

impl RetrievalBatch {
    pub fn failed_calls(&self) -> usize {
        self.calls.iter().filter(|c| c.outcome.is_failure()).count()
    }
}

pub struct HybridRetriever {
    config: RetrievalConfig,
    call_timeout: Duration,
}

impl HybridRetriever {
    pub fn new(config: RetrievalConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
        }
    }

    /// Run a vector and a lexical search for every query, all at once.
    ///
    /// Never fails: a call that errors or times out contributes an empty list.
    /// Dropping the returned future cancels every in-flight call.
    pub async fn retrieve(&self, queries: &[String], kb: &dyn KnowledgeBase) -> RetrievalBatch {
        let plan: Vec<Query> = queries
            .iter()
            .flat_map(|q| [Query::semantic(q.as_str()), Query::lexical(q.as_str())])
            .collect();

        let started = Instant::now();
        let outcomes = join_all(plan.into_iter().map(|query| self.run_one(query, kb))).await;

        let mut batch = RetrievalBatch::default();
        for (report, hits) in outcomes {
            match report.query.channel {
                QueryChannel::Semantic => batch.results.vector.push(hits),
                QueryChannel::Lexical => batch.results.keyword.push(hits),
            }
            batch.calls.push(report);
        }

        tracing::info!(
            queries = queries.len(),
            calls = batch.calls.len(),
            failed = batch.failed_calls(),
            hits = batch.results.total_hits(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Hybrid retrieval complete"
        );
        batch
    }

    async fn run_one(
        &self,
        query: Query,
        kb: &dyn KnowledgeBase,
    ) -> (CallReport, Vec<CandidatePassage>) {
        let started = Instant::now();
        let channel = RetrievalChannel::from(query.channel);

        let result = match query.channel {
            QueryChannel::Semantic => {
                with_timeout(
                    "vector search",
                    self.call_timeout,
                    kb.vector_search(&query.text, self.config.top_k),
                )
                .await
            }
            QueryChannel::Lexical => {
                let keywords = extract_keywords(
                    &query.text,
                    self.config.whole_query_max_chars,
                    self.config.min_keyword_chars,
                );
                match build_like_expression(&keywords, &self.config.lexical_fields) {
                    Some(expression) => {
                        let limit = self.config.per_keyword_limit * keywords.len();
                        with_timeout(
                            "lexical search",
                            self.call_timeout,
                            kb.lexical_search(&expression, limit, &self.config.lexical_fields),
                        )
                        .await
                    }
                    None => Ok(Ok(Vec::new())),
                }
            }
        };

        let (outcome, hits) = match result {
            Ok(Ok(hits)) if hits.is_empty() => (CallOutcome::Empty, Vec::new()),
            Ok(Ok(hits)) => {
                let passages: Vec<CandidatePassage> = hits
                    .into_iter()
                    .map(|hit| CandidatePassage::from_hit(hit, channel))
                    .collect();
                (CallOutcome::Hits(passages.len()), passages)
            }
            Ok(Err(e)) => {
                tracing::warn!(channel = ?channel, query = %query.text, error = %e, "Search call failed");
                (CallOutcome::Failed(e.to_string()), Vec::new())
            }
            Err(PipelineError::Timeout { after, .. }) => {
                tracing::warn!(
                    channel = ?channel,
                    query = %query.text,
                    timeout_ms = after.as_millis() as u64,
                    "Search call timed out"
                );
                (CallOutcome::TimedOut, Vec::new())
            }
            Err(e) => (CallOutcome::Failed(e.to_string()), Vec::new()),
        };

        let report = CallReport {
            query,
            outcome,
            duration: started.elapsed(),
        };
        (report, hits)
    }
}

/// Keywords for the lexical channel.
///
/// Short queries are matched whole; longer ones are split on whitespace and
/// tokens shorter than `min_keyword_chars` are dropped.
pub fn extract_keywords(
    query: &str,
    whole_query_max_chars: usize,
    min_keyword_chars: usize,
) -> Vec<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.chars().count() < whole_query_max_chars {
        return vec![trimmed.to_string()];
    }

    let mut keywords: Vec<String> = Vec::new();
    for token in trimmed.split_whitespace() {
        if token.chars().count() >= min_keyword_chars && !keywords.iter().any(|k| k == token) {
            keywords.push(token.to_string());
        }
    }
    keywords
}

/// `field like "%kw%" or ...` over every keyword and field. `None` when there
/// is nothing to match.
pub fn build_like_expression(keywords: &[String], fields: &[String]) -> Option<String> {
    let clauses: Vec<String> = keywords
        .iter()
        .flat_map(|kw| {
            let escaped = escape_like_literal(kw);
            fields
                .iter()
                .map(move |field| format!("{} like \"%{}%\"", field, escaped))
        })
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" or "))
    }
}

fn escape_like_literal(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        match c {
            '\\' | '"' | '%' | '_' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PassageHit;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn test_short_query_used_whole() {
        assert_eq!(extract_keywords("  监督学习 ", 10, 2), vec!["监督学习"]);
        assert_eq!(extract_keywords("a b", 10, 2), vec!["a b"]);
        assert!(extract_keywords("   ", 10, 2).is_empty());
    }

    #[test]
    fn test_long_query_split_and_filtered() {
        let keywords = extract_keywords("what is a supervised learning model model", 10, 2);
        assert_eq!(keywords, vec!["what", "is", "supervised", "learning", "model"]);

        let keywords = extract_keywords("x y z supervised", 10, 3);
        assert_eq!(keywords, vec!["supervised"]);
    }

    #[test]
    fn test_like_expression() {
        let fields = vec!["text".to_string()];
        let expr = build_like_expression(&["labeled".into(), "say \"hi\"".into()], &fields).unwrap();
        assert_eq!(expr, r#"text like "%labeled%" or text like "%say \"hi\"%""#);
        assert!(build_like_expression(&[], &fields).is_none());

        let two = build_like_expression(&["k".into()], &["text".into(), "fileName".into()]).unwrap();
        assert_eq!(two, r#"text like "%k%" or fileName like "%k%""#);
    }

    #[test]
    fn test_escapes_wildcards() {
        assert_eq!(escape_like_literal("50%_off"), r"50\%\_off");
    }

    struct ScriptedKb {
        lexical_limits: Mutex<Vec<usize>>,
    }

    fn hit(id: &str) -> PassageHit {
        PassageHit {
            id: id.into(),
            document_id: "doc".into(),
            chunk_index: Some(0),
            text: id.into(),
            file_name: None,
        }
    }

    #[async_trait]
    impl KnowledgeBase for ScriptedKb {
        async fn vector_search(&self, query: &str, _k: usize) -> Result<Vec<PassageHit>> {
            match query {
                "boom" => anyhow::bail!("connection reset"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(vec![hit("late")])
                }
                _ => Ok(vec![hit(&format!("v-{}", query))]),
            }
        }

        async fn lexical_search(&self, _e: &str, limit: usize, _f: &[String]) -> Result<Vec<PassageHit>> {
            self.lexical_limits.lock().push(limit);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_partial_failure_tolerated() {
        let kb = ScriptedKb { lexical_limits: Mutex::new(Vec::new()) };
        let retriever = HybridRetriever::new(RetrievalConfig::default(), Duration::from_millis(50));
        let queries = vec!["ok".to_string(), "boom".to_string(), "slow".to_string()];

        let batch = retriever.retrieve(&queries, &kb).await;

        assert_eq!(batch.calls.len(), 6);
        assert_eq!(batch.results.vector.len(), 3);
        assert_eq!(batch.results.keyword.len(), 3);
        assert_eq!(batch.results.vector[0][0].id, "v-ok");
        assert_eq!(batch.results.vector[0][0].retrieval_channel, RetrievalChannel::Vector);
        assert!(batch.results.vector[1].is_empty());
        assert!(batch.results.vector[2].is_empty());
        assert_eq!(batch.failed_calls(), 2);
        assert!(batch
            .calls
            .iter()
            .any(|c| c.query.text == "slow" && c.outcome == CallOutcome::TimedOut));
        // One keyword per short query, five hits allowed per keyword.
        assert_eq!(*kb.lexical_limits.lock(), vec![5, 5, 5]);
    }
}
