use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::client::RelevanceScorer;
use crate::error::{with_timeout, PipelineError};
use crate::types::{CandidatePassage, ScoredPassage};

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub passages: Vec<ScoredPassage>,
    /// Set when scoring failed and `passages` are the unscored head of the input.
    pub degraded: Option<String>,
    pub input_count: usize,
}

impl RerankOutcome {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

pub struct Reranker {
    scorer: Arc<dyn RelevanceScorer>,
    timeout: Duration,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>, timeout: Duration) -> Self {
        Self { scorer, timeout }
    }

    /// Score against `grade_query`, drop anything under `score_floor`, and keep
    /// the best `top_n` in descending score order.
    ///
    /// Never fails. If the scorer errors or times out the first `top_n` inputs
    /// come back unscored and `degraded` carries the reason.
    pub async fn rerank(
        &self,
        grade_query: &str,
        passages: Vec<CandidatePassage>,
        top_n: usize,
        score_floor: f32,
    ) -> RerankOutcome {
        let input_count = passages.len();
        if passages.is_empty() {
            return RerankOutcome {
                passages: Vec::new(),
                degraded: None,
                input_count,
            };
        }

        let documents: Vec<String> = passages.iter().map(scoring_text).collect();
        let started = Instant::now();
        let result = with_timeout(
            "rerank",
            self.timeout,
            self.scorer.score(grade_query, &documents, score_floor),
        )
        .await;

        let reason = match result {
            Ok(Ok(results)) => {
                let scored = assemble(passages, results, top_n, score_floor);
                tracing::info!(
                    input = input_count,
                    kept = scored.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Rerank complete"
                );
                return RerankOutcome {
                    passages: scored,
                    degraded: None,
                    input_count,
                };
            }
            Ok(Err(e)) => PipelineError::endpoint("rerank", e).to_string(),
            Err(e) => e.to_string(),
        };

        tracing::warn!(error = %reason, fallback = top_n.min(input_count), "Rerank failed, passing candidates through unscored");
        RerankOutcome {
            passages: passages
                .into_iter()
                .take(top_n)
                .map(ScoredPassage::unscored)
                .collect(),
            degraded: Some(reason),
            input_count,
        }
    }
}

/// Passage text as the scorer sees it, led by its file name when known.
fn scoring_text(passage: &CandidatePassage) -> String {
    match &passage.source_file_name {
        Some(name) => format!("{}\n{}", name, passage.text),
        None => passage.text.clone(),
    }
}

fn assemble(
    passages: Vec<CandidatePassage>,
    results: Vec<super::client::RelevanceResult>,
    top_n: usize,
    score_floor: f32,
) -> Vec<ScoredPassage> {
    let mut slots: Vec<Option<CandidatePassage>> = passages.into_iter().map(Some).collect();
    let mut seen = HashSet::new();
    let mut scored = Vec::with_capacity(results.len());

    for result in results {
        if !result.relevance_score.is_finite() || result.relevance_score < score_floor {
            continue;
        }
        if !seen.insert(result.index) {
            continue;
        }
        match slots.get_mut(result.index).and_then(Option::take) {
            Some(passage) => scored.push(ScoredPassage::scored(passage, result.relevance_score)),
            None => {
                tracing::warn!(index = result.index, "Rerank result index out of range, ignoring");
            }
        }
    }

    scored.sort_by(|a, b| {
        b.sort_score()
            .partial_cmp(&a.sort_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(top_n);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reranking::client::RelevanceResult;
    use crate::types::RetrievalChannel;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn candidate(id: &str, file: Option<&str>) -> CandidatePassage {
        CandidatePassage {
            id: id.to_string(),
            source_document_id: "doc".to_string(),
            chunk_index: None,
            text: format!("text {}", id),
            source_file_name: file.map(String::from),
            retrieval_channel: RetrievalChannel::Vector,
        }
    }

    struct FixedScorer {
        scores: Vec<(usize, f32)>,
        seen_documents: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelevanceScorer for FixedScorer {
        async fn score(&self, _q: &str, documents: &[String], floor: f32) -> Result<Vec<RelevanceResult>> {
            *self.seen_documents.lock() = documents.to_vec();
            Ok(self
                .scores
                .iter()
                .filter(|(_, s)| *s >= floor)
                .map(|&(index, relevance_score)| RelevanceResult { index, relevance_score })
                .collect())
        }
    }

    struct HangingScorer;

    #[async_trait]
    impl RelevanceScorer for HangingScorer {
        async fn score(&self, _q: &str, _d: &[String], _f: f32) -> Result<Vec<RelevanceResult>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_sorted_floored_truncated() {
        let scorer = Arc::new(FixedScorer {
            scores: vec![(0, 0.4), (1, 0.9), (2, 0.2), (3, 0.7), (9, 0.99), (1, 0.95)],
            seen_documents: Mutex::new(Vec::new()),
        });
        let reranker = Reranker::new(scorer.clone(), Duration::from_secs(1));
        let passages = vec![
            candidate("a", Some("intro.md")),
            candidate("b", None),
            candidate("c", None),
            candidate("d", None),
        ];

        let outcome = reranker.rerank("q", passages, 2, 0.35).await;

        assert!(!outcome.is_degraded());
        let ids: Vec<&str> = outcome.passages.iter().map(|p| p.passage.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
        assert_eq!(outcome.passages[0].relevance_score, Some(0.9));
        assert_eq!(scorer.seen_documents.lock()[0], "intro.md\ntext a");
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_unscored_head() {
        let reranker = Reranker::new(Arc::new(HangingScorer), Duration::from_millis(20));
        let passages = vec![candidate("a", None), candidate("b", None), candidate("c", None)];

        let outcome = reranker.rerank("q", passages, 2, 0.35).await;

        assert!(outcome.is_degraded());
        assert!(outcome.degraded.as_deref().unwrap_or("").contains("timed out"));
        assert_eq!(outcome.passages.len(), 2);
        assert_eq!(outcome.passages[0].passage.id, "a");
        assert!(outcome.passages.iter().all(|p| p.relevance_score.is_none()));
    }

    struct RejectingScorer;

    #[async_trait]
    impl RelevanceScorer for RejectingScorer {
        async fn score(&self, _q: &str, _d: &[String], _f: f32) -> Result<Vec<RelevanceResult>> {
            anyhow::bail!("401 Unauthorized")
        }
    }

    #[tokio::test]
    async fn test_scorer_error_names_the_endpoint() {
        let reranker = Reranker::new(Arc::new(RejectingScorer), Duration::from_secs(1));
        let outcome = reranker.rerank("q", vec![candidate("a", None)], 8, 0.35).await;

        assert_eq!(outcome.degraded.as_deref(), Some("rerank endpoint failed: 401 Unauthorized"));
        assert_eq!(outcome.passages.len(), 1);
        assert!(outcome.passages[0].relevance_score.is_none());
    }

    #[tokio::test]
    async fn test_empty_input_skips_scorer() {
        let reranker = Reranker::new(Arc::new(HangingScorer), Duration::from_millis(20));
        let outcome = reranker.rerank("q", Vec::new(), 8, 0.35).await;
        assert!(outcome.passages.is_empty());
        assert!(!outcome.is_degraded());
    }
}
