//! Cross-encoder relevance scoring endpoint

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::RerankConfig;

/// One scored input, `index` pointing back into the request's documents.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RelevanceResult {
    pub index: usize,
    #[serde(alias = "relevanceScore", alias = "score")]
    pub relevance_score: f32,
}

/// Scores `(query, document)` pairs.
///
/// Implementations drop results below `score_floor` before returning, so the
/// result list may be a subset of the inputs.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(
        &self,
        query: &str,
        documents: &[String],
        score_floor: f32,
    ) -> Result<Vec<RelevanceResult>>;
}

#[derive(Deserialize)]
struct RerankEnvelope {
    #[serde(default)]
    results: Option<Vec<RelevanceResult>>,
    #[serde(default)]
    output: Option<RerankOutput>,
}

#[derive(Deserialize)]
struct RerankOutput {
    #[serde(default)]
    results: Vec<RelevanceResult>,
}

impl RerankEnvelope {
    fn into_results(self) -> Result<Vec<RelevanceResult>> {
        match (self.results, self.output) {
            (Some(results), _) => Ok(results),
            (None, Some(output)) => Ok(output.results),
            (None, None) => Err(anyhow!("rerank response has neither `results` nor `output.results`")),
        }
    }
}

/// DashScope-style rerank API client:
/// `{model, input: {query, documents}, parameters: {return_documents}}`.
pub struct HttpRerankClient {
    endpoint: String,
    model: String,
    api_key: String,
    client: Client,
}

impl HttpRerankClient {
    pub fn new(config: &RerankConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[async_trait]
impl RelevanceScorer for HttpRerankClient {
    async fn score(
        &self,
        query: &str,
        documents: &[String],
        score_floor: f32,
    ) -> Result<Vec<RelevanceResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let payload = json!({
            "model": self.model,
            "input": { "query": query, "documents": documents },
            "parameters": { "return_documents": false },
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Rerank request to {} failed", self.endpoint))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read rerank response body")?;
        if !status.is_success() {
            let preview: String = body.chars().take(300).collect();
            return Err(anyhow!("Rerank API error (HTTP {}): {}", status, preview));
        }

        let results = parse_rerank_body(&body)?;
        let total = results.len();
        let kept = apply_floor(results, score_floor);
        if kept.len() < total {
            tracing::info!(
                floor = score_floor,
                dropped = total - kept.len(),
                kept = kept.len(),
                "Applied rerank score floor"
            );
        }
        Ok(kept)
    }
}

pub(crate) fn parse_rerank_body(body: &str) -> Result<Vec<RelevanceResult>> {
    let envelope: RerankEnvelope = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!("Malformed rerank response: {}. Body: {}", e, preview)
    })?;
    envelope.into_results()
}

pub(crate) fn apply_floor(results: Vec<RelevanceResult>, score_floor: f32) -> Vec<RelevanceResult> {
    results
        .into_iter()
        .filter(|r| r.relevance_score >= score_floor)
        .collect()
}
