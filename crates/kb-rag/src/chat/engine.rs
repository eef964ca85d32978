use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::embeddings::OpenAiEmbeddings;
use crate::error::{with_timeout, PipelineError, PipelineResult};
use crate::llm::{ChatMessage, ChatStreamEvent, GenerationConfig, LLMProvider, OpenAiCompatibleProvider};
use crate::rag::{assemble_context, ChunkMerger, ContextBudgeter, QueryExpander};
use crate::reranking::{AdaptiveThreshold, HttpRerankClient, RelevanceScorer, Reranker};
use crate::search::{dedupe, HybridRetriever};
use crate::storage::{KnowledgeBaseKey, KnowledgeBaseRegistry, MilvusFactory};
use crate::tokens::{default_counter, TokenCounter};
use crate::types::{recent_history, CandidatePassage, MergedPassage, ScoredPassage, ThresholdMethod};

use super::{
    build_system_prompt, retrieval_failed_context, PipelineEvent, PipelineOutput, PipelineRequest,
    Stage, StageStatus, UsageReport, NO_DOCUMENTS_CONTEXT,
};

const EVENT_BUFFER: usize = 256;
const PREVIEW_CHARS: usize = 300;

/// Sequences the retrieval stages for one request and streams progress plus
/// the generated answer over a single channel.
///
/// Stage failures degrade the context instead of aborting: the request always
/// reaches generation, and only a generation failure ends it with an error.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    registry: Arc<KnowledgeBaseRegistry>,
    llm: Arc<dyn LLMProvider>,
    expander: QueryExpander,
    retriever: HybridRetriever,
    reranker: Reranker,
    threshold: AdaptiveThreshold,
    merger: ChunkMerger,
    budgeter: ContextBudgeter,
    counter: Arc<dyn TokenCounter>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<KnowledgeBaseRegistry>,
        llm: Arc<dyn LLMProvider>,
        scorer: Arc<dyn RelevanceScorer>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        let timeouts = &config.timeouts;
        Self {
            expander: QueryExpander::new(Arc::clone(&llm), config.expansion.clone(), timeouts.expansion()),
            retriever: HybridRetriever::new(config.retrieval.clone(), timeouts.retrieval()),
            reranker: Reranker::new(scorer, timeouts.rerank()),
            threshold: AdaptiveThreshold::new(&config.threshold),
            merger: ChunkMerger::new(&config.merge),
            budgeter: ContextBudgeter::new(Arc::clone(&counter)),
            counter,
            registry,
            llm,
            config,
        }
    }

    /// Wire the HTTP endpoint adapters described by `config`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let timeouts = &config.timeouts;
        let embeddings = Arc::new(OpenAiEmbeddings::new(&config.embedding, timeouts.retrieval())?);
        let factory = Arc::new(MilvusFactory::new(
            config.vector_store.clone(),
            embeddings,
            timeouts.retrieval(),
        )?);
        let registry = Arc::new(KnowledgeBaseRegistry::new(
            factory,
            Duration::from_secs(config.vector_store.idle_timeout_secs),
        ));
        let llm = Arc::new(OpenAiCompatibleProvider::new(
            config.llm.provider.clone(),
            config.llm.api_key.clone(),
            config.llm.model.clone(),
            timeouts.generation_connect(),
        )?);
        let scorer = Arc::new(HttpRerankClient::new(&config.rerank, timeouts.rerank())?);

        tracing::info!(
            llm = %config.llm.model,
            rerank = %config.rerank.model,
            vector_store = %config.vector_store.uri,
            "Pipeline endpoints configured"
        );
        Ok(Self::new(config, registry, llm, scorer, default_counter()))
    }

    pub fn registry(&self) -> &Arc<KnowledgeBaseRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start a request in the background.
    ///
    /// The receiver yields progress events and answer deltas in order and
    /// closes after `Done` or `Error`. Firing `cancel` or dropping the
    /// receiver aborts in-flight endpoint calls and ends the stream with no
    /// further output.
    pub fn stream(
        self: &Arc<Self>,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PipelineOutput> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("rag_request", %request_id, kb = ?request.knowledge_base);

        tokio::spawn(
            async move {
                let watch = tx.clone();
                let mut emitter = Emitter::new(tx);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!("Request cancelled by caller");
                    }
                    _ = watch.closed() => {
                        tracing::info!("Consumer went away, abandoning request");
                    }
                    result = this.run(&request, &mut emitter) => match result {
                        Ok(()) => {}
                        Err(PipelineError::Cancelled) => {
                            tracing::info!("Consumer went away, abandoning request");
                        }
                        Err(e) => tracing::error!(error = %e, "Request ended without a terminal event"),
                    }
                }
            }
            .instrument(span),
        );
        rx
    }

    async fn run(&self, request: &PipelineRequest, out: &mut Emitter) -> PipelineResult<()> {
        let started = Instant::now();
        tracing::info!(question = %request.question, history = request.history.len(), "RAG request started");

        let context = match request.knowledge_base {
            Some(key) => self.build_context(request, key, out).await?,
            None => NO_DOCUMENTS_CONTEXT.to_string(),
        };
        self.generate(request, &context, started, out).await
    }

    /// Run the retrieval stages, turning any unrecovered failure into an
    /// error event and a placeholder context.
    async fn build_context(
        &self,
        request: &PipelineRequest,
        key: KnowledgeBaseKey,
        out: &mut Emitter,
    ) -> PipelineResult<String> {
        match self.retrieval_stages(request, key, out).await {
            Ok(context) => Ok(context),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                let stage = out.current_stage().unwrap_or(Stage::QueryExpansion);
                tracing::error!(stage = ?stage, error = %e, "RAG stages failed, answering without retrieved context");
                let placeholder = retrieval_failed_context(&e);
                out.finish(PipelineEvent::new(stage, StageStatus::Error, placeholder.clone()))
                    .await?;
                Ok(placeholder)
            }
        }
    }

    async fn retrieval_stages(
        &self,
        request: &PipelineRequest,
        key: KnowledgeBaseKey,
        out: &mut Emitter,
    ) -> PipelineResult<String> {
        // Query expansion
        out.running(Stage::QueryExpansion, "Rewriting the question into search queries")
            .await?;
        let expanded = self
            .expander
            .expand(&request.question, &request.history)
            .await;
        let description = match &expanded.fallback {
            None => format!("Generated {} search queries", expanded.queries.len()),
            Some(reason) => format!("Searching with the original question ({})", reason),
        };
        out.finish(
            PipelineEvent::new(Stage::QueryExpansion, StageStatus::Completed, description)
                .with_content(bullet_list(&expanded.queries)),
        )
        .await?;

        // Retrieval
        out.running(
            Stage::Retrieval,
            format!("Searching {} in parallel with {} queries", key, expanded.queries.len()),
        )
        .await?;
        let kb = self.registry.lease(key).await?;
        let batch = self.retriever.retrieve(&expanded.queries, kb.as_ref()).await;
        let failed = batch.failed_calls();
        let total_calls = batch.calls.len();
        let candidates = dedupe(batch.results);
        let mut description = format!("Found {} candidate passages", candidates.len());
        if failed > 0 {
            description.push_str(&format!(" ({} of {} searches failed)", failed, total_calls));
        }
        out.finish(
            PipelineEvent::new(Stage::Retrieval, StageStatus::Completed, description)
                .with_content(candidate_list(&candidates)),
        )
        .await?;

        // Rerank
        let rerank_config = &self.config.rerank;
        out.running(Stage::Rerank, format!("Scoring {} passages", candidates.len()))
            .await?;
        let reranked = self
            .reranker
            .rerank(&expanded.grade_query, candidates, rerank_config.top_n, rerank_config.score_floor)
            .await;
        let event = match &reranked.degraded {
            Some(reason) => PipelineEvent::new(
                Stage::Rerank,
                StageStatus::Error,
                format!(
                    "Relevance scoring unavailable, keeping the first {} passages unscored: {}",
                    reranked.passages.len(),
                    reason
                ),
            ),
            None => PipelineEvent::new(
                Stage::Rerank,
                StageStatus::Completed,
                format!(
                    "Kept {} of {} passages scoring at least {:.2}",
                    reranked.passages.len(),
                    reranked.input_count,
                    rerank_config.score_floor
                ),
            ),
        };
        out.finish(event.with_content(scored_list(&reranked.passages)))
            .await?;

        // Adaptive cutoff
        out.running(Stage::AdaptiveFilter, "Looking for the natural score boundary")
            .await?;
        let (kept, threshold) = self.threshold.filter(reranked.passages);
        let description = match threshold.method {
            ThresholdMethod::Clustered => format!(
                "Cutoff {:.3} kept {} of {} passages (high cluster {:.0}%)",
                threshold.cutoff,
                threshold.kept,
                threshold.kept + threshold.dropped,
                threshold.high_cluster_ratio * 100.0
            ),
            ThresholdMethod::HighConfidence => {
                format!("Top passage is high confidence, kept all {}", threshold.kept)
            }
            ThresholdMethod::TooFewScores | ThresholdMethod::Uniform => {
                format!("No score boundary to split on, kept {} passages", threshold.kept)
            }
            ThresholdMethod::Unscored => {
                format!("Passages are unscored, kept all {}", threshold.kept)
            }
        };
        out.finish(PipelineEvent::new(Stage::AdaptiveFilter, StageStatus::Completed, description))
            .await?;

        // Merge
        out.running(Stage::Merge, "Stitching adjacent chunks").await?;
        let input = kept.len();
        let merged = self.merger.merge(kept);
        out.finish(PipelineEvent::new(
            Stage::Merge,
            StageStatus::Completed,
            format!("Merged {} passages into {} spans", input, merged.len()),
        ))
        .await?;

        // Context
        let budget = &self.config.budget;
        out.running(Stage::ContextBuild, "Selecting passages for the answer")
            .await?;
        let budgeted = self
            .budgeter
            .budget(merged, budget.final_top_n, budget.preview_token_budget);
        let context = if budgeted.context_set.is_empty() {
            NO_DOCUMENTS_CONTEXT.to_string()
        } else {
            assemble_context(&budgeted.context_set)
        };
        out.finish(
            PipelineEvent::new(
                Stage::ContextBuild,
                StageStatus::Completed,
                format!(
                    "Using {} passages ({} shown, {} tokens)",
                    budgeted.context_set.len(),
                    budgeted.preview_set.len(),
                    budgeted.preview_tokens
                ),
            )
            .with_content(merged_list(&budgeted.preview_set)),
        )
        .await?;

        Ok(context)
    }

    async fn generate(
        &self,
        request: &PipelineRequest,
        context: &str,
        started: Instant,
        out: &mut Emitter,
    ) -> PipelineResult<()> {
        out.running(Stage::Generation, "Generating the answer").await?;

        let system = build_system_prompt(request.system_prompt.as_deref(), context);
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(
            recent_history(&request.history, self.config.budget.max_history_turns)
                .iter()
                .map(ChatMessage::from),
        );
        messages.push(ChatMessage::user(request.question.as_str()));
        let prompt_tokens: usize = messages.iter().map(|m| self.counter.count(&m.content)).sum();

        let generation = GenerationConfig {
            max_tokens: self.config.llm.max_tokens,
            temperature: self.config.llm.temperature,
            web_search: self.config.llm.enable_web_search,
            json_output: false,
        };

        let answer = match self.stream_answer(&messages, &generation, out).await {
            Ok(answer) => answer,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                tracing::error!(error = %e, "Answer generation failed");
                out.finish(PipelineEvent::new(Stage::Generation, StageStatus::Error, e.to_string()))
                    .await?;
                out.send(PipelineOutput::Error(e.to_string())).await?;
                return Ok(());
            }
        };

        let completion_tokens = answer.chars().count();
        out.finish(PipelineEvent::new(
            Stage::Generation,
            StageStatus::Completed,
            format!("Answered in {} characters", completion_tokens),
        ))
        .await?;
        out.send(PipelineOutput::RagSummary(out.summary.clone())).await?;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(prompt_tokens, completion_tokens, latency_ms, "RAG request complete");
        out.send(PipelineOutput::Usage(UsageReport {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            latency_ms,
        }))
        .await?;
        out.send(PipelineOutput::Done).await
    }

    /// Relay deltas as they arrive. The connect timeout bounds the wait for
    /// the stream to open; the idle timeout bounds each gap between deltas.
    async fn stream_answer(
        &self,
        messages: &[ChatMessage],
        generation: &GenerationConfig,
        out: &mut Emitter,
    ) -> PipelineResult<String> {
        let timeouts = &self.config.timeouts;
        let mut rx = with_timeout(
            "generation",
            timeouts.generation_connect(),
            self.llm.chat_stream(messages, generation),
        )
        .await?
        .map_err(|e| PipelineError::Generation(e.to_string()))?;

        let idle = timeouts.generation_idle();
        let mut answer = String::new();
        loop {
            let event = match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    return Err(PipelineError::Timeout {
                        operation: "generation",
                        after: idle,
                    })
                }
            };
            match event {
                ChatStreamEvent::ContentDelta(text) => {
                    answer.push_str(&text);
                    out.send(PipelineOutput::Content(text)).await?;
                }
                ChatStreamEvent::ReasoningDelta(text) => {
                    out.send(PipelineOutput::Reasoning(text)).await?;
                }
                ChatStreamEvent::Done => break,
                ChatStreamEvent::Failed(message) => {
                    return Err(PipelineError::Generation(message));
                }
            }
        }
        Ok(answer)
    }
}

/// Ordered outward channel plus the bookkeeping for stage events.
struct Emitter {
    tx: mpsc::Sender<PipelineOutput>,
    current: Option<(Stage, Instant)>,
    summary: Vec<PipelineEvent>,
}

impl Emitter {
    fn new(tx: mpsc::Sender<PipelineOutput>) -> Self {
        Self {
            tx,
            current: None,
            summary: Vec::new(),
        }
    }

    fn current_stage(&self) -> Option<Stage> {
        self.current.map(|(stage, _)| stage)
    }

    async fn send(&self, output: PipelineOutput) -> PipelineResult<()> {
        self.tx
            .send(output)
            .await
            .map_err(|_| PipelineError::Cancelled)
    }

    async fn running(&mut self, stage: Stage, description: impl Into<String>) -> PipelineResult<()> {
        self.current = Some((stage, Instant::now()));
        self.send(PipelineOutput::Process(PipelineEvent::new(
            stage,
            StageStatus::Running,
            description,
        )))
        .await
    }

    async fn finish(&mut self, event: PipelineEvent) -> PipelineResult<()> {
        if let Some((stage, entered)) = self.current.take() {
            tracing::debug!(
                stage = ?stage,
                status = ?event.status,
                duration_ms = entered.elapsed().as_millis() as u64,
                "Stage finished"
            );
        }
        if event.stage != Stage::Generation {
            self.summary.push(event.clone());
        }
        self.send(PipelineOutput::Process(event)).await
    }
}

// ============================================================================
// Event content formatting
// ============================================================================

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|q| format!("- {}", q))
        .collect::<Vec<_>>()
        .join("\n")
}

fn candidate_list(candidates: &[CandidatePassage]) -> String {
    if candidates.is_empty() {
        return "No results".to_string();
    }
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("**[{}]** {}", i + 1, preview(&c.text)))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn scored_list(passages: &[ScoredPassage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| match p.relevance_score {
            Some(score) => format!("**[{}] score {:.3}**\n\n{}", i + 1, score, preview(&p.passage.text)),
            None => format!("**[{}] unscored**\n\n{}", i + 1, preview(&p.passage.text)),
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn merged_list(passages: &[MergedPassage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let source = p.source_file_name.as_deref().unwrap_or(&p.source_document_id);
            let range = match p.chunk_range {
                Some((first, last)) if first != last => format!(" chunks {}-{}", first, last),
                Some((first, _)) => format!(" chunk {}", first),
                None => String::new(),
            };
            let score = p
                .relevance_score
                .map(|s| format!(", score {:.3}", s))
                .unwrap_or_default();
            format!("**[{}] {}{}{}**\n\n{}", i + 1, source, range, score, p.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
