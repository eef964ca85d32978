pub mod adaptive;
pub mod client;
pub mod reranker;

pub use adaptive::AdaptiveThreshold;
pub use client::{HttpRerankClient, RelevanceResult, RelevanceScorer};
pub use reranker::{RerankOutcome, Reranker};
