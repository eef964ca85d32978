use serde::{Deserialize, Serialize};

/// Retrieval method a sub-query is dispatched through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryChannel {
    Semantic,
    Lexical,
}

/// One sub-query bound to the channel it will be run against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub channel: QueryChannel,
}

impl Query {
    pub fn semantic(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel: QueryChannel::Semantic,
        }
    }

    pub fn lexical(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel: QueryChannel::Lexical,
        }
    }
}

/// Which channel actually produced a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalChannel {
    Vector,
    Keyword,
}

impl From<QueryChannel> for RetrievalChannel {
    fn from(channel: QueryChannel) -> Self {
        match channel {
            QueryChannel::Semantic => RetrievalChannel::Vector,
            QueryChannel::Lexical => RetrievalChannel::Keyword,
        }
    }
}

/// Raw record returned by a knowledge base search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassageHit {
    pub id: String,
    pub document_id: String,
    pub chunk_index: Option<u32>,
    pub text: String,
    pub file_name: Option<String>,
}

/// A retrieved passage before relevance scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidatePassage {
    /// Stable identity, unique per knowledge base. Dedup key.
    pub id: String,
    pub source_document_id: String,
    pub chunk_index: Option<u32>,
    pub text: String,
    pub source_file_name: Option<String>,
    pub retrieval_channel: RetrievalChannel,
}

impl CandidatePassage {
    pub fn from_hit(hit: PassageHit, channel: RetrievalChannel) -> Self {
        Self {
            id: hit.id,
            source_document_id: hit.document_id,
            chunk_index: hit.chunk_index,
            text: hit.text,
            source_file_name: hit.file_name,
            retrieval_channel: channel,
        }
    }
}

/// A candidate with the score assigned by the relevance model.
///
/// `relevance_score` is `None` when scoring degraded and the passage was
/// passed through unscored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredPassage {
    pub passage: CandidatePassage,
    pub relevance_score: Option<f32>,
}

impl ScoredPassage {
    pub fn scored(passage: CandidatePassage, score: f32) -> Self {
        Self {
            passage,
            relevance_score: Some(score),
        }
    }

    pub fn unscored(passage: CandidatePassage) -> Self {
        Self {
            passage,
            relevance_score: None,
        }
    }

    /// Score used for ordering; unscored passages sort last.
    pub fn sort_score(&self) -> f32 {
        self.relevance_score.unwrap_or(0.0)
    }
}

/// One or more physically adjacent chunks of a document stitched together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedPassage {
    pub text: String,
    pub source_document_id: String,
    pub source_file_name: Option<String>,
    /// Inclusive `[first, last]` chunk indices; `None` for passages that
    /// carried no chunk index and were emitted as singletons.
    pub chunk_range: Option<(u32, u32)>,
    pub relevance_score: Option<f32>,
    /// Ids of the constituent passages in reading order.
    pub passage_ids: Vec<String>,
}

impl MergedPassage {
    pub fn singleton(scored: ScoredPassage) -> Self {
        let ScoredPassage {
            passage,
            relevance_score,
        } = scored;
        Self {
            chunk_range: passage.chunk_index.map(|i| (i, i)),
            text: passage.text,
            source_document_id: passage.source_document_id,
            source_file_name: passage.source_file_name,
            relevance_score,
            passage_ids: vec![passage.id],
        }
    }

    pub fn chunk_count(&self) -> usize {
        match self.chunk_range {
            Some((first, last)) => (last - first) as usize + 1,
            None => 1,
        }
    }

    pub fn sort_score(&self) -> f32 {
        self.relevance_score.unwrap_or(0.0)
    }
}

/// How the adaptive cutoff was reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    /// Two-means split over the scores.
    Clustered,
    /// Fewer than two scores; nothing to split.
    TooFewScores,
    /// The top score reaches the high-confidence constant; nothing is filtered.
    HighConfidence,
    /// All scores equal; no natural boundary.
    Uniform,
    /// Passages carry no scores (rerank degraded).
    Unscored,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdResult {
    pub cutoff: f32,
    /// Fraction of passages assigned to the high cluster. Informational.
    pub high_cluster_ratio: f32,
    /// `[low, high]` cluster centers.
    pub cluster_centers: [f32; 2],
    pub method: ThresholdMethod,
    pub kept: usize,
    pub dropped: usize,
}

/// Conversation roles accepted in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Keep only the most recent `max_turns` user/assistant pairs.
pub fn recent_history(history: &[ConversationMessage], max_turns: usize) -> &[ConversationMessage] {
    let keep = max_turns.saturating_mul(2);
    if history.len() > keep {
        &history[history.len() - keep..]
    } else {
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, chunk: Option<u32>) -> CandidatePassage {
        CandidatePassage {
            id: id.to_string(),
            source_document_id: "doc".to_string(),
            chunk_index: chunk,
            text: "text".to_string(),
            source_file_name: None,
            retrieval_channel: RetrievalChannel::Vector,
        }
    }

    #[test]
    fn test_singleton_range() {
        let merged = MergedPassage::singleton(ScoredPassage::scored(candidate("a", Some(4)), 0.5));
        assert_eq!(merged.chunk_range, Some((4, 4)));
        assert_eq!(merged.chunk_count(), 1);

        let bare = MergedPassage::singleton(ScoredPassage::unscored(candidate("b", None)));
        assert_eq!(bare.chunk_range, None);
        assert_eq!(bare.chunk_count(), 1);
        assert_eq!(bare.sort_score(), 0.0);
    }

    #[test]
    fn test_recent_history_keeps_last_turns() {
        let history: Vec<ConversationMessage> = (0..14)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationMessage::user(format!("q{}", i))
                } else {
                    ConversationMessage::assistant(format!("a{}", i))
                }
            })
            .collect();
        let recent = recent_history(&history, 5);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "q4");
        assert_eq!(recent_history(&history[..3], 5).len(), 3);
    }
}
