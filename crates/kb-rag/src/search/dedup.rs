use std::collections::HashSet;

use crate::types::CandidatePassage;

/// Per-query result lists, split by the channel that produced them.
#[derive(Debug, Clone, Default)]
pub struct ResultsByChannel {
    pub vector: Vec<Vec<CandidatePassage>>,
    pub keyword: Vec<Vec<CandidatePassage>>,
}

impl ResultsByChannel {
    pub fn total_hits(&self) -> usize {
        self.vector.iter().chain(self.keyword.iter()).map(Vec::len).sum()
    }
}

/// Collapse all lists into one candidate set, one entry per passage id.
///
/// Vector lists are walked before keyword lists so a passage found by both
/// channels keeps its vector provenance. Within a channel the first sighting wins.
pub fn dedupe(results: ResultsByChannel) -> Vec<CandidatePassage> {
    let ResultsByChannel { vector, keyword } = results;
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for passage in vector.into_iter().chain(keyword).flatten() {
        if seen.insert(passage.id.clone()) {
            out.push(passage);
        }
    }
    out
}
