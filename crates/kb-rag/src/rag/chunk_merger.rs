//! Stitches physically adjacent chunks of one document back into a single span.
//!
//! Ingestion splits documents with overlapping windows, so chunk `n` usually
//! ends with a few dozen characters that chunk `n + 1` starts with. Merging
//! removes that duplicated boundary text.

use std::collections::HashMap;

use crate::config::MergeConfig;
use crate::types::{MergedPassage, ScoredPassage};

#[derive(Debug, Clone)]
pub struct ChunkMerger {
    max_overlap_chars: usize,
    min_seed_chars: usize,
}

impl ChunkMerger {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            max_overlap_chars: config.max_overlap_chars,
            min_seed_chars: config.min_seed_chars.max(1),
        }
    }

    /// Merge runs of consecutive chunks per document.
    ///
    /// Output is ordered by score, highest first; equal scores (including
    /// unscored input) keep the order in which their first chunk arrived.
    pub fn merge(&self, passages: Vec<ScoredPassage>) -> Vec<MergedPassage> {
        let mut units: Vec<(usize, MergedPassage)> = Vec::new();
        let mut groups: Vec<Vec<(usize, ScoredPassage)>> = Vec::new();
        let mut group_of: HashMap<String, usize> = HashMap::new();

        for (pos, scored) in passages.into_iter().enumerate() {
            if scored.passage.chunk_index.is_none() {
                units.push((pos, MergedPassage::singleton(scored)));
                continue;
            }
            let slot = *group_of
                .entry(scored.passage.source_document_id.clone())
                .or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
            groups[slot].push((pos, scored));
        }

        for mut group in groups {
            group.sort_by_key(|(_, s)| s.passage.chunk_index);

            let mut current: Option<(usize, MergedPassage)> = None;
            for (pos, scored) in group {
                let index = scored.passage.chunk_index;
                let extends = match (&current, index) {
                    (Some((_, run)), Some(i)) => run
                        .chunk_range
                        .map_or(false, |(_, last)| last.checked_add(1) == Some(i)),
                    _ => false,
                };

                if extends {
                    if let Some((first_pos, run)) = current.as_mut() {
                        self.append(run, scored);
                        *first_pos = (*first_pos).min(pos);
                    }
                } else {
                    if let Some(done) = current.take() {
                        units.push(done);
                    }
                    current = Some((pos, MergedPassage::singleton(scored)));
                }
            }
            if let Some(done) = current {
                units.push(done);
            }
        }

        units.sort_by_key(|(pos, _)| *pos);
        units.sort_by(|(_, a), (_, b)| {
            b.sort_score()
                .partial_cmp(&a.sort_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let merged: Vec<MergedPassage> = units.into_iter().map(|(_, m)| m).collect();
        tracing::debug!(
            spans = merged.len(),
            multi_chunk = merged.iter().filter(|m| m.chunk_count() > 1).count(),
            "Chunk merge complete"
        );
        merged
    }

    fn append(&self, run: &mut MergedPassage, next: ScoredPassage) {
        let ScoredPassage {
            passage,
            relevance_score,
        } = next;

        run.text = self.stitch(&run.text, &passage.text);
        if let (Some((first, _)), Some(index)) = (run.chunk_range, passage.chunk_index) {
            run.chunk_range = Some((first, index));
        }
        run.relevance_score = match (run.relevance_score, relevance_score) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if run.source_file_name.is_none() {
            run.source_file_name = passage.source_file_name;
        }
        run.passage_ids.push(passage.id);
    }

    /// `a` followed by `b` with their shared boundary text written once.
    pub fn stitch(&self, a: &str, b: &str) -> String {
        let overlap = find_overlap(a, b, self.max_overlap_chars, self.min_seed_chars);
        let mut out = String::with_capacity(a.len() + b.len() - overlap);
        out.push_str(a);
        out.push_str(&b[overlap..]);
        out
    }
}

/// Byte length of the longest suffix of `a` that is also a prefix of `b`,
/// looking at most `max_overlap` chars back into `a` and trusting only
/// overlaps of at least `min_seed` chars. Zero when none qualifies.
pub fn find_overlap(a: &str, b: &str, max_overlap: usize, min_seed: usize) -> usize {
    if min_seed == 0 || max_overlap < min_seed {
        return 0;
    }
    let Some(seed_end) = char_boundary_after(b, min_seed) else {
        return 0;
    };
    let seed = &b[..seed_end];

    let window_start = a
        .char_indices()
        .rev()
        .nth(max_overlap - 1)
        .map_or(0, |(i, _)| i);
    let window = &a[window_start..];

    // Earliest seed hit yields the longest overlap; the seed alone can match
    // spuriously, so each hit is confirmed against the full suffix.
    let mut from = 0;
    while let Some(rel) = window[from..].find(seed) {
        let at = from + rel;
        let suffix = &window[at..];
        if b.starts_with(suffix) {
            return suffix.len();
        }
        from = at + window[at..].chars().next().map_or(1, char::len_utf8);
    }
    0
}

/// Byte offset just past the first `n` chars, or `None` if `s` is shorter.
fn char_boundary_after(s: &str, n: usize) -> Option<usize> {
    let mut count = 0;
    for (i, c) in s.char_indices() {
        count += 1;
        if count == n {
            return Some(i + c.len_utf8());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidatePassage, RetrievalChannel};
    use proptest::prelude::*;

    fn chunk(id: &str, doc: &str, index: Option<u32>, text: &str, score: Option<f32>) -> ScoredPassage {
        ScoredPassage {
            passage: CandidatePassage {
                id: id.to_string(),
                source_document_id: doc.to_string(),
                chunk_index: index,
                text: text.to_string(),
                source_file_name: Some(format!("{}.pdf", doc)),
                retrieval_channel: RetrievalChannel::Vector,
            },
            relevance_score: score,
        }
    }

    fn merger() -> ChunkMerger {
        ChunkMerger::new(&MergeConfig::default())
    }

    #[test]
    fn test_overlap_removed() {
        assert_eq!(merger().stitch("hello wor", "world!"), "hello world!");
    }

    #[test]
    fn test_no_overlap_concatenates() {
        assert_eq!(merger().stitch("alpha ", "beta"), "alpha beta");
        // Two shared chars is below the three-char seed.
        assert_eq!(merger().stitch("abcxy", "xyz"), "abcxyxyz");
    }

    #[test]
    fn test_spurious_seed_rejected() {
        // "abc" occurs twice in the tail; only the second occurrence is a real suffix.
        assert_eq!(find_overlap("abcQQabc", "abcdef", 200, 3), 3);
        assert_eq!(find_overlap("abcQQ", "abcdef", 200, 3), 0);
    }

    #[test]
    fn test_overlapping_seed_occurrences() {
        assert_eq!(find_overlap("xaaaa", "aaab", 200, 2), 3);
    }

    #[test]
    fn test_window_limits_overlap() {
        let a = "0123456789";
        assert_eq!(find_overlap(a, "3456789XYZ", 200, 3), 7);
        assert_eq!(find_overlap(a, "3456789XYZ", 5, 3), 0);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let m = merger();
        assert_eq!(m.stitch("监督学习使用标注", "使用标注数据"), "监督学习使用标注数据");
        assert_eq!(find_overlap("é", "éa", 200, 3), 0);
    }

    #[test]
    fn test_merges_consecutive_and_keeps_max_score() {
        let merged = merger().merge(vec![
            chunk("b", "d1", Some(1), "learning uses labeled data.", Some(0.85)),
            chunk("a", "d1", Some(0), "Supervised learning uses", Some(0.9)),
            chunk("c", "d1", Some(3), "Unrelated later section.", Some(0.5)),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "Supervised learning uses labeled data.");
        assert_eq!(merged[0].chunk_range, Some((0, 1)));
        assert_eq!(merged[0].relevance_score, Some(0.9));
        assert_eq!(merged[0].passage_ids, vec!["a", "b"]);
        assert_eq!(merged[1].chunk_range, Some((3, 3)));
    }

    #[test]
    fn test_unindexed_and_cross_document_never_merge() {
        let merged = merger().merge(vec![
            chunk("a", "d1", Some(0), "one", Some(0.6)),
            chunk("b", "d2", Some(1), "two", Some(0.7)),
            chunk("c", "d1", None, "three", Some(0.8)),
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].passage_ids, vec!["c"]);
        assert_eq!(merged[0].chunk_range, None);
        assert_eq!(merged[1].passage_ids, vec!["b"]);
    }

    #[test]
    fn test_unscored_keeps_arrival_order() {
        let merged = merger().merge(vec![
            chunk("x", "d2", Some(5), "x", None),
            chunk("a", "d1", Some(0), "a", None),
            chunk("y", "d3", None, "y", None),
        ]);
        let ids: Vec<&str> = merged.iter().map(|m| m.passage_ids[0].as_str()).collect();
        assert_eq!(ids, vec!["x", "a", "y"]);
    }

    proptest! {
        #[test]
        fn prop_no_consecutive_is_noop(indices in prop::collection::btree_set(0u32..50, 0..12)) {
            // Keep only every index whose predecessor is absent.
            let spaced: Vec<u32> = indices.iter().copied()
                .filter(|i| *i == 0 || !indices.contains(&(i - 1)))
                .collect();
            let input: Vec<ScoredPassage> = spaced.iter()
                .map(|&i| chunk(&format!("p{}", i), "doc", Some(i), "text", Some(0.5)))
                .collect();
            let merged = merger().merge(input);
            prop_assert_eq!(merged.len(), spaced.len());
            for m in &merged {
                prop_assert_eq!(m.chunk_count(), 1);
            }
        }

        #[test]
        fn prop_ranges_contiguous(indices in prop::collection::vec(0u32..20, 0..20)) {
            let input: Vec<ScoredPassage> = indices.iter().enumerate()
                .map(|(n, &i)| chunk(&format!("p{}", n), "doc", Some(i), "abc", Some(0.5)))
                .collect();
            let merged = merger().merge(input);
            let total: usize = merged.iter().map(|m| m.passage_ids.len()).sum();
            prop_assert_eq!(total, indices.len());
            for m in &merged {
                prop_assert_eq!(m.chunk_count(), m.passage_ids.len());
            }
        }
    }
}
