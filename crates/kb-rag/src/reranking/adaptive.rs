//! Per-request relevance cutoff from a two-means split of rerank scores.
//!
//! Score distributions after reranking tend to be bimodal: a tight group of
//! passages that answer the question and a spread of loosely related ones.
//! Clustering the scores finds that boundary for each request, and a buffer
//! pulls the cutoff part of the way toward the low cluster so borderline
//! passages near the high group survive.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ThresholdConfig;
use crate::types::{ScoredPassage, ThresholdMethod, ThresholdResult};

const UNIFORM_EPSILON: f32 = 1e-6;
const RELATIVE_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct AdaptiveThreshold {
    high_confidence: f32,
    buffer_ratio: f32,
    seed: u64,
    n_init: usize,
    max_iterations: usize,
}

impl AdaptiveThreshold {
    pub fn new(config: &ThresholdConfig) -> Self {
        Self {
            high_confidence: config.high_confidence,
            buffer_ratio: config.buffer_ratio,
            seed: config.seed,
            n_init: config.n_init.max(1),
            max_iterations: config.max_iterations.max(1),
        }
    }

    /// Keep passages scoring at or above the adaptive cutoff. Input order is preserved.
    pub fn filter(&self, passages: Vec<ScoredPassage>) -> (Vec<ScoredPassage>, ThresholdResult) {
        let scores: Vec<f32> = passages.iter().filter_map(|p| p.relevance_score).collect();
        let total = passages.len();

        let pass_all = |method: ThresholdMethod, cutoff: f32, centers: [f32; 2]| ThresholdResult {
            cutoff,
            high_cluster_ratio: 1.0,
            cluster_centers: centers,
            method,
            kept: total,
            dropped: 0,
        };

        if scores.len() < total {
            return (passages, pass_all(ThresholdMethod::Unscored, 0.0, [0.0, 0.0]));
        }

        let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        if scores.len() < 2 {
            let s = scores.first().copied().unwrap_or(0.0);
            return (passages, pass_all(ThresholdMethod::TooFewScores, s, [s, s]));
        }
        if max >= self.high_confidence {
            return (passages, pass_all(ThresholdMethod::HighConfidence, min, [min, max]));
        }
        if max - min < UNIFORM_EPSILON {
            return (passages, pass_all(ThresholdMethod::Uniform, min, [min, max]));
        }

        let split = best_split(&scores, self.seed, self.n_init, self.max_iterations);
        let (low_label, high_label) = if split.centers[0] <= split.centers[1] { (0, 1) } else { (1, 0) };
        let low_center = split.centers[low_label] as f32;
        let high_center = split.centers[high_label] as f32;

        let high_scores = scores
            .iter()
            .zip(&split.labels)
            .filter(|(_, label)| **label == high_label)
            .map(|(&s, _)| s);
        let high_count = high_scores.clone().count();
        let min_high = high_scores.fold(f32::INFINITY, f32::min);
        if high_count == 0 || high_count == total {
            return (passages, pass_all(ThresholdMethod::Uniform, min, [min, max]));
        }

        let cutoff = (min_high - (min_high - low_center) * self.buffer_ratio).max(low_center);

        let kept: Vec<ScoredPassage> = passages
            .into_iter()
            .filter(|p| p.relevance_score.map_or(false, |s| s >= cutoff))
            .collect();

        let result = ThresholdResult {
            cutoff,
            high_cluster_ratio: high_count as f32 / total as f32,
            cluster_centers: [low_center, high_center],
            method: ThresholdMethod::Clustered,
            kept: kept.len(),
            dropped: total - kept.len(),
        };
        tracing::info!(
            cutoff = result.cutoff,
            low_center,
            high_center,
            high_ratio = result.high_cluster_ratio,
            kept = result.kept,
            dropped = result.dropped,
            "Adaptive threshold applied"
        );
        (kept, result)
    }
}

struct Split {
    centers: [f64; 2],
    labels: Vec<usize>,
    inertia: f64,
}

/// Best of `n_init` seeded k-means++ runs with k = 2.
fn best_split(scores: &[f32], seed: u64, n_init: usize, max_iterations: usize) -> Split {
    let points: Vec<f64> = scores.iter().map(|&s| s as f64).collect();
    let mean = points.iter().sum::<f64>() / points.len() as f64;
    let variance = points.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / points.len() as f64;
    let tolerance = variance * RELATIVE_TOLERANCE;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best = lloyd(&points, plus_plus_init(&points, &mut rng), max_iterations, tolerance);
    for _ in 1..n_init {
        let split = lloyd(&points, plus_plus_init(&points, &mut rng), max_iterations, tolerance);
        if split.inertia < best.inertia {
            best = split;
        }
    }
    best
}

fn plus_plus_init(points: &[f64], rng: &mut StdRng) -> [f64; 2] {
    let first = points[rng.gen_range(0..points.len())];
    let weights: Vec<f64> = points.iter().map(|p| (p - first).powi(2)).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return [first, first];
    }

    let mut target = rng.gen::<f64>() * total;
    for (point, weight) in points.iter().zip(&weights) {
        if target < *weight {
            return [first, *point];
        }
        target -= weight;
    }
    // Rounding left `target` just past the last bucket.
    let farthest = points
        .iter()
        .zip(&weights)
        .fold((first, 0.0), |acc, (p, w)| if *w > acc.1 { (*p, *w) } else { acc })
        .0;
    [first, farthest]
}

fn lloyd(points: &[f64], mut centers: [f64; 2], max_iterations: usize, tolerance: f64) -> Split {
    let mut labels = vec![0usize; points.len()];
    for _ in 0..max_iterations {
        for (label, p) in labels.iter_mut().zip(points) {
            *label = if (p - centers[1]).abs() < (p - centers[0]).abs() { 1 } else { 0 };
        }

        let mut sums = [0.0f64; 2];
        let mut counts = [0usize; 2];
        for (&label, p) in labels.iter().zip(points) {
            sums[label] += p;
            counts[label] += 1;
        }
        let mut shift = 0.0;
        for k in 0..2 {
            if counts[k] > 0 {
                let updated = sums[k] / counts[k] as f64;
                shift += (updated - centers[k]).powi(2);
                centers[k] = updated;
            }
        }
        if shift <= tolerance {
            break;
        }
    }

    for (label, p) in labels.iter_mut().zip(points) {
        *label = if (p - centers[1]).abs() < (p - centers[0]).abs() { 1 } else { 0 };
    }
    let inertia = labels
        .iter()
        .zip(points)
        .map(|(&label, p)| (p - centers[label]).powi(2))
        .sum();

    Split {
        centers,
        labels,
        inertia,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidatePassage, RetrievalChannel};
    use proptest::prelude::*;

    fn scored(id: usize, score: f32) -> ScoredPassage {
        ScoredPassage::scored(
            CandidatePassage {
                id: format!("p{}", id),
                source_document_id: "doc".into(),
                chunk_index: Some(id as u32),
                text: String::new(),
                source_file_name: None,
                retrieval_channel: RetrievalChannel::Vector,
            },
            score,
        )
    }

    fn from_scores(scores: &[f32]) -> Vec<ScoredPassage> {
        scores.iter().enumerate().map(|(i, &s)| scored(i, s)).collect()
    }

    fn threshold() -> AdaptiveThreshold {
        AdaptiveThreshold::new(&ThresholdConfig::default())
    }

    #[test]
    fn test_bimodal_split() {
        let (kept, result) = threshold().filter(from_scores(&[0.75, 0.4, 0.7, 0.38, 0.68, 0.36]));
        assert_eq!(result.method, ThresholdMethod::Clustered);
        let ids: Vec<&str> = kept.iter().map(|p| p.passage.id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p2", "p4"]);
        assert!((result.cluster_centers[0] - 0.38).abs() < 1e-4);
        assert!((result.cutoff - 0.59).abs() < 1e-4);
        assert!((result.high_cluster_ratio - 0.5).abs() < 1e-6);
        assert_eq!(result.dropped, 3);
    }

    #[test]
    fn test_buffer_admits_borderline() {
        let mut config = ThresholdConfig::default();
        config.buffer_ratio = 0.0;
        let strict = AdaptiveThreshold::new(&config);
        let (kept, result) = strict.filter(from_scores(&[0.75, 0.7, 0.5, 0.45]));
        assert_eq!(kept.len(), 2);
        assert!((result.cutoff - 0.7).abs() < 1e-6);

        config.buffer_ratio = 1.0;
        let (kept, result) = AdaptiveThreshold::new(&config).filter(from_scores(&[0.75, 0.7, 0.5, 0.45]));
        assert!((result.cutoff - 0.475).abs() < 1e-4);
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_short_circuits() {
        let (kept, result) = threshold().filter(from_scores(&[0.5]));
        assert_eq!((kept.len(), result.method), (1, ThresholdMethod::TooFewScores));

        let (kept, result) = threshold().filter(from_scores(&[0.95, 0.81, 0.99]));
        assert_eq!((kept.len(), result.method), (3, ThresholdMethod::HighConfidence));

        let (kept, result) = threshold().filter(from_scores(&[0.6, 0.6, 0.6]));
        assert_eq!((kept.len(), result.method), (3, ThresholdMethod::Uniform));

        let unscored = vec![ScoredPassage::unscored(scored(0, 0.0).passage)];
        let (kept, result) = threshold().filter(unscored);
        assert_eq!((kept.len(), result.method), (1, ThresholdMethod::Unscored));
    }

    #[test]
    fn test_one_confident_score_keeps_everything() {
        let (kept, result) = threshold().filter(from_scores(&[0.95, 0.3, 0.28]));
        assert_eq!(result.method, ThresholdMethod::HighConfidence);
        assert_eq!((kept.len(), result.dropped), (3, 0));
        assert!((result.cutoff - 0.28).abs() < 1e-6);
        assert_eq!(result.cluster_centers, [0.28, 0.95]);

        // The boundary itself counts as confident.
        let (kept, result) = threshold().filter(from_scores(&[0.8, 0.1]));
        assert_eq!((kept.len(), result.method), (2, ThresholdMethod::HighConfidence));
    }

    #[test]
    fn test_deterministic() {
        let scores = [0.71, 0.54, 0.46, 0.32, 0.29, 0.21, 0.68, 0.17];
        let (_, a) = threshold().filter(from_scores(&scores));
        let (_, b) = threshold().filter(from_scores(&scores));
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn prop_fewer_than_two_pass_through(scores in prop::collection::vec(0.0f32..=1.0, 0..2)) {
            let (kept, result) = threshold().filter(from_scores(&scores));
            prop_assert_eq!(kept.len(), scores.len());
            prop_assert_eq!(result.dropped, 0);
        }

        #[test]
        fn prop_any_confident_score_passes_all(
            mut scores in prop::collection::vec(0.0f32..=1.0, 1..12),
            confident in 0.8f32..=1.0,
            at in any::<prop::sample::Index>(),
        ) {
            let position = at.index(scores.len() + 1);
            scores.insert(position, confident);
            let (kept, result) = threshold().filter(from_scores(&scores));
            prop_assert_eq!(kept.len(), scores.len());
            prop_assert_eq!(result.dropped, 0);
            prop_assert_eq!(result.method, ThresholdMethod::HighConfidence);
        }

        #[test]
        fn prop_cutoff_bounds(scores in prop::collection::vec(0.0f32..=1.0, 2..16)) {
            let (kept, result) = threshold().filter(from_scores(&scores));
            prop_assert!(result.cutoff >= result.cluster_centers[0] - 1e-6);
            prop_assert!(!kept.is_empty());
            prop_assert_eq!(result.kept + result.dropped, scores.len());
            for p in &kept {
                prop_assert!(p.relevance_score.unwrap_or(0.0) >= result.cutoff);
            }
        }
    }
}
