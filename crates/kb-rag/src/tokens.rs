//! Token counting for preview budgeting and usage reports

use std::sync::Arc;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// BPE count with the `cl100k_base` vocabulary.
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    pub fn cl100k() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Roughly four characters per token.
pub struct CharEstimateCounter;

impl TokenCounter for CharEstimateCounter {
    fn count(&self, text: &str) -> usize {
        (text.chars().count() + 3) / 4
    }
}

/// `cl100k_base` when the vocabulary loads, otherwise the character estimate.
pub fn default_counter() -> Arc<dyn TokenCounter> {
    match TiktokenCounter::cl100k() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            tracing::warn!(error = %e, "cl100k_base unavailable, estimating tokens from length");
            Arc::new(CharEstimateCounter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_estimate() {
        assert_eq!(CharEstimateCounter.count(""), 0);
        assert_eq!(CharEstimateCounter.count("abcd"), 1);
        assert_eq!(CharEstimateCounter.count("abcde"), 2);
        assert_eq!(CharEstimateCounter.count("监督学习"), 1);
    }

    #[test]
    fn test_tiktoken_counts_words() {
        let counter = TiktokenCounter::cl100k().unwrap();
        assert_eq!(counter.count("hello world"), 2);
    }
}
