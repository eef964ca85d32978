use std::sync::Arc;

use crate::tokens::TokenCounter;
use crate::types::MergedPassage;

/// What answer generation is grounded on, and the smaller slice shown in progress events.
#[derive(Debug, Clone, Default)]
pub struct BudgetedContext {
    pub context_set: Vec<MergedPassage>,
    pub preview_set: Vec<MergedPassage>,
    pub preview_tokens: usize,
}

pub struct ContextBudgeter {
    counter: Arc<dyn TokenCounter>,
}

impl ContextBudgeter {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    /// `merged` must already be score-sorted.
    ///
    /// The preview always carries the first passage; later passages are added
    /// while the running total stays within `preview_token_budget`, stopping at
    /// the first that would overflow it.
    pub fn budget(
        &self,
        merged: Vec<MergedPassage>,
        final_top_n: usize,
        preview_token_budget: usize,
    ) -> BudgetedContext {
        let mut context_set = merged;
        context_set.truncate(final_top_n);

        let mut preview_set = Vec::new();
        let mut preview_tokens = 0usize;
        for passage in &context_set {
            let tokens = self.counter.count(&passage.text);
            if preview_set.is_empty() {
                preview_tokens = tokens;
                preview_set.push(passage.clone());
                if tokens >= preview_token_budget {
                    break;
                }
                continue;
            }
            if preview_tokens + tokens > preview_token_budget {
                break;
            }
            preview_tokens += tokens;
            preview_set.push(passage.clone());
        }

        BudgetedContext {
            context_set,
            preview_set,
            preview_tokens,
        }
    }
}

/// Context block handed to the answer model, one numbered section per passage.
pub fn assemble_context(passages: &[MergedPassage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| match &p.source_file_name {
            Some(name) => format!("[{}] 《{}》\n{}", i + 1, name, p.text),
            None => format!("[{}]\n{}", i + 1, p.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
