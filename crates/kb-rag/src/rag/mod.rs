//! Request-scoped RAG stages: query expansion, chunk stitching, context budgeting

pub mod chunk_merger;
pub mod context_budget;
pub mod query_expander;

pub use chunk_merger::{find_overlap, ChunkMerger};
pub use context_budget::{assemble_context, BudgetedContext, ContextBudgeter};
pub use query_expander::{ExpandedQueries, QueryExpander};
