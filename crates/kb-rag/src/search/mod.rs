pub mod dedup;
pub mod hybrid;

pub use dedup::{dedupe, ResultsByChannel};
pub use hybrid::{build_like_expression, extract_keywords, CallOutcome, CallReport, HybridRetriever, RetrievalBatch};
