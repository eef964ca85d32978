use std::time::Duration;

use thiserror::Error;

/// Failures that cross a pipeline stage boundary.
///
/// Endpoint adapters return `anyhow::Result`; the stage that calls them either
/// absorbs the error (retrieval, rerank, expansion) or converts it here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request cancelled")]
    Cancelled,

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("knowledge base unavailable: {0}")]
    KnowledgeBase(String),

    #[error("{endpoint} endpoint failed: {message}")]
    Endpoint { endpoint: &'static str, message: String },

    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn endpoint(endpoint: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Endpoint {
            endpoint,
            message: err.to_string(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Run `fut` under a deadline, mapping expiry to [`PipelineError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> PipelineResult<anyhow::Result<T>>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| PipelineError::Timeout { operation, after })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout("vector search", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, anyhow::Error>(1)
        })
        .await;
        match result {
            Err(PipelineError::Timeout { operation, .. }) => assert_eq!(operation, "vector search"),
            other => panic!("expected timeout, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn test_display() {
        let err = PipelineError::Timeout {
            operation: "rerank",
            after: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "rerank timed out after 2000ms");
    }
}
