//! Sampler error types.

use thiserror::Error;

/// Errors that can occur while evaluating records.
#[derive(Debug, Error)]
pub enum SampleError {
    /// Sentinel: stop the pipeline for this record.
    #[error("record skipped by sampler")]
    Skip,

    /// Evaluation panicked and was isolated.
    #[error("evaluator '{0}' panicked while processing a record")]
    Panicked(&'static str),
}

impl SampleError {
    /// Whether this is the skip sentinel.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// Result type for sampler operations.
pub type SampleResult<T> = Result<T, SampleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_sentinel() {
        assert!(SampleError::Skip.is_skip());
        assert!(!SampleError::Panicked("always").is_skip());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            SampleError::Skip.to_string(),
            "record skipped by sampler"
        );
    }
}
