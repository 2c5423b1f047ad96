//! The evaluator contract and its stateless variants.

use super::config::{EvaluatorType, SamplerConfig};
use super::error::{SampleError, SampleResult};
use super::random::RandomEvaluator;
use super::status_code::StatusCodeEvaluator;
use crate::record::Record;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// A per-record sampling decision stage.
///
/// Implementations must be safe to call concurrently from many worker
/// threads. Returning [`SampleError::Skip`] halts the pipeline for the
/// record; any other error is surfaced to the caller.
pub trait Evaluator: Send + Sync {
    /// Evaluate one record, possibly mutating its payload in place.
    fn evaluate(&self, record: &mut Record) -> SampleResult<()>;

    /// The evaluator variant name.
    fn kind(&self) -> &'static str;

    /// Release internal state and stop background work.
    fn stop(&self) {}
}

/// Passthrough evaluator: keeps every record untouched.
#[derive(Debug, Default)]
pub struct AlwaysEvaluator;

impl AlwaysEvaluator {
    /// Create a new passthrough evaluator.
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for AlwaysEvaluator {
    fn evaluate(&self, _record: &mut Record) -> SampleResult<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "always"
    }
}

/// Drop evaluator: skips every record while enabled.
#[derive(Debug)]
pub struct DropEvaluator {
    enabled: bool,
}

impl DropEvaluator {
    /// Create a new drop evaluator.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Evaluator for DropEvaluator {
    fn evaluate(&self, _record: &mut Record) -> SampleResult<()> {
        if self.enabled {
            return Err(SampleError::Skip);
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "drop"
    }
}

/// Create an evaluator from configuration.
pub fn new_evaluator(config: &SamplerConfig) -> Box<dyn Evaluator> {
    match config.evaluator {
        EvaluatorType::Always => Box::new(AlwaysEvaluator::new()),
        EvaluatorType::Drop => Box::new(DropEvaluator::new(config.enabled)),
        EvaluatorType::Random => Box::new(RandomEvaluator::new(config.sampling_percentage)),
        EvaluatorType::StatusCode => Box::new(StatusCodeEvaluator::new(config)),
    }
}

/// Evaluate a record, isolating panics so one bad batch cannot take down
/// the dispatch path.
pub fn evaluate_guarded(evaluator: &dyn Evaluator, record: &mut Record) -> SampleResult<()> {
    match catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(record))) {
        Ok(result) => result,
        Err(_) => {
            error!(
                evaluator = evaluator.kind(),
                record_type = %record.record_type,
                "evaluator panicked, record dropped"
            );
            Err(SampleError::Panicked(evaluator.kind()))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordType, Token, TraceBatch};

    fn empty_record() -> Record {
        Record {
            record_type: RecordType::Traces,
            token: Token::new("t", 1001),
            data: TraceBatch::new(),
        }
    }

    struct PanickingEvaluator;

    impl Evaluator for PanickingEvaluator {
        fn evaluate(&self, _record: &mut Record) -> SampleResult<()> {
            panic!("boom");
        }

        fn kind(&self) -> &'static str {
            "panicking"
        }
    }

    #[test]
    fn test_always_passthrough() {
        let evaluator = AlwaysEvaluator::new();
        let mut record = empty_record();
        assert!(evaluator.evaluate(&mut record).is_ok());
        assert_eq!(evaluator.kind(), "always");
    }

    #[test]
    fn test_drop_enabled_skips() {
        let evaluator = DropEvaluator::new(true);
        let mut record = empty_record();
        assert!(matches!(
            evaluator.evaluate(&mut record),
            Err(SampleError::Skip)
        ));
    }

    #[test]
    fn test_drop_disabled_passes() {
        let evaluator = DropEvaluator::new(false);
        let mut record = empty_record();
        assert!(evaluator.evaluate(&mut record).is_ok());
    }

    #[test]
    fn test_factory_kinds() {
        let mut config = SamplerConfig::default();
        assert_eq!(new_evaluator(&config).kind(), "always");

        config.evaluator = EvaluatorType::Drop;
        assert_eq!(new_evaluator(&config).kind(), "drop");

        config.evaluator = EvaluatorType::Random;
        assert_eq!(new_evaluator(&config).kind(), "random");

        config.evaluator = EvaluatorType::StatusCode;
        let evaluator = new_evaluator(&config);
        assert_eq!(evaluator.kind(), "status_code");
        evaluator.stop();
    }

    #[test]
    fn test_guarded_isolates_panic() {
        let mut record = empty_record();
        let result = evaluate_guarded(&PanickingEvaluator, &mut record);
        assert!(matches!(result, Err(SampleError::Panicked("panicking"))));
    }
}
