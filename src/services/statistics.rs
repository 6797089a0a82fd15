use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::dao::models::{QuizExercise, QuizResult};

/// Error raised by the statistics collaborator.
#[derive(Debug, Error)]
pub enum StatisticsError {
    /// The aggregation backend failed; affected results must be retried.
    #[error("statistics update failed: {0}")]
    Unavailable(String),
}

/// Statistics aggregation collaborator.
///
/// Called once per reconciliation tick with the batch of freshly computed
/// results; the aggregation itself (per-question distributions, averages)
/// belongs to the statistics module, not to this crate.
pub trait StatisticsSink: Send + Sync {
    /// Fold a batch of results into the exercise statistics.
    fn update_statistics(
        &self,
        results: Vec<QuizResult>,
        exercise: QuizExercise,
    ) -> BoxFuture<'static, Result<(), StatisticsError>>;
}

/// Sink that only traces the updates it receives.
///
/// Stand-in wiring for deployments where the statistics module is not
/// attached to this process.
#[derive(Default)]
pub struct TracingStatisticsSink;

impl StatisticsSink for TracingStatisticsSink {
    fn update_statistics(
        &self,
        results: Vec<QuizResult>,
        exercise: QuizExercise,
    ) -> BoxFuture<'static, Result<(), StatisticsError>> {
        debug!(
            exercise_id = exercise.id,
            results = results.len(),
            "statistics update received"
        );
        Box::pin(async move { Ok(()) })
    }
}
