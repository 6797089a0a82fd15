//! Facade consumed by the request-handling layer: cache reads and writes for
//! submissions, batch membership, results, and exercise snapshots.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::SharedMap;
use crate::dao::models::{QuizExercise, QuizResult, QuizSubmission, StudentParticipation};
use crate::dao::quiz_store::QuizStore;
use crate::error::ServiceError;
use crate::state::SharedContext;

/// Store or replace a participant's pending submission.
///
/// Entries live here only until the next reconciliation tick commits them.
pub async fn update_submission(
    ctx: &SharedContext,
    exercise_id: i64,
    login: &str,
    submission: QuizSubmission,
) {
    let cache = ctx.registry().transient_write(exercise_id).await;
    cache.submissions().insert(login.to_string(), submission);
}

/// Queue a result for the next statistics aggregation.
///
/// Invoked once per scored submission, typically by the drain itself.
pub async fn add_result_for_statistic_update(
    ctx: &SharedContext,
    exercise_id: i64,
    result: QuizResult,
) {
    debug!(exercise_id, result_id = %result.id, "queueing result for statistics update");
    let cache = ctx.registry().transient_write(exercise_id).await;
    cache.results().insert(result.id, result);
}

/// Record that a participant joined a batch of the exercise.
pub async fn join_batch(ctx: &SharedContext, exercise_id: i64, login: &str, batch_id: i64) {
    debug!(exercise_id, login, batch_id, "participant joined batch");
    let cache = ctx.registry().transient_write(exercise_id).await;
    cache.batch_assignments().insert(login.to_string(), batch_id);
}

/// Batch a participant joined, if any.
pub fn batch_for_login(ctx: &SharedContext, exercise_id: i64, login: &str) -> Option<i64> {
    ctx.registry().read_only(exercise_id).batch_of(login)
}

/// The participant's cached submission, or an empty submission when none is
/// cached.
///
/// Returning an empty value instead of an absence spares every caller a
/// branch on the cache lifecycle.
pub fn get_cached_submission(ctx: &SharedContext, exercise_id: i64, login: &str) -> QuizSubmission {
    ctx.registry()
        .read_only(exercise_id)
        .submission_of(login)
        .unwrap_or_default()
}

/// The participant's staged participation awaiting delivery, if any.
pub fn get_cached_participation(
    ctx: &SharedContext,
    exercise_id: i64,
    login: &str,
) -> Option<StudentParticipation> {
    ctx.registry().read_only(exercise_id).participation_of(login)
}

/// Whether every cached submission of the exercise has been committed.
pub fn finished_processing(ctx: &SharedContext, exercise_id: i64) -> bool {
    ctx.registry().read_only(exercise_id).submissions_drained()
}

/// The detailed exercise snapshot, from the node-local near cache when
/// possible.
///
/// On a miss the snapshot is fetched from storage and re-broadcast so every
/// node warms up at once.
pub async fn get_cached_exercise(
    ctx: &SharedContext,
    exercise_id: i64,
) -> Result<Option<Arc<QuizExercise>>, ServiceError> {
    if let Some(snapshot) = ctx.registry().cached_exercise(exercise_id) {
        return Ok(Some(snapshot));
    }
    let Some(exercise) = ctx.store().find_exercise_with_details(exercise_id).await? else {
        return Ok(None);
    };
    let exercise = Arc::new(exercise);
    update_cached_exercise(ctx, exercise.clone());
    Ok(Some(exercise))
}

/// Push an updated exercise snapshot to every node's near cache.
///
/// The snapshot should include questions and statistics so later reads do
/// not fall back to storage.
pub fn update_cached_exercise(ctx: &SharedContext, exercise: Arc<QuizExercise>) {
    ctx.registry().update_exercise(exercise);
}

/// Drop all cached data of one exercise.
///
/// Destructive: cached submissions, participations and results are lost.
/// Scheduled start tasks are not touched; cancel them first when needed.
pub fn clear_cache(ctx: &SharedContext, exercise_id: i64) {
    warn!(exercise_id, "clearing quiz session cache on request");
    ctx.registry().remove_and_clear(exercise_id);
}

/// Drop all cached data of every exercise.
///
/// Destructive last-resort operation, see [`clear_cache`].
pub fn clear_all_caches(ctx: &SharedContext) {
    ctx.registry().clear_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestNode};

    #[tokio::test]
    async fn unknown_exercise_reads_an_empty_submission() {
        let node = TestNode::new();

        let submission = get_cached_submission(&node.ctx, 999, "u1");
        assert!(!submission.submitted);
        assert!(submission.answers.is_empty());
        assert!(get_cached_participation(&node.ctx, 999, "u1").is_none());
        // Reads must not have created a cache.
        assert!(node.ctx.registry().all_caches().is_empty());
    }

    #[tokio::test]
    async fn submission_roundtrip_through_the_cache() {
        let node = TestNode::new();

        update_submission(&node.ctx, 7, "u1", testing::submission(true, &[1])).await;

        let cached = get_cached_submission(&node.ctx, 7, "u1");
        assert!(cached.submitted);
        assert!(!finished_processing(&node.ctx, 7));
        assert!(finished_processing(&node.ctx, 8));
    }

    #[tokio::test]
    async fn batch_membership_roundtrip() {
        let node = TestNode::new();
        join_batch(&node.ctx, 7, "u1", 3).await;
        assert_eq!(batch_for_login(&node.ctx, 7, "u1"), Some(3));
        assert_eq!(batch_for_login(&node.ctx, 7, "u2"), None);
    }

    #[tokio::test]
    async fn exercise_lookup_falls_back_to_storage() {
        let node = TestNode::new();
        let exercise = testing::synchronized_exercise(7, testing::past(600), 300);
        node.store.put_exercise(exercise.clone());

        let fetched = get_cached_exercise(&node.ctx, 7).await.unwrap().unwrap();
        assert_eq!(fetched.id, 7);
        assert_eq!(fetched.questions.len(), exercise.questions.len());

        assert!(get_cached_exercise(&node.ctx, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_cache_discards_pending_state() {
        let node = TestNode::new();
        update_submission(&node.ctx, 7, "u1", testing::submission(true, &[1])).await;

        clear_cache(&node.ctx, 7);

        assert!(node.ctx.registry().all_caches().is_empty());
        assert!(!get_cached_submission(&node.ctx, 7, "u1").submitted);
    }
}
