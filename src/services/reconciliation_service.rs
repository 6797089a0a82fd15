//! The periodic reconciliation tick.
//!
//! Once per tick, every live session cache is drained: finalized submissions
//! become persisted participations and results, finished participations are
//! delivered to their owners, and fresh results are folded into the exercise
//! statistics. The tick is safe to run concurrently on every node because
//! duplicate-key conflicts from storage are treated as proof that another
//! node already did the work.

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::SharedMap;
use crate::dao::models::{
    ParticipationState, QuizExercise, QuizMode, QuizResult, QuizSubmission, StudentParticipation,
    SubmissionKind,
};
use crate::dao::quiz_store::QuizStore;
use crate::error::ServiceError;
use crate::services::statistics::StatisticsSink;
use crate::services::{quiz_events, schedule_service, session_service};
use crate::state::SharedContext;
use crate::state::session::SessionCache;

/// Run one reconciliation pass over every live session cache.
///
/// A failure while reconciling one exercise is logged and never aborts the
/// processing of the remaining exercises.
pub async fn process_cached_submissions(ctx: &SharedContext) {
    debug!("processing cached quiz submissions");
    for cache in ctx.registry().all_caches() {
        let exercise_id = cache.exercise_id();
        if let Err(err) = process_exercise(ctx, &cache).await {
            error!(exercise_id, error = %err, "failed to reconcile quiz exercise");
        }
    }
}

async fn process_exercise(ctx: &SharedContext, cache: &SessionCache) -> Result<(), ServiceError> {
    let exercise_id = cache.exercise_id();
    let now = OffsetDateTime::now_utc();

    // Refetch from storage first: a lingering cache entry for a deleted
    // exercise is dropped without touching storage again.
    let Some(exercise) = ctx.store().find_exercise(exercise_id).await? else {
        debug!(exercise_id, "exercise no longer exists; removing its session cache");
        ctx.registry().remove_and_clear(exercise_id);
        return Ok(());
    };

    // Attempts whose batch ran out without an explicit submit still must be
    // committed, otherwise a participant could gain a fresh attempt.
    for (login, batch_id) in cache.batch_assignments().entries() {
        let batch_ended = exercise
            .batch(batch_id)
            .is_some_and(|batch| batch.has_ended(now, exercise.duration_secs));
        if batch_ended {
            cache
                .submissions()
                .insert_if_absent(login, QuizSubmission::default());
        }
    }

    let has_ended = exercise.has_ended(now);
    // These flags can be invalidated by concurrent writers at any moment;
    // they only gate work for this pass, never bulk operations like clear().
    let has_submissions = !cache.submissions().is_empty();
    let has_participations = !cache.participations().is_empty();
    let has_results = !cache.results().is_empty();

    if !has_submissions && !has_participations && !has_results {
        if has_ended {
            // The quiz is over and nothing is pending: the cache is spent.
            schedule_service::cancel_scheduled_start(ctx, exercise_id).await;
            ctx.registry().remove_and_clear(exercise_id);
        }
        return Ok(());
    }

    // The detailed snapshot is the most expensive query of the tick, so it is
    // fetched only once pending work is certain.
    let Some(detailed) = ctx.store().find_exercise_with_details(exercise_id).await? else {
        debug!(exercise_id, "exercise vanished mid-tick; removing its session cache");
        ctx.registry().remove_and_clear(exercise_id);
        return Ok(());
    };

    if has_submissions {
        let drained = drain_submissions(ctx, cache, &detailed, now).await;
        if drained > 0 {
            info!(
                exercise_id,
                drained,
                quiz = %detailed.title,
                "saved quiz submissions to storage"
            );
        }
    }

    if has_ended {
        flush_participations(ctx, cache).await;
    }

    flush_results(ctx, cache, &detailed).await;
    Ok(())
}

/// Commit every finalized cached submission, returning how many were saved.
///
/// A submission is final once the participant submitted it or its window
/// closed; anything else stays cached for a later tick. Failures are isolated
/// per participant.
async fn drain_submissions(
    ctx: &SharedContext,
    cache: &SessionCache,
    exercise: &QuizExercise,
    now: OffsetDateTime,
) -> usize {
    let exercise_id = exercise.id;
    let mut drained = 0;
    for (login, submission) in cache.submissions().entries() {
        match drain_one(ctx, cache, exercise, now, &login, submission).await {
            Ok(true) => drained += 1,
            Ok(false) => {}
            Err(err) => {
                // Leave the entry cached; the next tick retries it.
                error!(
                    exercise_id,
                    login,
                    error = %err,
                    "failed to commit cached submission"
                );
            }
        }
    }
    drained
}

async fn drain_one(
    ctx: &SharedContext,
    cache: &SessionCache,
    exercise: &QuizExercise,
    now: OffsetDateTime,
    login: &str,
    mut submission: QuizSubmission,
) -> Result<bool, ServiceError> {
    let exercise_id = exercise.id;
    let batch_id = cache.batch_assignments().get(&login.to_string());
    let batch = batch_id.and_then(|id| exercise.batch(id));
    let batch_ended =
        batch.is_some_and(|batch| batch.has_ended(now, exercise.duration_secs));

    if submission.submitted {
        if submission.kind.is_none() {
            submission.kind = Some(SubmissionKind::Manual);
        }
    } else if exercise.has_ended(now) || batch_ended {
        submission.submitted = true;
        submission.kind = Some(SubmissionKind::Timeout);
        submission.submission_date = Some(now);
    } else {
        // Still in progress, nothing to commit yet.
        return Ok(false);
    }

    if submission.submission_date.is_none() {
        submission.submission_date = Some(now);
    }
    if let Some(batch_id) = batch_id {
        submission.batch_id = Some(batch_id);
    }

    submission.score_against(exercise);
    let result = QuizResult::evaluate(submission.clone(), exercise.max_points());
    let participant = ctx.store().find_participant_by_login(login).await?;
    let participation = StudentParticipation {
        id: Uuid::new_v4(),
        exercise_id,
        exercise: Some(exercise.clone()),
        participant,
        state: ParticipationState::Finished,
        initialization_date: submission.submission_date,
        submission: Some(submission.clone()),
        result: Some(result.clone()),
    };

    // Participation and submission are saved in this order through two
    // separate calls so a duplicate-key failure on one cannot take the other
    // record down with it.
    if commit_was_duplicate(
        ctx.store().save_participation(participation.clone()).await,
        cache,
        exercise_id,
        login,
    )? {
        return Ok(false);
    }
    if commit_was_duplicate(
        ctx.store()
            .save_submission(participation.id, submission)
            .await,
        cache,
        exercise_id,
        login,
    )? {
        return Ok(false);
    }
    info!(exercise_id, login, "saved quiz submission");

    // Participations of non-synchronized quizzes may only become deliverable
    // days later; staging them would pin cache memory for nothing.
    if exercise.mode == QuizMode::Synchronized {
        cache
            .participations()
            .insert(login.to_string(), participation);
    }

    // The submission leaves the cache only after the participation is staged,
    // so a racing drain cannot commit the participant a second time.
    cache.submissions().remove(&login.to_string());
    cache.batch_assignments().remove(&login.to_string());
    session_service::add_result_for_statistic_update(ctx, exercise_id, result).await;
    Ok(true)
}

fn commit_was_duplicate(
    outcome: Result<(), crate::dao::storage::StorageError>,
    cache: &SessionCache,
    exercise_id: i64,
    login: &str,
) -> Result<bool, ServiceError> {
    match outcome {
        Ok(()) => Ok(false),
        Err(err) if err.is_duplicate_key() => {
            // Another tick or node already committed this participant; drop
            // the cache entries instead of retrying forever.
            warn!(
                exercise_id,
                login,
                error = %err,
                "submission already persisted elsewhere; dropping cache entries"
            );
            cache.submissions().remove(&login.to_string());
            cache.batch_assignments().remove(&login.to_string());
            Ok(true)
        }
        Err(err) => Err(err.into()),
    }
}

/// Deliver every staged participation to its owner and unstage it.
async fn flush_participations(ctx: &SharedContext, cache: &SessionCache) {
    let exercise_id = cache.exercise_id();
    let mut delivered = 0;
    for (key, participation) in cache.participations().entries() {
        let Some(login) = participation.participant_login().map(str::to_owned) else {
            // A staged participation without its participant cannot be
            // addressed; this is a programming defect, not a race.
            error!(
                exercise_id,
                staging_key = %key,
                "staged participation is missing its participant"
            );
            continue;
        };
        quiz_events::send_result_to_participant(
            ctx.gateway().as_ref(),
            exercise_id,
            &login,
            &participation,
        );
        cache.participations().remove(&key);
        delivered += 1;
    }
    if delivered > 0 {
        info!(exercise_id, delivered, "sent out finished participations");
    }
}

/// Fold the cached results into the exercise statistics.
///
/// On success only the results that were part of the call are removed, so
/// results added concurrently survive; on failure everything stays cached
/// and the next tick retries.
async fn flush_results(ctx: &SharedContext, cache: &SessionCache, exercise: &QuizExercise) {
    let exercise_id = cache.exercise_id();
    let batch = cache.results().entries();
    if batch.is_empty() {
        return;
    }
    let results: Vec<QuizResult> = batch.iter().map(|(_, result)| result.clone()).collect();
    let count = results.len();
    match ctx
        .statistics()
        .update_statistics(results, exercise.clone())
        .await
    {
        Ok(()) => {
            for (result_id, _) in batch {
                cache.results().remove(&result_id);
            }
            info!(exercise_id, count, "updated statistics with new results");
        }
        Err(err) => {
            error!(
                exercise_id,
                error = %err,
                "statistics update failed; keeping results for the next tick"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scheduler::TaskScheduler as _;
    use crate::services::session_service;
    use crate::testing::{self, TestNode};

    async fn submit(node: &TestNode, exercise_id: i64, login: &str, submitted: bool) {
        node.store.put_participant(testing::participant(login));
        session_service::join_batch(&node.ctx, exercise_id, login, 1).await;
        session_service::update_submission(
            &node.ctx,
            exercise_id,
            login,
            testing::submission(submitted, &[1]),
        )
        .await;
    }

    #[tokio::test]
    async fn manual_submission_is_committed_with_its_result() {
        let node = TestNode::new();
        // Batch started a minute ago and still has plenty of time left.
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node, 7, "u1", true).await;

        process_cached_submissions(&node.ctx).await;

        let participations = node.store.participations_for(7);
        assert_eq!(participations.len(), 1);
        let participation = &participations[0];
        assert_eq!(participation.participant_login(), Some("u1"));
        assert_eq!(participation.state, ParticipationState::Finished);

        let submission = participation.submission.as_ref().unwrap();
        assert_eq!(submission.kind, Some(SubmissionKind::Manual));
        assert_eq!(submission.batch_id, Some(1));
        assert!(node.store.submission_for(participation.id).is_some());

        let result = participation.result.as_ref().unwrap();
        assert_eq!(result.score_percent, 100.0);

        // Same-tick statistics update consumed the freshly staged result.
        let updates = node.statistics.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 7);
        assert_eq!(updates[0].1, vec![result.id]);

        // The quiz is still running: the participation stays staged for the
        // end-of-quiz delivery and nothing was sent yet.
        assert!(session_service::get_cached_participation(&node.ctx, 7, "u1").is_some());
        assert!(node.gateway.messages().is_empty());
        assert!(session_service::finished_processing(&node.ctx, 7));
    }

    #[tokio::test]
    async fn unsubmitted_attempt_times_out_when_the_batch_ends() {
        let node = TestNode::new();
        // Batch started 400s ago with 300s of working time: already over.
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(400), 300));
        submit(&node, 7, "u2", false).await;

        process_cached_submissions(&node.ctx).await;

        let participations = node.store.participations_for(7);
        assert_eq!(participations.len(), 1);
        let submission = participations[0].submission.as_ref().unwrap();
        assert_eq!(submission.kind, Some(SubmissionKind::Timeout));
        assert!(submission.submitted);
        assert!(submission.submission_date.is_some());

        // The quiz has ended, so the participation went straight out.
        let deliveries = node.gateway.messages_for("u2");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].topic, quiz_events::participation_topic(7));
        assert!(session_service::get_cached_participation(&node.ctx, 7, "u2").is_none());
    }

    #[tokio::test]
    async fn joined_but_never_touched_attempts_are_committed_too() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(400), 300));
        node.store.put_participant(testing::participant("u3"));
        // u3 joined the batch but never sent any answers.
        session_service::join_batch(&node.ctx, 7, "u3", 1).await;

        process_cached_submissions(&node.ctx).await;

        let participations = node.store.participations_for(7);
        assert_eq!(participations.len(), 1);
        let submission = participations[0].submission.as_ref().unwrap();
        assert_eq!(submission.kind, Some(SubmissionKind::Timeout));
        assert!(submission.answers.is_empty());
    }

    #[tokio::test]
    async fn deleted_exercise_drops_the_cache_without_storage_writes() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node, 7, "u1", true).await;
        // The exercise disappears while its cache still holds submissions.
        node.store.delete_exercise(7);

        process_cached_submissions(&node.ctx).await;

        assert!(node.ctx.registry().all_caches().is_empty());
        assert!(node.store.participations_for(7).is_empty());
        assert!(node.gateway.messages().is_empty());
    }

    #[tokio::test]
    async fn running_quizzes_keep_in_progress_submissions_cached() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node, 7, "u1", false).await;

        process_cached_submissions(&node.ctx).await;

        assert!(node.store.participations_for(7).is_empty());
        assert!(!session_service::finished_processing(&node.ctx, 7));
    }

    #[tokio::test]
    async fn draining_twice_creates_no_second_participation() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node, 7, "u1", true).await;

        process_cached_submissions(&node.ctx).await;
        process_cached_submissions(&node.ctx).await;

        assert_eq!(node.store.participations_for(7).len(), 1);
        assert_eq!(node.statistics.updates().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_key_from_a_racing_node_is_a_benign_no_op() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node, 7, "u1", true).await;

        // Another node already committed u1's participation.
        let racing = StudentParticipation {
            id: Uuid::new_v4(),
            exercise_id: 7,
            exercise: None,
            participant: Some(testing::participant("u1")),
            state: ParticipationState::Finished,
            initialization_date: None,
            submission: None,
            result: None,
        };
        node.store.save_participation(racing).await.unwrap();

        process_cached_submissions(&node.ctx).await;

        // Exactly one participation survives and the cache entries are gone.
        assert_eq!(node.store.participations_for(7).len(), 1);
        assert!(session_service::finished_processing(&node.ctx, 7));
        assert!(session_service::get_cached_participation(&node.ctx, 7, "u1").is_none());
        assert!(node.statistics.updates().is_empty());
    }

    #[tokio::test]
    async fn failed_statistics_updates_are_retried_next_tick() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node, 7, "u1", true).await;
        node.statistics.set_failing(true);

        process_cached_submissions(&node.ctx).await;
        assert!(node.statistics.updates().is_empty());
        assert_eq!(node.store.participations_for(7).len(), 1);

        node.statistics.set_failing(false);
        process_cached_submissions(&node.ctx).await;

        // The retry flushed the kept result without re-committing anything.
        assert_eq!(node.statistics.updates().len(), 1);
        assert_eq!(node.store.participations_for(7).len(), 1);
    }

    #[tokio::test]
    async fn spent_caches_are_evicted_once_the_quiz_ends() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(400), 300));
        // An empty cache left over from earlier activity.
        node.ctx.registry().transient_write(7).await;

        process_cached_submissions(&node.ctx).await;
        assert!(node.ctx.registry().all_caches().is_empty());
    }

    #[tokio::test]
    async fn idle_caches_of_running_quizzes_stay() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        node.ctx.registry().transient_write(7).await;

        process_cached_submissions(&node.ctx).await;
        assert_eq!(node.ctx.registry().all_caches().len(), 1);
    }

    #[tokio::test]
    async fn unaddressable_participation_is_reported_not_delivered() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(400), 300));

        let cache = node.ctx.registry().transient_write(7).await;
        cache.participations().insert(
            "u9".into(),
            StudentParticipation {
                id: Uuid::new_v4(),
                exercise_id: 7,
                exercise: None,
                participant: None,
                state: ParticipationState::Finished,
                initialization_date: None,
                submission: None,
                result: None,
            },
        );

        process_cached_submissions(&node.ctx).await;

        assert!(node.gateway.messages().is_empty());
        // The defective entry stays visible instead of vanishing silently.
        assert!(session_service::get_cached_participation(&node.ctx, 7, "u9").is_some());
    }

    #[tokio::test]
    async fn delivered_participations_are_stripped_for_the_client() {
        let node = TestNode::new();
        node.store
            .put_exercise(testing::synchronized_exercise(7, testing::past(400), 300));
        submit(&node, 7, "u2", true).await;

        process_cached_submissions(&node.ctx).await;

        let deliveries = node.gateway.messages_for("u2");
        assert_eq!(deliveries.len(), 1);
        let payload = &deliveries[0].payload;
        assert_eq!(payload["participant"], serde_json::Value::Null);
        assert_eq!(payload["submission"], serde_json::Value::Null);
        assert_eq!(payload["exercise"]["course_id"], serde_json::Value::Null);
        let question = &payload["result"]["submission"]["answers"][0]["question"];
        assert_eq!(question["id"], serde_json::Value::from(11));
        assert!(question["answer_options"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_synchronized_drains_persist_but_do_not_stage() {
        let node = TestNode::new();
        let mut exercise = testing::synchronized_exercise(7, testing::past(60), 600);
        exercise.mode = QuizMode::Batched;
        node.store.put_exercise(exercise);
        submit(&node, 7, "u1", true).await;

        process_cached_submissions(&node.ctx).await;

        assert_eq!(node.store.participations_for(7).len(), 1);
        assert!(session_service::get_cached_participation(&node.ctx, 7, "u1").is_none());
    }

    #[tokio::test]
    async fn one_exercise_failure_does_not_block_the_others() {
        let node = TestNode::new();
        // Exercise 7 is gone from storage; exercise 8 works normally.
        submit(&node, 7, "u1", true).await;
        node.store
            .put_exercise(testing::synchronized_exercise(8, testing::past(60), 600));
        submit(&node, 8, "u1", true).await;

        process_cached_submissions(&node.ctx).await;

        assert_eq!(node.store.participations_for(8).len(), 1);
        assert!(node.store.participations_for(7).is_empty());
    }

    #[tokio::test]
    async fn two_nodes_ticking_produce_one_participation_each_participant() {
        let node_a = TestNode::new();
        let node_b = node_a.join_cluster();
        node_a
            .store
            .put_exercise(testing::synchronized_exercise(7, testing::past(60), 600));
        submit(&node_a, 7, "u1", true).await;

        tokio::join!(
            process_cached_submissions(&node_a.ctx),
            process_cached_submissions(&node_b.ctx),
        );

        assert_eq!(node_a.store.participations_for(7).len(), 1);
    }

    #[tokio::test]
    async fn eviction_cancels_leftover_start_tasks() {
        let node = TestNode::new();
        // Quiz ended, cache idle, but a stale start handle lingers.
        node.store
            .put_exercise(testing::synchronized_exercise(9, testing::past(400), 300));
        let noop: crate::scheduler::TaskFn = Arc::new(|| Box::pin(async {}));
        let handle = match node.scheduler.schedule_once(
            &crate::scheduler::start_task_name(9),
            std::time::Duration::from_secs(600),
            noop,
        ) {
            crate::scheduler::ScheduleOutcome::Scheduled(handle) => handle,
            crate::scheduler::ScheduleOutcome::AlreadyScheduled => unreachable!(),
        };
        node.ctx
            .registry()
            .atomic_write(9, |record| record.start_task_handles = vec![handle.clone()])
            .await;

        process_cached_submissions(&node.ctx).await;

        assert!(node.ctx.registry().all_caches().is_empty());
        assert!(node.scheduler.future(&handle).is_none());
    }
}
