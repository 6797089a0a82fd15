//! Scheduling glue: the recurring reconciliation tick and the one-shot
//! "start this quiz now" tasks, both deduplicated cluster-wide by name.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::dao::models::{QuizBatch, QuizMode};
use crate::dao::quiz_store::QuizStore;
use crate::error::ServiceError;
use crate::scheduler::{
    RECONCILIATION_TASK_NAME, ScheduleOutcome, TaskFn, TaskScheduler, start_task_name,
};
use crate::services::{quiz_events, reconciliation_service, session_service};
use crate::state::SharedContext;

/// Register the recurring reconciliation tick and schedule the start task of
/// every exercise planned to begin in the future.
///
/// Safe to call on every node at boot: losing the tick registration race to
/// another node is the expected outcome, not a failure.
pub async fn start_schedule(ctx: &SharedContext, period: Duration) {
    let tick: TaskFn = {
        let ctx = ctx.clone();
        Arc::new(move || {
            let ctx = ctx.clone();
            Box::pin(async move {
                reconciliation_service::process_cached_submissions(&ctx).await;
            })
        })
    };
    match ctx
        .scheduler()
        .schedule_fixed_rate(RECONCILIATION_TASK_NAME, period, tick)
    {
        ScheduleOutcome::Scheduled(_) => {
            info!(period_ms = period.as_millis() as u64, "reconciliation schedule started");
        }
        ScheduleOutcome::AlreadyScheduled => {
            // Expected when several nodes boot against one cluster.
            warn!("reconciliation task already registered");
        }
    }

    match ctx.store().find_planned_future_exercises().await {
        Ok(exercises) => {
            info!(
                count = exercises.len(),
                "found quiz exercises planned to start in the future"
            );
            for exercise in exercises {
                // Exam quizzes are driven by the exam timetable, not by us.
                if exercise.course_id.is_none() {
                    continue;
                }
                if let Err(err) = schedule_exercise_start(ctx, exercise.id).await {
                    error!(
                        exercise_id = exercise.id,
                        error = %err,
                        "failed to schedule planned quiz start"
                    );
                }
            }
        }
        Err(err) => error!(error = %err, "failed to list planned quiz exercises"),
    }
}

/// Cancel the reconciliation tick and every scheduled quiz start.
pub async fn stop_schedule(ctx: &SharedContext) {
    match ctx.scheduler().find(RECONCILIATION_TASK_NAME) {
        Some(handle) => match ctx.scheduler().future(&handle) {
            Some(future) => {
                let cancelled = future.cancel();
                future.dispose();
                info!(cancelled, "stopped reconciliation schedule");
            }
            None => info!("reconciliation schedule already disposed or cancelled"),
        },
        None => debug!("reconciliation schedule is not running"),
    }

    for cache in ctx.registry().all_caches() {
        if !cache.start_task_handles().is_empty() {
            cancel_scheduled_start(ctx, cache.exercise_id()).await;
        }
    }
}

/// (Re-)schedule the automatic start of a synchronized quiz.
///
/// Any previously scheduled start is cancelled first, so calling this after
/// an exercise update moves the task to the new start time. Exercises in
/// other modes, without a planned start, or already started only get their
/// snapshot re-broadcast.
pub async fn schedule_exercise_start(ctx: &SharedContext, exercise_id: i64) -> Result<(), ServiceError> {
    cancel_scheduled_start(ctx, exercise_id).await;

    let Some(exercise) = ctx.store().find_exercise_with_details(exercise_id).await? else {
        return Ok(());
    };
    let exercise = Arc::new(exercise);

    if exercise.mode == QuizMode::Synchronized {
        let planned_start = exercise
            .synchronized_batch()
            .and_then(|batch| batch.start_time);
        let now = OffsetDateTime::now_utc();
        if let Some(start) = planned_start
            && start > now
        {
            let delay = std::time::Duration::try_from(start - now).unwrap_or_default();
            let task: TaskFn = {
                let ctx = ctx.clone();
                Arc::new(move || {
                    let ctx = ctx.clone();
                    Box::pin(async move {
                        if let Err(err) = execute_start_now(&ctx, exercise_id).await {
                            error!(exercise_id, error = %err, "quiz start task failed");
                        }
                    })
                })
            };
            match ctx
                .scheduler()
                .schedule_once(&start_task_name(exercise_id), delay, task)
            {
                ScheduleOutcome::Scheduled(handle) => {
                    info!(exercise_id, delay_ms = delay.as_millis() as u64, "scheduled quiz start");
                    ctx.registry()
                        .atomic_write(exercise_id, |record| {
                            record.start_task_handles = vec![handle.clone()];
                        })
                        .await;
                }
                ScheduleOutcome::AlreadyScheduled => {
                    // Expected when several nodes race to schedule the same quiz.
                    debug!(exercise_id, "quiz start task already registered");
                }
            }
        }
    }

    session_service::update_cached_exercise(ctx, exercise);
    Ok(())
}

/// Cancel a scheduled quiz start, e.g. because the quiz was deleted or its
/// start time changed.
pub async fn cancel_scheduled_start(ctx: &SharedContext, exercise_id: i64) {
    for handle in ctx.registry().read_only(exercise_id).start_task_handles() {
        match ctx.scheduler().future(&handle) {
            Some(future) => {
                let task_not_done = !future.is_done();
                let mut cancelled = false;
                if task_not_done {
                    cancelled = future.cancel();
                }
                // Dispose regardless of the cancel outcome; a task that fired
                // in between must not make cleanup fail.
                future.dispose();
                if task_not_done {
                    info!(exercise_id, cancelled, "stopped scheduled quiz start");
                }
            }
            None => {
                // Stale handle: another node already disposed the task.
                info!(exercise_id, "scheduled quiz start already disposed or cancelled");
            }
        }
    }
    ctx.registry()
        .atomic_write_if_present(exercise_id, |record| {
            record.start_task_handles.clear();
        })
        .await;
}

/// Fired by the scheduler at the synchronized start time: mark the batch
/// started and push the quiz to all subscribed clients.
pub async fn execute_start_now(ctx: &SharedContext, exercise_id: i64) -> Result<(), ServiceError> {
    ctx.registry()
        .atomic_write_if_present(exercise_id, |record| {
            record.start_task_handles.clear();
        })
        .await;
    debug!(exercise_id, "sending quiz start");

    let Some(exercise) = ctx.store().find_exercise_with_details(exercise_id).await? else {
        return Err(ServiceError::NotFound(format!(
            "quiz exercise `{exercise_id}` no longer exists"
        )));
    };
    let exercise = Arc::new(exercise);
    session_service::update_cached_exercise(ctx, exercise.clone());

    if exercise.mode != QuizMode::Synchronized {
        return Err(ServiceError::InvalidState(format!(
            "quiz exercise `{exercise_id}` is not synchronized"
        )));
    }

    let batch = QuizBatch {
        id: exercise
            .synchronized_batch()
            .map(|batch| batch.id)
            .unwrap_or_default(),
        start_time: Some(OffsetDateTime::now_utc()),
    };
    quiz_events::send_exercise_start(ctx.gateway().as_ref(), &exercise, &batch);
    Ok(())
}
