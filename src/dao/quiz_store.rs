use futures::future::BoxFuture;

use crate::dao::models::{Participant, QuizExercise, QuizSubmission, StudentParticipation};
use crate::dao::storage::StorageResult;

/// Abstraction over the persistence layer for quiz exercises, participations
/// and submissions.
///
/// The live session layers only ever talk to this trait; the relational
/// schema behind it belongs to the persistence service.
pub trait QuizStore: Send + Sync {
    /// Fetch a lean exercise snapshot without questions, or `None` when the
    /// exercise has been deleted.
    fn find_exercise(&self, id: i64) -> BoxFuture<'static, StorageResult<Option<QuizExercise>>>;
    /// Fetch the full exercise snapshot including questions and solutions.
    fn find_exercise_with_details(
        &self,
        id: i64,
    ) -> BoxFuture<'static, StorageResult<Option<QuizExercise>>>;
    /// List exercises whose start still lies in the future.
    fn find_planned_future_exercises(&self)
    -> BoxFuture<'static, StorageResult<Vec<QuizExercise>>>;
    /// Persist a participation; raises a duplicate-key error when the
    /// participant already has one for the exercise.
    fn save_participation(
        &self,
        participation: StudentParticipation,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Persist a finalized submission for an existing participation; raises a
    /// duplicate-key error when one was already committed.
    fn save_submission(
        &self,
        participation_id: uuid::Uuid,
        submission: QuizSubmission,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Resolve a participant by login.
    fn find_participant_by_login(
        &self,
        login: &str,
    ) -> BoxFuture<'static, StorageResult<Option<Participant>>>;
}
