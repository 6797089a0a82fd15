use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::dao::models::{Participant, QuizExercise, QuizSubmission, StudentParticipation};
use crate::dao::quiz_store::QuizStore;
use crate::dao::storage::{StorageError, StorageResult};

/// Process-local [`QuizStore`] backend.
///
/// Enforces the same unique constraints a relational schema would: one
/// participation per `(exercise, participant)` and one committed submission
/// per participation. Used by single-node deployments and throughout the
/// tests; a database-backed store implements the same trait.
#[derive(Default)]
pub struct InMemoryQuizStore {
    exercises: DashMap<i64, QuizExercise>,
    participants: DashMap<String, Participant>,
    participations: DashMap<(i64, String), StudentParticipation>,
    submissions: DashMap<Uuid, QuizSubmission>,
}

impl InMemoryQuizStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an exercise definition.
    pub fn put_exercise(&self, exercise: QuizExercise) {
        self.exercises.insert(exercise.id, exercise);
    }

    /// Delete an exercise, simulating removal through the management UI.
    pub fn delete_exercise(&self, id: i64) {
        self.exercises.remove(&id);
    }

    /// Register a participant so logins can be resolved during the drain.
    pub fn put_participant(&self, participant: Participant) {
        self.participants
            .insert(participant.login.clone(), participant);
    }

    /// All persisted participations for one exercise.
    pub fn participations_for(&self, exercise_id: i64) -> Vec<StudentParticipation> {
        self.participations
            .iter()
            .filter(|entry| entry.key().0 == exercise_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The persisted submission for a participation, if any.
    pub fn submission_for(&self, participation_id: Uuid) -> Option<QuizSubmission> {
        self.submissions
            .get(&participation_id)
            .map(|entry| entry.value().clone())
    }

    fn participation_key(participation: &StudentParticipation) -> (i64, String) {
        let owner = participation
            .participant_login()
            .map(str::to_owned)
            .unwrap_or_else(|| participation.id.to_string());
        (participation.exercise_id, owner)
    }
}

impl QuizStore for InMemoryQuizStore {
    fn find_exercise(&self, id: i64) -> BoxFuture<'static, StorageResult<Option<QuizExercise>>> {
        let found = self.exercises.get(&id).map(|entry| {
            let mut lean = entry.value().clone();
            lean.questions = Vec::new();
            lean
        });
        Box::pin(async move { Ok(found) })
    }

    fn find_exercise_with_details(
        &self,
        id: i64,
    ) -> BoxFuture<'static, StorageResult<Option<QuizExercise>>> {
        let found = self.exercises.get(&id).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(found) })
    }

    fn find_planned_future_exercises(
        &self,
    ) -> BoxFuture<'static, StorageResult<Vec<QuizExercise>>> {
        let now = OffsetDateTime::now_utc();
        let planned = self
            .exercises
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .batches
                    .iter()
                    .any(|batch| batch.start_time.is_some_and(|start| start > now))
            })
            .map(|entry| entry.value().clone())
            .collect();
        Box::pin(async move { Ok(planned) })
    }

    fn save_participation(
        &self,
        participation: StudentParticipation,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let key = Self::participation_key(&participation);
        let outcome = match self.participations.entry(key.clone()) {
            Entry::Occupied(_) => Err(StorageError::DuplicateKey {
                entity: "participation",
                key: format!("{}/{}", key.0, key.1),
            }),
            Entry::Vacant(slot) => {
                slot.insert(participation);
                Ok(())
            }
        };
        Box::pin(async move { outcome })
    }

    fn save_submission(
        &self,
        participation_id: Uuid,
        submission: QuizSubmission,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let outcome = match self.submissions.entry(participation_id) {
            Entry::Occupied(_) => Err(StorageError::DuplicateKey {
                entity: "submission",
                key: participation_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(submission);
                Ok(())
            }
        };
        Box::pin(async move { outcome })
    }

    fn find_participant_by_login(
        &self,
        login: &str,
    ) -> BoxFuture<'static, StorageResult<Option<Participant>>> {
        let found = self.participants.get(login).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(found) })
    }
}
