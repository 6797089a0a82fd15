use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::cluster::SharedMap;
use crate::dao::models::{QuizExercise, QuizResult, QuizSubmission, StudentParticipation};
use crate::scheduler::TaskHandle;

/// Cluster-visible bookkeeping record for one live exercise session.
///
/// This is the value stored in the registry map; it stays small because it is
/// rewritten (and re-replicated) on every atomic write. The bulky live data
/// lives in the separate shared maps, the exercise snapshot stays node-local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Exercise this session belongs to.
    pub exercise_id: i64,
    /// Handles of scheduled start tasks; at most one in synchronized mode.
    pub start_task_handles: Vec<TaskHandle>,
}

impl SessionRecord {
    /// Fresh record with no scheduled start tasks.
    pub fn new(exercise_id: i64) -> Self {
        Self {
            exercise_id,
            start_task_handles: Vec::new(),
        }
    }
}

/// Live handle to one exercise's session: the shared record plus the four
/// replicated maps and the transiently attached exercise snapshot.
///
/// Cloning is cheap; every clone addresses the same shared state.
#[derive(Clone)]
pub struct SessionCache {
    record: SessionRecord,
    exercise: Option<Arc<QuizExercise>>,
    submissions: Arc<dyn SharedMap<String, QuizSubmission>>,
    participations: Arc<dyn SharedMap<String, StudentParticipation>>,
    batch_assignments: Arc<dyn SharedMap<String, i64>>,
    results: Arc<dyn SharedMap<Uuid, QuizResult>>,
}

impl SessionCache {
    /// Assemble a cache handle from its shared parts.
    pub fn new(
        record: SessionRecord,
        exercise: Option<Arc<QuizExercise>>,
        submissions: Arc<dyn SharedMap<String, QuizSubmission>>,
        participations: Arc<dyn SharedMap<String, StudentParticipation>>,
        batch_assignments: Arc<dyn SharedMap<String, i64>>,
        results: Arc<dyn SharedMap<Uuid, QuizResult>>,
    ) -> Self {
        Self {
            record,
            exercise,
            submissions,
            participations,
            batch_assignments,
            results,
        }
    }

    /// Exercise id this cache belongs to.
    pub fn exercise_id(&self) -> i64 {
        self.record.exercise_id
    }

    /// Node-local exercise snapshot attached when the handle was assembled.
    pub fn exercise(&self) -> Option<Arc<QuizExercise>> {
        self.exercise.clone()
    }

    /// Handles of the scheduled start tasks.
    pub fn start_task_handles(&self) -> &[TaskHandle] {
        &self.record.start_task_handles
    }

    /// Pending submissions keyed by participant login.
    pub fn submissions(&self) -> &Arc<dyn SharedMap<String, QuizSubmission>> {
        &self.submissions
    }

    /// Staged participations keyed by participant login.
    pub fn participations(&self) -> &Arc<dyn SharedMap<String, StudentParticipation>> {
        &self.participations
    }

    /// Batch membership keyed by participant login.
    pub fn batch_assignments(&self) -> &Arc<dyn SharedMap<String, i64>> {
        &self.batch_assignments
    }

    /// Results awaiting statistics aggregation keyed by result id.
    pub fn results(&self) -> &Arc<dyn SharedMap<Uuid, QuizResult>> {
        &self.results
    }

    /// Empty every shared map of this session.
    ///
    /// Discarding non-empty maps means in-flight data is lost, which is worth
    /// a warning: it only legitimately happens on operator-forced clears.
    pub fn clear(&self) {
        let exercise_id = self.exercise_id();
        if !self.submissions.is_empty() {
            warn!(
                exercise_id,
                count = self.submissions.len(),
                "clearing cache discards pending submissions"
            );
        }
        if !self.participations.is_empty() {
            warn!(
                exercise_id,
                count = self.participations.len(),
                "clearing cache discards undelivered participations"
            );
        }
        if !self.results.is_empty() {
            warn!(
                exercise_id,
                count = self.results.len(),
                "clearing cache discards unaggregated results"
            );
        }
        self.submissions.clear();
        self.participations.clear();
        self.batch_assignments.clear();
        self.results.clear();
    }
}

impl PartialEq for SessionCache {
    fn eq(&self, other: &Self) -> bool {
        self.exercise_id() == other.exercise_id()
    }
}

impl Eq for SessionCache {}

impl Hash for SessionCache {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.exercise_id().hash(state);
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("exercise_id", &self.exercise_id())
            .field("start_task_handles", &self.record.start_task_handles)
            .field("submissions", &self.submissions.len())
            .field("participations", &self.participations.len())
            .field("batch_assignments", &self.batch_assignments.len())
            .field("results", &self.results.len())
            .finish()
    }
}

/// Read-path view of a possibly missing session cache.
///
/// `Absent` replaces a null check: its readers answer with empty data, and
/// mutation is impossible by construction because mutators only exist on
/// [`SessionCache`].
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// A live session exists for the exercise.
    Present(SessionCache),
    /// No session exists; reads resolve to empty data.
    Absent,
}

impl CacheEntry {
    /// The live cache, when present.
    pub fn as_present(&self) -> Option<&SessionCache> {
        match self {
            CacheEntry::Present(cache) => Some(cache),
            CacheEntry::Absent => None,
        }
    }

    /// Cached submission of one participant.
    pub fn submission_of(&self, login: &str) -> Option<QuizSubmission> {
        self.as_present()
            .and_then(|cache| cache.submissions().get(&login.to_string()))
    }

    /// Staged participation of one participant.
    pub fn participation_of(&self, login: &str) -> Option<StudentParticipation> {
        self.as_present()
            .and_then(|cache| cache.participations().get(&login.to_string()))
    }

    /// Batch the participant joined.
    pub fn batch_of(&self, login: &str) -> Option<i64> {
        self.as_present()
            .and_then(|cache| cache.batch_assignments().get(&login.to_string()))
    }

    /// Node-local exercise snapshot, when a session exists and one is attached.
    pub fn exercise(&self) -> Option<Arc<QuizExercise>> {
        self.as_present().and_then(SessionCache::exercise)
    }

    /// Scheduled start task handles; empty when absent.
    pub fn start_task_handles(&self) -> Vec<TaskHandle> {
        self.as_present()
            .map(|cache| cache.start_task_handles().to_vec())
            .unwrap_or_default()
    }

    /// Whether no pending submissions exist (vacuously true when absent).
    pub fn submissions_drained(&self) -> bool {
        self.as_present()
            .is_none_or(|cache| cache.submissions().is_empty())
    }
}
