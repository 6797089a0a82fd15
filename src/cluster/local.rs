use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::cluster::{ClusterTopology, SharedMap};
use crate::dao::models::{QuizExercise, QuizResult, QuizSubmission, StudentParticipation};
use crate::state::session::SessionRecord;

/// [`SharedMap`] backed by a process-local [`DashMap`].
pub struct LocalMap<K, V> {
    inner: DashMap<K, V>,
}

impl<K, V> Default for LocalMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }
}

impl<K, V> SharedMap<K, V> for LocalMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    fn insert_if_absent(&self, key: K, value: V) -> bool {
        match self.inner.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

/// Single-process [`ClusterTopology`].
///
/// Used directly for single-node deployments; tests model a multi-node
/// cluster by building several registries over one shared instance.
pub struct LocalTopology {
    records: Arc<LocalMap<i64, SessionRecord>>,
    submissions: DashMap<i64, Arc<LocalMap<String, QuizSubmission>>>,
    participations: DashMap<i64, Arc<LocalMap<String, StudentParticipation>>>,
    batch_assignments: DashMap<i64, Arc<LocalMap<String, i64>>>,
    results: DashMap<i64, Arc<LocalMap<Uuid, QuizResult>>>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
    exercise_updates: broadcast::Sender<Arc<QuizExercise>>,
}

impl LocalTopology {
    /// Build a topology whose update channel buffers `broadcast_capacity` messages.
    pub fn new(broadcast_capacity: usize) -> Self {
        let (exercise_updates, _receiver) = broadcast::channel(broadcast_capacity);
        Self {
            records: Arc::new(LocalMap::default()),
            submissions: DashMap::new(),
            participations: DashMap::new(),
            batch_assignments: DashMap::new(),
            results: DashMap::new(),
            locks: DashMap::new(),
            exercise_updates,
        }
    }

    fn map_of<K, V>(
        maps: &DashMap<i64, Arc<LocalMap<K, V>>>,
        exercise_id: i64,
    ) -> Arc<LocalMap<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        maps.entry(exercise_id)
            .or_insert_with(|| Arc::new(LocalMap::default()))
            .clone()
    }
}

impl Default for LocalTopology {
    fn default() -> Self {
        Self::new(16)
    }
}

impl ClusterTopology for LocalTopology {
    fn session_records(&self) -> Arc<dyn SharedMap<i64, SessionRecord>> {
        self.records.clone()
    }

    fn submissions_of(&self, exercise_id: i64) -> Arc<dyn SharedMap<String, QuizSubmission>> {
        Self::map_of(&self.submissions, exercise_id)
    }

    fn participations_of(
        &self,
        exercise_id: i64,
    ) -> Arc<dyn SharedMap<String, StudentParticipation>> {
        Self::map_of(&self.participations, exercise_id)
    }

    fn batch_assignments_of(&self, exercise_id: i64) -> Arc<dyn SharedMap<String, i64>> {
        Self::map_of(&self.batch_assignments, exercise_id)
    }

    fn results_of(&self, exercise_id: i64) -> Arc<dyn SharedMap<Uuid, QuizResult>> {
        Self::map_of(&self.results, exercise_id)
    }

    fn session_lock(&self, exercise_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(exercise_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn destroy_session(&self, exercise_id: i64) {
        self.submissions.remove(&exercise_id);
        self.participations.remove(&exercise_id);
        self.batch_assignments.remove(&exercise_id);
        self.results.remove(&exercise_id);
    }

    fn publish_exercise(&self, exercise: Arc<QuizExercise>) {
        let _ = self.exercise_updates.send(exercise);
    }

    fn subscribe_exercises(&self) -> broadcast::Receiver<Arc<QuizExercise>> {
        self.exercise_updates.subscribe()
    }
}
