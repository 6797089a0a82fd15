use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cluster::{ClusterTopology, SharedMap};
use crate::dao::models::QuizExercise;
use crate::state::session::{CacheEntry, SessionCache, SessionRecord};

/// Owner of the exercise-id to session-cache mapping.
///
/// Explicitly constructed and injected wherever it is needed; [`Self::shutdown`]
/// (or dropping the last handle) stops the broadcast listener. The registry
/// exposes three access modes with distinct contracts:
///
/// - [`Self::read_only`] never creates and never blocks,
/// - [`Self::transient_write`] creates missing caches under the per-key lock,
/// - [`Self::atomic_write`] rewrites the shared session record under the
///   per-key lock.
pub struct CacheRegistry {
    topology: Arc<dyn ClusterTopology>,
    records: Arc<dyn SharedMap<i64, SessionRecord>>,
    /// Node-local near cache of exercise snapshots, deliberately kept out of
    /// the replicated maps: snapshots are large and expensive to reserialize.
    snapshots: DashMap<i64, Arc<QuizExercise>>,
    listener: OnceLock<tokio::task::AbortHandle>,
}

impl CacheRegistry {
    /// Build a registry over the given topology and start its listener for
    /// exercise snapshot broadcasts.
    pub fn new(topology: Arc<dyn ClusterTopology>) -> Arc<Self> {
        let registry = Arc::new(Self {
            records: topology.session_records(),
            snapshots: DashMap::new(),
            listener: OnceLock::new(),
            topology,
        });
        let updates = registry.topology.subscribe_exercises();
        let task = tokio::spawn(run_update_listener(Arc::downgrade(&registry), updates));
        let _ = registry.listener.set(task.abort_handle());
        registry
    }

    fn assemble(&self, record: SessionRecord) -> SessionCache {
        let exercise_id = record.exercise_id;
        SessionCache::new(
            record,
            self.cached_exercise(exercise_id),
            self.topology.submissions_of(exercise_id),
            self.topology.participations_of(exercise_id),
            self.topology.batch_assignments_of(exercise_id),
            self.topology.results_of(exercise_id),
        )
    }

    /// Current cache for the exercise, or [`CacheEntry::Absent`].
    ///
    /// Never creates a cache and never takes the per-key lock, so lookups on
    /// the submission hot path stay cheap.
    pub fn read_only(&self, exercise_id: i64) -> CacheEntry {
        match self.records.get(&exercise_id) {
            Some(record) => CacheEntry::Present(self.assemble(record)),
            None => CacheEntry::Absent,
        }
    }

    /// Current cache for the exercise, creating it under the per-key lock
    /// when none exists yet.
    ///
    /// Intended for mutating the cache's own maps, which are individually
    /// safe for concurrent writers; the lock only guards creation.
    pub async fn transient_write(&self, exercise_id: i64) -> SessionCache {
        if let Some(record) = self.records.get(&exercise_id) {
            return self.assemble(record);
        }
        let lock = self.topology.session_lock(exercise_id);
        let _guard = lock.lock().await;
        if let Some(record) = self.records.get(&exercise_id) {
            return self.assemble(record);
        }
        let record = SessionRecord::new(exercise_id);
        self.records.insert(exercise_id, record.clone());
        debug!(exercise_id, "created session cache");
        self.assemble(record)
    }

    /// Rewrite the session record under the per-key lock, creating it first
    /// when absent.
    ///
    /// The lock scope covers only the registry's own fields; callers must
    /// never perform storage or network I/O inside `mutate`.
    pub async fn atomic_write<F>(&self, exercise_id: i64, mutate: F) -> SessionCache
    where
        F: FnOnce(&mut SessionRecord),
    {
        let lock = self.topology.session_lock(exercise_id);
        let _guard = lock.lock().await;
        let mut record = self
            .records
            .get(&exercise_id)
            .unwrap_or_else(|| SessionRecord::new(exercise_id));
        mutate(&mut record);
        self.records.insert(exercise_id, record.clone());
        // Read the entry back before releasing the lock so a near cache in
        // front of the record map is warmed with the just-written value.
        let record = self.records.get(&exercise_id).unwrap_or(record);
        self.assemble(record)
    }

    /// Like [`Self::atomic_write`], but a no-op when no cache exists.
    pub async fn atomic_write_if_present<F>(
        &self,
        exercise_id: i64,
        mutate: F,
    ) -> Option<SessionCache>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let lock = self.topology.session_lock(exercise_id);
        let _guard = lock.lock().await;
        let mut record = self.records.get(&exercise_id)?;
        mutate(&mut record);
        self.records.insert(exercise_id, record.clone());
        let record = self.records.get(&exercise_id).unwrap_or(record);
        Some(self.assemble(record))
    }

    /// Broadcast an updated exercise snapshot to every node.
    ///
    /// Each node's listener stores the snapshot into its local near cache via
    /// [`Self::transient_write`]; the shared maps are never touched, so the
    /// large snapshot is serialized once instead of per map operation.
    pub fn update_exercise(&self, exercise: Arc<QuizExercise>) {
        self.topology.publish_exercise(exercise);
    }

    /// Node-local exercise snapshot, if one has been received or stored.
    pub fn cached_exercise(&self, exercise_id: i64) -> Option<Arc<QuizExercise>> {
        self.snapshots
            .get(&exercise_id)
            .map(|entry| entry.value().clone())
    }

    /// Handles to every live cache, for bulk operations such as the
    /// reconciliation sweep.
    pub fn all_caches(&self) -> Vec<SessionCache> {
        self.records
            .entries()
            .into_iter()
            .map(|(_, record)| self.assemble(record))
            .collect()
    }

    /// Remove the registry entry for an exercise and release its shared maps.
    ///
    /// Scheduled start tasks are NOT cancelled here; callers cancel them
    /// explicitly before or alongside removal.
    pub fn remove_and_clear(&self, exercise_id: i64) {
        self.snapshots.remove(&exercise_id);
        if let Some(record) = self.records.remove(&exercise_id) {
            let cache = self.assemble(record);
            cache.clear();
            self.topology.destroy_session(exercise_id);
            debug!(exercise_id, "removed session cache");
        }
    }

    /// Remove and clear every cache.
    ///
    /// Destructive last-resort operation: concurrent writers lose whatever
    /// they add mid-iteration.
    pub fn clear_all(&self) {
        warn!("clearing every session cache");
        for (exercise_id, _) in self.records.entries() {
            self.remove_and_clear(exercise_id);
        }
        self.snapshots.clear();
    }

    /// Stop the broadcast listener.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.get() {
            listener.abort();
        }
    }

    async fn apply_exercise_update(&self, exercise: Arc<QuizExercise>) {
        let exercise_id = exercise.id;
        self.transient_write(exercise_id).await;
        self.snapshots.insert(exercise_id, exercise);
        debug!(exercise_id, "applied exercise snapshot update");
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_update_listener(
    registry: Weak<CacheRegistry>,
    mut updates: broadcast::Receiver<Arc<QuizExercise>>,
) {
    loop {
        match updates.recv().await {
            Ok(exercise) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.apply_exercise_update(exercise).await;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Snapshots are refreshed from storage every tick anyway, so
                // dropped updates only delay convergence.
                warn!(missed, "exercise update listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::local::LocalTopology;
    use crate::dao::models::{QuizMode, QuizSubmission};
    use crate::scheduler::TaskHandle;

    fn exercise(id: i64) -> Arc<QuizExercise> {
        Arc::new(QuizExercise {
            id,
            title: format!("quiz {id}"),
            course_id: Some(1),
            mode: QuizMode::Synchronized,
            duration_secs: 120,
            due_date: None,
            batches: Vec::new(),
            questions: Vec::new(),
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn read_only_never_creates() {
        let registry = CacheRegistry::new(Arc::new(LocalTopology::default()));
        assert!(matches!(registry.read_only(7), CacheEntry::Absent));
        assert!(registry.all_caches().is_empty());
    }

    #[tokio::test]
    async fn racing_creators_end_up_with_one_cache() {
        let registry = CacheRegistry::new(Arc::new(LocalTopology::default()));

        let mut workers = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            workers.push(tokio::spawn(async move {
                registry.transient_write(7).await;
            }));
        }
        for worker in workers {
            worker.await.expect("worker");
        }

        assert_eq!(registry.all_caches().len(), 1);
        assert_eq!(registry.all_caches()[0].exercise_id(), 7);
    }

    #[tokio::test]
    async fn atomic_write_persists_and_returns_the_new_record() {
        let registry = CacheRegistry::new(Arc::new(LocalTopology::default()));
        let handle = TaskHandle {
            name: "7-start".into(),
            id: uuid::Uuid::new_v4(),
        };

        let written = registry
            .atomic_write(7, |record| {
                record.start_task_handles = vec![handle.clone()];
            })
            .await;
        assert_eq!(written.start_task_handles().to_vec(), vec![handle.clone()]);

        let reread = registry.read_only(7);
        assert_eq!(reread.start_task_handles(), vec![handle]);
    }

    #[tokio::test]
    async fn atomic_write_if_present_skips_missing_caches() {
        let registry = CacheRegistry::new(Arc::new(LocalTopology::default()));
        let outcome = registry
            .atomic_write_if_present(7, |record| {
                record.start_task_handles.clear();
            })
            .await;
        assert!(outcome.is_none());
        assert!(matches!(registry.read_only(7), CacheEntry::Absent));
    }

    #[tokio::test]
    async fn broadcast_update_converges_on_every_node() {
        let topology = Arc::new(LocalTopology::default());
        let node_a = CacheRegistry::new(topology.clone());
        let node_b = CacheRegistry::new(topology.clone());

        let snapshot = exercise(7);
        node_a.update_exercise(snapshot.clone());

        wait_until(|| node_b.cached_exercise(7).is_some()).await;

        let seen = node_b.transient_write(7).await;
        assert_eq!(seen.exercise().as_deref(), Some(snapshot.as_ref()));
        // The publisher's own listener receives the broadcast as well.
        wait_until(|| node_a.cached_exercise(7).is_some()).await;
    }

    #[tokio::test]
    async fn remove_and_clear_drops_record_maps_and_snapshot() {
        let topology = Arc::new(LocalTopology::default());
        let registry = CacheRegistry::new(topology.clone());

        let cache = registry.transient_write(7).await;
        cache
            .submissions()
            .insert("u1".into(), QuizSubmission::default());
        registry.update_exercise(exercise(7));
        wait_until(|| registry.cached_exercise(7).is_some()).await;

        registry.remove_and_clear(7);

        assert!(matches!(registry.read_only(7), CacheEntry::Absent));
        assert!(registry.cached_exercise(7).is_none());
        assert!(topology.submissions_of(7).is_empty());
    }

    #[tokio::test]
    async fn clear_all_empties_the_registry() {
        let registry = CacheRegistry::new(Arc::new(LocalTopology::default()));
        registry.transient_write(7).await;
        registry.transient_write(8).await;

        registry.clear_all();

        assert!(registry.all_caches().is_empty());
    }
}
