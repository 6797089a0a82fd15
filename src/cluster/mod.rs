//! Conceptual cluster-wide key-value layer backing the session caches.
//!
//! The cache and registry code is written against these traits only. The
//! shipped [`local::LocalTopology`] keeps everything in-process; a networked
//! backend with cluster-wide maps, locks, and pub/sub implements the same
//! contract.

/// Process-local topology implementation.
pub mod local;

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::dao::models::{QuizExercise, QuizResult, QuizSubmission, StudentParticipation};
use crate::state::session::SessionRecord;

/// Owned-value view over a concurrent map shared by every node of the cluster.
///
/// Semantics follow a distributed map: values are copied in and out, and
/// individual operations are safe under uncoordinated concurrent mutation
/// from any number of threads or nodes. Cross-entry consistency is not
/// provided; `entries` is a point-in-time snapshot.
pub trait SharedMap<K, V>: Send + Sync {
    /// Copy of the value stored under `key`.
    fn get(&self, key: &K) -> Option<V>;
    /// Store `value` under `key`, replacing any previous value.
    fn insert(&self, key: K, value: V);
    /// Store `value` only when `key` is vacant; returns whether it was stored.
    fn insert_if_absent(&self, key: K, value: V) -> bool;
    /// Remove and return the value stored under `key`.
    fn remove(&self, key: &K) -> Option<V>;
    /// Whether the map currently holds no entries.
    fn is_empty(&self) -> bool;
    /// Number of entries currently held.
    fn len(&self) -> usize;
    /// Point-in-time snapshot of all entries.
    fn entries(&self) -> Vec<(K, V)>;
    /// Remove every entry.
    fn clear(&self);
}

/// Factory for the shared structures of the session cache layer.
///
/// One topology instance represents one cluster; every registry built over
/// the same instance observes the same shared state, the way every node of a
/// deployment observes the same networked store.
pub trait ClusterTopology: Send + Sync {
    /// The registry map of live session records, keyed by exercise id.
    fn session_records(&self) -> Arc<dyn SharedMap<i64, SessionRecord>>;
    /// Pending submissions of one exercise, keyed by participant login.
    fn submissions_of(&self, exercise_id: i64) -> Arc<dyn SharedMap<String, QuizSubmission>>;
    /// Staged participations of one exercise, keyed by participant login.
    fn participations_of(
        &self,
        exercise_id: i64,
    ) -> Arc<dyn SharedMap<String, StudentParticipation>>;
    /// Batch membership of one exercise, participant login to batch id.
    fn batch_assignments_of(&self, exercise_id: i64) -> Arc<dyn SharedMap<String, i64>>;
    /// Results of one exercise awaiting statistics aggregation, keyed by result id.
    fn results_of(&self, exercise_id: i64) -> Arc<dyn SharedMap<Uuid, QuizResult>>;
    /// Lock guarding creation and record rewrites for one exercise id.
    ///
    /// `LocalTopology` hands out process-wide mutexes; a networked topology
    /// must return handles whose lock scope is cluster-wide.
    fn session_lock(&self, exercise_id: i64) -> Arc<Mutex<()>>;
    /// Release the shared maps of one exercise after its cache is removed.
    fn destroy_session(&self, exercise_id: i64);
    /// Publish an updated exercise snapshot to every node.
    ///
    /// Delivery is at-least-once with no ordering guarantee.
    fn publish_exercise(&self, exercise: Arc<QuizExercise>);
    /// Subscribe to exercise snapshot updates.
    fn subscribe_exercises(&self) -> broadcast::Receiver<Arc<QuizExercise>>;
}
