//! Shared fixtures for the crate's tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cluster::local::LocalTopology;
use crate::dao::memory::InMemoryQuizStore;
use crate::dao::models::{
    AnswerOption, Participant, QuizBatch, QuizExercise, QuizMode, QuizQuestion, QuizSubmission,
    SubmittedAnswer,
};
use crate::scheduler::LocalTaskScheduler;
use crate::services::messaging::{ClientGateway, OutboundMessage};
use crate::services::statistics::{StatisticsError, StatisticsSink};
use crate::state::registry::CacheRegistry;
use crate::state::{SessionContext, SharedContext};

/// Gateway capturing every outbound message for assertions.
#[derive(Default)]
pub struct RecordingGateway {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl RecordingGateway {
    /// All messages sent so far.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages addressed to one participant.
    pub fn messages_for(&self, login: &str) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.recipient.as_deref() == Some(login))
            .collect()
    }

    /// Topic-wide broadcasts sent so far.
    pub fn broadcasts(&self) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.recipient.is_none())
            .collect()
    }
}

impl ClientGateway for RecordingGateway {
    fn deliver_to_participant(&self, login: &str, topic: &str, payload: Value) {
        self.messages.lock().unwrap().push(OutboundMessage {
            recipient: Some(login.to_string()),
            topic: topic.to_string(),
            payload,
        });
    }

    fn broadcast(&self, topic: &str, payload: Value) {
        self.messages.lock().unwrap().push(OutboundMessage {
            recipient: None,
            topic: topic.to_string(),
            payload,
        });
    }
}

/// Statistics sink capturing updates, optionally failing on demand.
#[derive(Default)]
pub struct RecordingStatistics {
    updates: Mutex<Vec<(i64, Vec<Uuid>)>>,
    fail: AtomicBool,
}

impl RecordingStatistics {
    /// Make subsequent updates fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Recorded `(exercise id, result ids)` updates.
    pub fn updates(&self) -> Vec<(i64, Vec<Uuid>)> {
        self.updates.lock().unwrap().clone()
    }
}

impl StatisticsSink for RecordingStatistics {
    fn update_statistics(
        &self,
        results: Vec<crate::dao::models::QuizResult>,
        exercise: QuizExercise,
    ) -> BoxFuture<'static, Result<(), StatisticsError>> {
        let outcome = if self.fail.load(Ordering::SeqCst) {
            Err(StatisticsError::Unavailable("injected failure".into()))
        } else {
            self.updates.lock().unwrap().push((
                exercise.id,
                results.iter().map(|result| result.id).collect(),
            ));
            Ok(())
        };
        Box::pin(async move { outcome })
    }
}

/// One wired node plus handles to its concrete collaborators.
pub struct TestNode {
    /// Context as handed to the service functions.
    pub ctx: SharedContext,
    /// Cluster backing this node (shared between nodes of one cluster).
    pub topology: Arc<LocalTopology>,
    /// Cluster scheduler (shared between nodes of one cluster).
    pub scheduler: Arc<LocalTaskScheduler>,
    /// Persistence backend.
    pub store: Arc<InMemoryQuizStore>,
    /// Statistics sink.
    pub statistics: Arc<RecordingStatistics>,
    /// Outbound gateway.
    pub gateway: Arc<RecordingGateway>,
}

impl TestNode {
    /// Wire a fresh single-node cluster.
    pub fn new() -> Self {
        Self::on(
            Arc::new(LocalTopology::default()),
            Arc::new(LocalTaskScheduler::new()),
            Arc::new(InMemoryQuizStore::new()),
            Arc::new(RecordingStatistics::default()),
            Arc::new(RecordingGateway::default()),
        )
    }

    /// Wire another node into this node's cluster: same topology, scheduler,
    /// store and collaborators, but its own registry and near cache.
    pub fn join_cluster(&self) -> Self {
        Self::on(
            self.topology.clone(),
            self.scheduler.clone(),
            self.store.clone(),
            self.statistics.clone(),
            self.gateway.clone(),
        )
    }

    fn on(
        topology: Arc<LocalTopology>,
        scheduler: Arc<LocalTaskScheduler>,
        store: Arc<InMemoryQuizStore>,
        statistics: Arc<RecordingStatistics>,
        gateway: Arc<RecordingGateway>,
    ) -> Self {
        let registry = CacheRegistry::new(topology.clone());
        let ctx = SessionContext::new(
            registry,
            scheduler.clone(),
            store.clone(),
            statistics.clone(),
            gateway.clone(),
        );
        Self {
            ctx,
            topology,
            scheduler,
            store,
            statistics,
            gateway,
        }
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// `now - secs`, for building windows that already started or ended.
pub fn past(secs: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() - time::Duration::seconds(secs)
}

/// `now + secs`, for building windows in the future.
pub fn future(secs: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + time::Duration::seconds(secs)
}

/// Synchronized exercise with one batch (id 1) and one four-point question
/// (id 11) whose only correct option is 1.
pub fn synchronized_exercise(
    id: i64,
    batch_start: OffsetDateTime,
    duration_secs: i64,
) -> QuizExercise {
    QuizExercise {
        id,
        title: format!("quiz {id}"),
        course_id: Some(1),
        mode: QuizMode::Synchronized,
        duration_secs,
        due_date: None,
        batches: vec![QuizBatch {
            id: 1,
            start_time: Some(batch_start),
        }],
        questions: vec![QuizQuestion {
            id: 11,
            title: "stable sorts".into(),
            points: 4.0,
            answer_options: vec![
                AnswerOption {
                    id: 1,
                    text: "merge sort".into(),
                    correct: true,
                },
                AnswerOption {
                    id: 2,
                    text: "quick sort".into(),
                    correct: false,
                },
            ],
        }],
    }
}

/// Submission answering question 11 with the given option selection.
pub fn submission(submitted: bool, selected: &[i64]) -> QuizSubmission {
    QuizSubmission {
        submitted,
        answers: vec![SubmittedAnswer {
            question_id: 11,
            question: None,
            selected_option_ids: selected.to_vec(),
            score: None,
        }],
        ..QuizSubmission::default()
    }
}

/// Participant fixture for a login.
pub fn participant(login: &str) -> Participant {
    Participant {
        id: login.len() as i64,
        login: login.into(),
        display_name: login.to_uppercase(),
    }
}
