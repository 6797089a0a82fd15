use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// How participants are admitted to a quiz exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizMode {
    /// Every participant shares a single, globally synchronized start time.
    Synchronized,
    /// Participants join one of several batches, each with its own window.
    Batched,
    /// Every participant starts their own window individually.
    Individual,
}

/// A group of participants sharing one start/end window within an exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizBatch {
    /// Primary key of the batch.
    pub id: i64,
    /// When the batch window opens; `None` while the start is still unplanned.
    pub start_time: Option<OffsetDateTime>,
}

impl QuizBatch {
    /// Whether the batch window has opened at `now`.
    pub fn is_started(&self, now: OffsetDateTime) -> bool {
        self.start_time.is_some_and(|start| start <= now)
    }

    /// Whether the batch window has closed at `now` given the exercise working time.
    pub fn has_ended(&self, now: OffsetDateTime, duration_secs: i64) -> bool {
        self.start_time
            .is_some_and(|start| start + time::Duration::seconds(duration_secs) <= now)
    }
}

/// A single selectable option inside a quiz question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerOption {
    /// Primary key of the option.
    pub id: i64,
    /// Text shown to the participant.
    pub text: String,
    /// Whether selecting this option is part of the correct solution.
    ///
    /// This flag is the per-question key material: it must never be sent to a
    /// participant before their result is delivered.
    pub correct: bool,
}

/// An automatically evaluated question of a quiz exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    /// Primary key of the question.
    pub id: i64,
    /// Short title shown above the question.
    pub title: String,
    /// Maximum achievable points for this question.
    pub points: f64,
    /// Selectable options including their solution flags.
    pub answer_options: Vec<AnswerOption>,
}

impl QuizQuestion {
    /// Copy carrying only the identifier, used when embedding a question
    /// reference into client-facing payloads.
    pub fn id_only(&self) -> Self {
        Self {
            id: self.id,
            title: String::new(),
            points: 0.0,
            answer_options: Vec::new(),
        }
    }

    fn correct_option_ids(&self) -> Vec<i64> {
        self.answer_options
            .iter()
            .filter(|option| option.correct)
            .map(|option| option.id)
            .collect()
    }
}

/// A timed quiz exercise definition including batches and questions.
///
/// Instances act as immutable-per-version snapshots: the live layers never
/// mutate an exercise, they replace the whole snapshot on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizExercise {
    /// Primary key of the exercise.
    pub id: i64,
    /// Display title of the quiz.
    pub title: String,
    /// Owning course, when the quiz belongs to a course (not an exam).
    pub course_id: Option<i64>,
    /// Admission mode for participants.
    pub mode: QuizMode,
    /// Working time per attempt in seconds.
    pub duration_secs: i64,
    /// Hard deadline after which no submission is accepted.
    pub due_date: Option<OffsetDateTime>,
    /// Start/end windows participants can join.
    pub batches: Vec<QuizBatch>,
    /// Questions with their solutions; only present on detailed snapshots.
    pub questions: Vec<QuizQuestion>,
}

impl QuizExercise {
    /// Whether the quiz is over at `now`: the due date has passed, or in
    /// synchronized mode the single shared batch has run out of working time.
    pub fn has_ended(&self, now: OffsetDateTime) -> bool {
        if self.due_date.is_some_and(|due| due <= now) {
            return true;
        }
        match self.mode {
            QuizMode::Synchronized => self
                .batches
                .first()
                .is_some_and(|batch| batch.has_ended(now, self.duration_secs)),
            QuizMode::Batched | QuizMode::Individual => false,
        }
    }

    /// Look up a batch of this exercise by id.
    pub fn batch(&self, batch_id: i64) -> Option<&QuizBatch> {
        self.batches.iter().find(|batch| batch.id == batch_id)
    }

    /// The single shared batch of a synchronized quiz, if any.
    pub fn synchronized_batch(&self) -> Option<&QuizBatch> {
        match self.mode {
            QuizMode::Synchronized => self.batches.first(),
            QuizMode::Batched | QuizMode::Individual => None,
        }
    }

    /// Sum of achievable points over all questions.
    pub fn max_points(&self) -> f64 {
        self.questions.iter().map(|question| question.points).sum()
    }
}

/// How a submission reached its final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    /// The participant pressed submit themselves.
    Manual,
    /// The window closed and the server force-submitted the attempt.
    Timeout,
}

/// A participant's answer to one question of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedAnswer {
    /// Question this answer belongs to.
    pub question_id: i64,
    /// Question snapshot attached during scoring; trimmed to an id-only stub
    /// before any client delivery.
    pub question: Option<QuizQuestion>,
    /// Options the participant selected.
    pub selected_option_ids: Vec<i64>,
    /// Points awarded during scoring.
    pub score: Option<f64>,
}

/// A participant's in-progress or final set of answers for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuizSubmission {
    /// Whether the participant (or the timeout path) finalized the attempt.
    pub submitted: bool,
    /// Final-state discriminator, set when the submission is drained.
    pub kind: Option<SubmissionKind>,
    /// When the attempt was finalized.
    pub submission_date: Option<OffsetDateTime>,
    /// Batch the attempt belongs to, recorded during the drain.
    pub batch_id: Option<i64>,
    /// Answers given so far.
    pub answers: Vec<SubmittedAnswer>,
    /// Total achieved points, set by [`QuizSubmission::score_against`].
    pub score: Option<f64>,
}

impl QuizSubmission {
    /// Score every answer against the exercise definition, all-or-nothing per
    /// question, and return the achieved total.
    ///
    /// Attaches the full question snapshot to each scored answer so the
    /// result payload is self-contained; the delivery path trims it again.
    pub fn score_against(&mut self, exercise: &QuizExercise) -> f64 {
        let mut total = 0.0;
        for answer in &mut self.answers {
            let Some(question) = exercise
                .questions
                .iter()
                .find(|question| question.id == answer.question_id)
            else {
                answer.score = Some(0.0);
                continue;
            };
            let mut selected = answer.selected_option_ids.clone();
            selected.sort_unstable();
            let mut correct = question.correct_option_ids();
            correct.sort_unstable();
            let points = if selected == correct {
                question.points
            } else {
                0.0
            };
            answer.score = Some(points);
            answer.question = Some(question.clone());
            total += points;
        }
        self.score = Some(total);
        total
    }
}

/// A registered user able to take part in quiz exercises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Primary key of the user.
    pub id: i64,
    /// Unique login used to address the user on the notification channel.
    pub login: String,
    /// Human readable name.
    pub display_name: String,
}

/// Lifecycle state of a participation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationState {
    /// The attempt has been set up but not finished.
    Initialized,
    /// The attempt is complete and scored.
    Finished,
}

/// Scored outcome of evaluating a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizResult {
    /// Identifier assigned at evaluation time.
    pub id: Uuid,
    /// Achieved score as a percentage of the achievable points.
    pub score_percent: f64,
    /// Whether the result counts towards the participant's grade.
    pub rated: bool,
    /// When the underlying submission was finalized.
    pub completion_date: Option<OffsetDateTime>,
    /// The evaluated submission.
    pub submission: Option<QuizSubmission>,
}

impl QuizResult {
    /// Build a rated result from an already scored submission.
    pub fn evaluate(submission: QuizSubmission, max_points: f64) -> Self {
        let achieved = submission.score.unwrap_or(0.0);
        let score_percent = if max_points > 0.0 {
            (achieved / max_points * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            id: Uuid::new_v4(),
            score_percent,
            rated: true,
            completion_date: submission.submission_date,
            submission: Some(submission),
        }
    }
}

/// Durable record linking a participant, an exercise, and their scored attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentParticipation {
    /// Identifier assigned when the participation is built during the drain.
    pub id: Uuid,
    /// Exercise the participation belongs to.
    pub exercise_id: i64,
    /// Detailed exercise snapshot attached for client delivery.
    pub exercise: Option<QuizExercise>,
    /// The participating user; `None` when the login could not be resolved.
    pub participant: Option<Participant>,
    /// Lifecycle state.
    pub state: ParticipationState,
    /// When the attempt was initialized.
    pub initialization_date: Option<OffsetDateTime>,
    /// The finalized submission.
    pub submission: Option<QuizSubmission>,
    /// The evaluated result.
    pub result: Option<QuizResult>,
}

impl StudentParticipation {
    /// Login of the owning participant, when one is attached.
    pub fn participant_login(&self) -> Option<&str> {
        self.participant
            .as_ref()
            .map(|participant| participant.login.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_with_question() -> QuizExercise {
        QuizExercise {
            id: 7,
            title: "Sorting algorithms".into(),
            course_id: Some(1),
            mode: QuizMode::Synchronized,
            duration_secs: 600,
            due_date: None,
            batches: vec![QuizBatch {
                id: 1,
                start_time: Some(OffsetDateTime::from_unix_timestamp(1_000).unwrap()),
            }],
            questions: vec![QuizQuestion {
                id: 11,
                title: "Pick the stable sorts".into(),
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

    #[test]
    fn batch_end_is_start_plus_duration() {
        let batch = QuizBatch {
            id: 1,
            start_time: Some(OffsetDateTime::from_unix_timestamp(1_000).unwrap()),
        };
        let before = OffsetDateTime::from_unix_timestamp(1_599).unwrap();
        let after = OffsetDateTime::from_unix_timestamp(1_600).unwrap();
        assert!(!batch.has_ended(before, 600));
        assert!(batch.has_ended(after, 600));
    }

    #[test]
    fn unplanned_batch_never_starts_or_ends() {
        let batch = QuizBatch {
            id: 1,
            start_time: None,
        };
        let now = OffsetDateTime::from_unix_timestamp(5_000).unwrap();
        assert!(!batch.is_started(now));
        assert!(!batch.has_ended(now, 60));
    }

    #[test]
    fn synchronized_exercise_ends_with_its_batch() {
        let exercise = exercise_with_question();
        let running = OffsetDateTime::from_unix_timestamp(1_300).unwrap();
        let over = OffsetDateTime::from_unix_timestamp(1_700).unwrap();
        assert!(!exercise.has_ended(running));
        assert!(exercise.has_ended(over));
    }

    #[test]
    fn due_date_ends_any_mode() {
        let mut exercise = exercise_with_question();
        exercise.mode = QuizMode::Individual;
        exercise.due_date = Some(OffsetDateTime::from_unix_timestamp(2_000).unwrap());
        let now = OffsetDateTime::from_unix_timestamp(2_001).unwrap();
        assert!(exercise.has_ended(now));
    }

    #[test]
    fn scoring_is_all_or_nothing_per_question() {
        let exercise = exercise_with_question();

        let mut exact = QuizSubmission {
            answers: vec![SubmittedAnswer {
                question_id: 11,
                question: None,
                selected_option_ids: vec![1],
                score: None,
            }],
            ..QuizSubmission::default()
        };
        assert_eq!(exact.score_against(&exercise), 4.0);
        assert_eq!(exact.answers[0].score, Some(4.0));
        assert!(exact.answers[0].question.is_some());

        let mut partial = QuizSubmission {
            answers: vec![SubmittedAnswer {
                question_id: 11,
                question: None,
                selected_option_ids: vec![1, 2],
                score: None,
            }],
            ..QuizSubmission::default()
        };
        assert_eq!(partial.score_against(&exercise), 0.0);
    }

    #[test]
    fn answer_to_unknown_question_scores_zero() {
        let exercise = exercise_with_question();
        let mut submission = QuizSubmission {
            answers: vec![SubmittedAnswer {
                question_id: 999,
                question: None,
                selected_option_ids: vec![1],
                score: None,
            }],
            ..QuizSubmission::default()
        };
        assert_eq!(submission.score_against(&exercise), 0.0);
    }

    #[test]
    fn result_score_is_a_percentage() {
        let exercise = exercise_with_question();
        let mut submission = QuizSubmission {
            submitted: true,
            answers: vec![SubmittedAnswer {
                question_id: 11,
                question: None,
                selected_option_ids: vec![1],
                score: None,
            }],
            ..QuizSubmission::default()
        };
        submission.score_against(&exercise);
        let result = QuizResult::evaluate(submission, exercise.max_points());
        assert_eq!(result.score_percent, 100.0);
        assert!(result.rated);
    }
}
