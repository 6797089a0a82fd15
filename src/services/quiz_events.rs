use serde::Serialize;
use tracing::warn;

use crate::dao::models::{QuizBatch, QuizExercise, StudentParticipation};
use crate::services::messaging::ClientGateway;

#[derive(Serialize)]
struct QuizStartPayload<'a> {
    exercise: &'a QuizExercise,
    batch: &'a QuizBatch,
}

/// Topic on which a participant receives their finished participation.
pub fn participation_topic(exercise_id: i64) -> String {
    format!("/topic/exercise/{exercise_id}/participation")
}

/// Topic announcing that a quiz has started.
pub fn start_topic(exercise_id: i64) -> String {
    format!("/topic/exercise/{exercise_id}/start-now")
}

/// Announce a started quiz to every subscribed client.
///
/// The broadcast goes out before any result exists, so the question solutions
/// are stripped from the snapshot first.
pub fn send_exercise_start(
    gateway: &dyn ClientGateway,
    exercise: &QuizExercise,
    batch: &QuizBatch,
) {
    let mut visible = exercise.clone();
    for question in &mut visible.questions {
        for option in &mut question.answer_options {
            option.correct = false;
        }
    }
    match serde_json::to_value(QuizStartPayload {
        exercise: &visible,
        batch,
    }) {
        Ok(payload) => gateway.broadcast(&start_topic(exercise.id), payload),
        Err(err) => warn!(
            exercise_id = exercise.id,
            error = %err,
            "failed to serialize quiz start payload"
        ),
    }
}

/// Deliver a finished participation to its owning participant.
///
/// The payload is trimmed first: the course reference, the duplicate raw
/// submission, the participant identity, and the question material embedded
/// in scored answers are not the participant's to see.
pub fn send_result_to_participant(
    gateway: &dyn ClientGateway,
    exercise_id: i64,
    login: &str,
    participation: &StudentParticipation,
) {
    let visible = strip_for_delivery(participation.clone());
    match serde_json::to_value(&visible) {
        Ok(payload) => gateway.deliver_to_participant(login, &participation_topic(exercise_id), payload),
        Err(err) => warn!(
            exercise_id,
            login,
            error = %err,
            "failed to serialize participation payload"
        ),
    }
}

fn strip_for_delivery(mut participation: StudentParticipation) -> StudentParticipation {
    if let Some(exercise) = participation.exercise.as_mut() {
        exercise.course_id = None;
    }
    // The submission travels inside the result; the copy on the
    // participation itself would double the payload.
    participation.submission = None;
    participation.participant = None;
    if let Some(result) = participation.result.as_mut()
        && let Some(submission) = result.submission.as_mut()
    {
        for answer in &mut submission.answers {
            answer.question = answer.question.as_ref().map(|question| question.id_only());
        }
    }
    participation
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;
    use crate::dao::models::{
        AnswerOption, Participant, ParticipationState, QuizMode, QuizQuestion, QuizResult,
        QuizSubmission, SubmittedAnswer,
    };

    fn exercise() -> QuizExercise {
        QuizExercise {
            id: 7,
            title: "quiz".into(),
            course_id: Some(42),
            mode: QuizMode::Synchronized,
            duration_secs: 60,
            due_date: None,
            batches: vec![QuizBatch {
                id: 1,
                start_time: Some(OffsetDateTime::from_unix_timestamp(1_000).unwrap()),
            }],
            questions: vec![QuizQuestion {
                id: 11,
                title: "q".into(),
                points: 1.0,
                answer_options: vec![AnswerOption {
                    id: 1,
                    text: "a".into(),
                    correct: true,
                }],
            }],
        }
    }

    fn scored_participation() -> StudentParticipation {
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
        let exercise = exercise();
        submission.score_against(&exercise);
        let result = QuizResult::evaluate(submission.clone(), exercise.max_points());
        StudentParticipation {
            id: Uuid::new_v4(),
            exercise_id: 7,
            exercise: Some(exercise),
            participant: Some(Participant {
                id: 1,
                login: "u1".into(),
                display_name: "U One".into(),
            }),
            state: ParticipationState::Finished,
            initialization_date: None,
            submission: Some(submission),
            result: Some(result),
        }
    }

    #[test]
    fn delivery_copy_is_stripped() {
        let stripped = strip_for_delivery(scored_participation());

        assert!(stripped.participant.is_none());
        assert!(stripped.submission.is_none());
        assert_eq!(stripped.exercise.as_ref().unwrap().course_id, None);

        let answers = &stripped.result.unwrap().submission.unwrap().answers;
        let question = answers[0].question.as_ref().unwrap();
        assert_eq!(question.id, 11);
        assert!(question.answer_options.is_empty());
    }

    #[test]
    fn start_payload_hides_solutions() {
        let exercise = exercise();
        let batch = QuizBatch {
            id: 1,
            start_time: Some(OffsetDateTime::from_unix_timestamp(2_000).unwrap()),
        };

        let gateway = crate::services::messaging::BroadcastGateway::new(4);
        let mut updates = gateway.subscribe();
        send_exercise_start(&gateway, &exercise, &batch);

        let message = updates.try_recv().expect("start broadcast");
        assert_eq!(message.topic, start_topic(7));
        let correct = &message.payload["exercise"]["questions"][0]["answer_options"][0]["correct"];
        assert_eq!(correct, &serde_json::Value::Bool(false));
    }
}
