//! Q&A counters fold, guarded per question like reviews.

use super::{RecalcError, StaleReason, Step, older_than};
use crate::product::{QaCounters, QuestionMark};

/// Apply `question.created`.
pub fn apply_question_created(qa: &mut QaCounters, question_id: &str, sequence: u64) -> Step {
    if let Some(mark) = qa.questions.get(question_id) {
        if let Some(stale) = older_than(Some(mark.sequence), sequence) {
            return stale;
        }
        if !mark.removed {
            return Step::Stale(StaleReason::AlreadyReflected);
        }
    }

    qa.total_questions += 1;
    qa.questions.insert(
        question_id.to_string(),
        QuestionMark {
            answered: false,
            sequence,
            removed: false,
            removed_at: None,
        },
    );
    finish(qa, sequence);
    Step::Changed
}

/// Apply `answer.created`.
///
/// Only the first answer counts. An answer for an unknown question registers
/// the question as answered.
pub fn apply_answer_created(qa: &mut QaCounters, question_id: &str, sequence: u64) -> Step {
    match qa.questions.get(question_id).copied() {
        Some(mark) => {
            if let Some(stale) = older_than(Some(mark.sequence), sequence) {
                return stale;
            }
            if mark.removed {
                return Step::Stale(StaleReason::Superseded);
            }
            if mark.answered {
                return Step::Stale(StaleReason::AlreadyReflected);
            }
            qa.answered_questions += 1;
            qa.questions.insert(
                question_id.to_string(),
                QuestionMark {
                    answered: true,
                    sequence,
                    ..mark
                },
            );
        }
        None => {
            qa.total_questions += 1;
            qa.answered_questions += 1;
            qa.questions.insert(
                question_id.to_string(),
                QuestionMark {
                    answered: true,
                    sequence,
                    removed: false,
                    removed_at: None,
                },
            );
        }
    }
    finish(qa, sequence);
    Step::Changed
}

/// Apply `question.deleted`.
///
/// # Errors
///
/// Returns [`RecalcError::InvariantViolation`] if a counter would underflow.
pub fn apply_question_deleted(
    qa: &mut QaCounters,
    question_id: &str,
    had_answer: bool,
    sequence: u64,
) -> Result<Step, RecalcError> {
    match qa.questions.get(question_id).copied() {
        Some(mark) => {
            if let Some(stale) = older_than(Some(mark.sequence), sequence) {
                return Ok(stale);
            }
            if mark.removed {
                return Ok(Step::Stale(StaleReason::AlreadyReflected));
            }
            qa.total_questions = decrement(qa.total_questions, "totalQuestions")?;
            if mark.answered {
                qa.answered_questions = decrement(qa.answered_questions, "answeredQuestions")?;
            }
            qa.questions.insert(
                question_id.to_string(),
                QuestionMark {
                    sequence,
                    removed: true,
                    removed_at: None,
                    ..mark
                },
            );
        }
        None => {
            qa.questions.insert(
                question_id.to_string(),
                QuestionMark {
                    answered: had_answer,
                    sequence,
                    removed: true,
                    removed_at: None,
                },
            );
        }
    }
    finish(qa, sequence);
    Ok(Step::Changed)
}

fn decrement(value: u64, field: &str) -> Result<u64, RecalcError> {
    value
        .checked_sub(1)
        .ok_or_else(|| RecalcError::InvariantViolation(format!("{field} would go negative")))
}

fn finish(qa: &mut QaCounters, sequence: u64) {
    qa.last_applied_event_seq = Some(qa.last_applied_event_seq.map_or(sequence, |s| s.max(sequence)));
}
