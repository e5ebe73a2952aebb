use crate::{
    exercise::PracticeRound,
    schema::{GeneratedFeedback, Mistake},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub exercise_id: Uuid,
    pub prompt: String,
    pub student_answer: String,
    pub corrected_answer: String,
    pub explanation: String,
}

/// Result summary shown after a practice round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundFeedback {
    pub score: usize,
    pub total: usize,
    pub comment_vi: String,
    /// The model's own remark about the round, when it produced one.
    pub tutor_note: Option<String>,
    pub corrections: Vec<Correction>,
}

impl RoundFeedback {
    /// Scores `round` locally. Score, total and corrections always come from
    /// the recorded results; the model only contributes the note and
    /// per-mistake explanations, matched by prompt.
    pub fn compose(round: &PracticeRound, generated: Option<GeneratedFeedback>) -> Self {
        let score = round.correct_count();
        let total = round.exercises().len();
        let (tutor_note, explanations) = match generated {
            Some(g) => {
                let note = Some(g.comment_vi.trim().to_string()).filter(|c| !c.is_empty());
                (note, g.corrections)
            }
            None => (None, Vec::new()),
        };

        let corrections = round
            .results()
            .iter()
            .filter(|r| !r.is_correct)
            .filter_map(|r| {
                let exercise = round.exercise(r.exercise_id)?;
                let explanation = explanations
                    .iter()
                    .find(|c| c.prompt.trim() == exercise.prompt.trim())
                    .map(|c| c.explanation.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| {
                        format!("Câu trả lời đúng là \"{}\".", exercise.correct_answer)
                    });
                Some(Correction {
                    exercise_id: exercise.id,
                    prompt: exercise.prompt.clone(),
                    student_answer: r.answer.clone(),
                    corrected_answer: exercise.correct_answer.clone(),
                    explanation,
                })
            })
            .collect();

        Self {
            score,
            total,
            comment_vi: tier_comment(score, total),
            tutor_note,
            corrections,
        }
    }

    pub fn is_perfect(&self) -> bool {
        self.score == self.total
    }
}

/// Comment for a score: all correct, at least half, or below half.
pub fn tier_comment(score: usize, total: usize) -> String {
    if score == total {
        "Xuất sắc! Bạn trả lời đúng tất cả câu hỏi! 🎉".to_string()
    } else if score >= total / 2 {
        format!("Tốt lắm! Bạn trả lời đúng {score}/{total} câu. Tiếp tục luyện tập nhé! 💪")
    } else {
        format!("Cố lên! Bạn trả lời đúng {score}/{total} câu. Hãy ôn lại và thử lần nữa! 📖")
    }
}

/// Wrong answers of `round`, in answer order, as reported to the model.
pub fn mistakes(round: &PracticeRound) -> Vec<Mistake> {
    round
        .results()
        .iter()
        .filter(|r| !r.is_correct)
        .filter_map(|r| {
            round.exercise(r.exercise_id).map(|e| Mistake {
                prompt: e.prompt.clone(),
                answer: r.answer.clone(),
                correct_answer: e.correct_answer.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuickReplyAction {
    NewTopic,
    AddMoreWords,
    FreeChat,
    TryAgain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub label_vi: String,
    pub action: QuickReplyAction,
}

impl QuickReply {
    fn new(label_vi: &str, action: QuickReplyAction) -> Self {
        Self {
            label_vi: label_vi.to_string(),
            action,
        }
    }

    /// Replies offered after `feedback`. Retrying is only offered when
    /// something was missed.
    pub fn after_feedback(feedback: &RoundFeedback) -> Vec<QuickReply> {
        let mut replies = vec![
            QuickReply::new("Chủ đề mới", QuickReplyAction::NewTopic),
            QuickReply::new("Thêm từ mới", QuickReplyAction::AddMoreWords),
            QuickReply::new("Hỏi tự do", QuickReplyAction::FreeChat),
        ];
        if !feedback.is_perfect() {
            replies.insert(0, QuickReply::new("Làm lại", QuickReplyAction::TryAgain));
        }
        replies
    }
}
