//! Structured Generation Requests
//!
//! Every structured call the tutor makes is an explicit request type paired
//! with the response type the model must produce. Backends receive the tagged
//! [`GenerationRequest`]; remote backends send its prompt together with the
//! JSON schema of the response, the stub backend answers from the typed
//! payload directly.

use crate::{topic::Topic, vocab::WordEntry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Number of words requested per vocabulary batch.
pub const WORDS_PER_BATCH: usize = 10;
/// Exercises generated for each selected word.
pub const EXERCISES_PER_WORD: usize = 2;
/// Upper bound on selected words, and so on words drilled per round.
pub const MAX_SELECTED_WORDS: usize = 3;

// --- Response types ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WordSet {
    #[schemars(description = "10 English vocabulary words for the topic")]
    pub words: Vec<GeneratedWord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedWord {
    #[schemars(description = "English word")]
    pub english: String,
    #[schemars(description = "Vietnamese translation")]
    pub vietnamese: String,
    #[schemars(description = "Part of speech: noun, verb, adjective, adverb, or phrase")]
    pub part_of_speech: String,
    #[schemars(description = "Short example sentence using the word (A1-A2 level)")]
    pub example_sentence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedFlashcard {
    #[schemars(description = "Mnemonic hint in Vietnamese to help remember the word")]
    pub mnemonic_vi: String,
    #[schemars(description = "Example sentence in English at A1-A2 level")]
    pub example_en: String,
    #[schemars(description = "Vietnamese translation of the example sentence")]
    pub example_vi: String,
    #[serde(default)]
    #[schemars(
        description = "Pronunciation of the English word written with Vietnamese phonemes, e.g. 'đề-li-shợs' for 'delicious'"
    )]
    pub phonetic_vi: String,
    #[serde(default)]
    #[schemars(
        description = "Plain-letter English pronunciation with UPPERCASE stressed syllables, e.g. 'deh-LIH-shus'. No IPA symbols."
    )]
    pub phonetic_en: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedPracticeRound {
    #[schemars(description = "6 exercises: 2 per selected word, mixing types")]
    pub exercises: Vec<GeneratedExercise>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedExercise {
    #[serde(rename = "type")]
    #[schemars(description = "Exercise type: 'fillBlank', 'multipleChoice' or 'translate'")]
    pub kind: String,
    #[schemars(description = "Exercise prompt shown to the student in Vietnamese or English")]
    pub prompt: String,
    #[schemars(description = "The correct answer string")]
    pub correct_answer: String,
    #[serde(default)]
    #[schemars(description = "4 multiple choice options (include the correct answer)")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedFeedback {
    /// The model's own tally. Informational only, the score shown to the
    /// learner is counted locally.
    #[serde(default)]
    #[schemars(description = "Number of correct answers out of total")]
    pub score: Option<f64>,
    #[schemars(description = "Encouraging or corrective comment in Vietnamese")]
    pub comment_vi: String,
    #[serde(default)]
    #[schemars(description = "Corrections for each wrong answer, empty if all correct")]
    pub corrections: Vec<GeneratedCorrection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedCorrection {
    #[schemars(description = "The exercise prompt that was answered wrong")]
    pub prompt: String,
    #[schemars(description = "What the student answered")]
    pub student_answer: String,
    #[schemars(description = "The correct answer")]
    pub corrected_answer: String,
    #[schemars(description = "Brief explanation in Vietnamese")]
    pub explanation: String,
}

// --- Requests ---

#[derive(Debug, Clone, PartialEq)]
pub struct WordSetRequest {
    pub topic: Topic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlashcardRequest {
    pub word: WordEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PracticeRoundRequest {
    pub words: Vec<WordEntry>,
}

/// One wrong answer reported to the model when asking for feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct Mistake {
    pub prompt: String,
    pub answer: String,
    pub correct_answer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRequest {
    pub learner_name: String,
    pub score: usize,
    pub total: usize,
    pub mistakes: Vec<Mistake>,
}

/// A structured request as seen by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationRequest {
    WordSet(WordSetRequest),
    Flashcard(FlashcardRequest),
    PracticeRound(PracticeRoundRequest),
    Feedback(FeedbackRequest),
}

impl GenerationRequest {
    /// Name of the response schema, used as the response format name.
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::WordSet(_) => "word_set",
            Self::Flashcard(_) => "flashcard",
            Self::PracticeRound(_) => "practice_round",
            Self::Feedback(_) => "feedback",
        }
    }

    /// JSON schema the response must satisfy.
    pub fn response_schema(&self) -> Value {
        match self {
            Self::WordSet(_) => schemars::schema_for!(WordSet).to_value(),
            Self::Flashcard(_) => schemars::schema_for!(GeneratedFlashcard).to_value(),
            Self::PracticeRound(_) => schemars::schema_for!(GeneratedPracticeRound).to_value(),
            Self::Feedback(_) => schemars::schema_for!(GeneratedFeedback).to_value(),
        }
    }

    /// Prompt sent to the tutor session.
    pub fn prompt(&self) -> String {
        match self {
            Self::WordSet(req) => format!(
                "Hãy tạo {} từ vựng tiếng Anh về chủ đề '{}' phù hợp với trình độ A1–A2.",
                WORDS_PER_BATCH, req.topic.label_en
            ),
            Self::Flashcard(req) => format!(
                "Tạo thẻ học cho từ '{}' (nghĩa tiếng Việt: {}).",
                req.word.english, req.word.vietnamese
            ),
            Self::PracticeRound(req) => {
                let word_list = req
                    .words
                    .iter()
                    .map(|w| format!("{} ({})", w.english, w.vietnamese))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Tạo {} bài tập ({} cho mỗi từ) để luyện tập: {}. Trộn các loại: fillBlank, multipleChoice, translate.",
                    req.words.len() * EXERCISES_PER_WORD,
                    EXERCISES_PER_WORD,
                    word_list
                )
            }
            Self::Feedback(req) => {
                let wrong = if req.mistakes.is_empty() {
                    "không có".to_string()
                } else {
                    req.mistakes
                        .iter()
                        .map(|m| {
                            format!(
                                "Câu '{}': học viên trả lời '{}', đáp án đúng '{}'",
                                m.prompt, m.answer, m.correct_answer
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                };
                format!(
                    "Học viên {} đạt {}/{} điểm. Sai: {}. Đưa ra nhận xét và sửa lỗi.",
                    req.learner_name, req.score, req.total, wrong
                )
            }
        }
    }
}

/// Ties a request type to the response type the model must produce.
pub trait StructuredRequest: Into<GenerationRequest> + Send {
    type Response: DeserializeOwned + JsonSchema + Send + 'static;
}

macro_rules! structured_request {
    ($request:ident => $variant:ident, $response:ty) => {
        impl From<$request> for GenerationRequest {
            fn from(request: $request) -> Self {
                GenerationRequest::$variant(request)
            }
        }

        impl StructuredRequest for $request {
            type Response = $response;
        }
    };
}

structured_request!(WordSetRequest => WordSet, WordSet);
structured_request!(FlashcardRequest => Flashcard, GeneratedFlashcard);
structured_request!(PracticeRoundRequest => PracticeRound, GeneratedPracticeRound);
structured_request!(FeedbackRequest => Feedback, GeneratedFeedback);
