//! Deterministic Stub Model
//!
//! A `LanguageModel` that answers from canned Vietnamese content. It is used
//! when no real provider is configured and by the tests, and can simulate an
//! unavailable model, slow streaming, a small context window and one-shot
//! request failures.

use crate::{
    error::ServiceError,
    exercise::FILLER_OPTION,
    feedback::tier_comment,
    llm_client::{Availability, GenerationOptions, LanguageModel, TextStream, UnavailableReason},
    schema::{
        FeedbackRequest, FlashcardRequest, GeneratedCorrection, GeneratedExercise,
        GeneratedFeedback, GeneratedFlashcard, GeneratedPracticeRound, GeneratedWord,
        GenerationRequest, MAX_SELECTED_WORDS, PracticeRoundRequest, WordSet, WordSetRequest,
    },
    transcript::Transcript,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAMED_REPLY: &str = "Đây là phản hồi mô phỏng. Hãy cấu hình một nhà cung cấp mô hình thật để trò chuyện với gia sư.";

pub struct StubLanguageModel {
    availability: Availability,
    chunk_delay: Duration,
    latency: Duration,
    context_limit: Option<usize>,
    failures: Mutex<Vec<String>>,
    requests: AtomicUsize,
}

impl Default for StubLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

impl StubLanguageModel {
    pub fn new() -> Self {
        Self {
            availability: Availability::Available,
            chunk_delay: Duration::ZERO,
            latency: Duration::ZERO,
            context_limit: None,
            failures: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
        }
    }

    /// A stub that reports itself unavailable for `reason`.
    pub fn unavailable(reason: UnavailableReason) -> Self {
        Self {
            availability: Availability::Unavailable(reason),
            ..Self::new()
        }
    }

    /// Pause between streamed chunks and before every structured response.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Pause before a call is admitted or rejected, so concurrent calls all
    /// see the transcript they were started with.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Rejects any call whose transcript plus prompt would exceed
    /// `max_entries` entries.
    pub fn with_context_limit(mut self, max_entries: usize) -> Self {
        self.context_limit = Some(max_entries);
        self
    }

    /// Makes the next request for `schema_name` fail once. Use `"text"` for
    /// streamed replies.
    pub fn fail_next(&self, schema_name: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(schema_name.to_string());
        }
    }

    /// Number of requests that reached the stub, failed ones included.
    pub fn requests_served(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn admit(&self, transcript: &Transcript, call: &str) -> Result<(), ServiceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.availability.reason() {
            return Err(ServiceError::Unavailable(reason));
        }
        if let Ok(mut failures) = self.failures.lock() {
            if let Some(pos) = failures.iter().position(|f| f == call) {
                failures.remove(pos);
                return Err(ServiceError::Request(format!("injected failure for {call}")));
            }
        }
        if let Some(limit) = self.context_limit {
            if transcript.len() + 1 > limit {
                return Err(ServiceError::ContextWindowExceeded);
            }
        }
        Ok(())
    }

    fn chunks(text: &str) -> Vec<String> {
        text.split(' ')
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {word}") })
            .collect()
    }
}

#[async_trait]
impl LanguageModel for StubLanguageModel {
    async fn availability(&self) -> Availability {
        self.availability.clone()
    }

    async fn stream_response(
        &self,
        transcript: &Transcript,
        _prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<TextStream, ServiceError> {
        self.admit(transcript, "text").await?;

        let (tx, rx) = mpsc::channel(8);
        let delay = self.chunk_delay;
        tokio::spawn(async move {
            for chunk in Self::chunks(STREAMED_REPLY) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    // Receiver dropped: the caller cancelled.
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn respond(
        &self,
        transcript: &Transcript,
        request: &GenerationRequest,
        _options: &GenerationOptions,
    ) -> Result<Value, ServiceError> {
        self.admit(transcript, request.schema_name()).await?;
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        let value = match request {
            GenerationRequest::WordSet(req) => serde_json::to_value(word_set(req)),
            GenerationRequest::Flashcard(req) => serde_json::to_value(flashcard(req)),
            GenerationRequest::PracticeRound(req) => serde_json::to_value(practice_round(req)),
            GenerationRequest::Feedback(req) => serde_json::to_value(feedback(req)),
        };
        value.map_err(|e| ServiceError::Decode(e.to_string()))
    }

    fn model_id(&self) -> &str {
        "stub"
    }
}

fn word_set(request: &WordSetRequest) -> WordSet {
    let rows: &[(&str, &str, &str, &str)] = match request.topic.label_en.as_str() {
        "Food" => &[
            ("delicious", "ngon", "adjective", "This soup is delicious."),
            ("hungry", "đói", "adjective", "I am very hungry."),
            ("cook", "nấu ăn", "verb", "She loves to cook dinner."),
            ("recipe", "công thức", "noun", "Can you share the recipe?"),
            ("ingredient", "nguyên liệu", "noun", "Fresh ingredients make better food."),
            ("spicy", "cay", "adjective", "This dish is too spicy for me."),
            ("taste", "mùi vị", "noun", "The taste is wonderful."),
            ("meal", "bữa ăn", "noun", "We enjoy every meal together."),
            ("restaurant", "nhà hàng", "noun", "Let's go to a restaurant tonight."),
            ("dessert", "món tráng miệng", "noun", "I always want dessert after dinner."),
        ],
        "Travel" => &[
            ("journey", "chuyến đi", "noun", "Our journey was amazing."),
            ("passport", "hộ chiếu", "noun", "Don't forget your passport!"),
            ("luggage", "hành lý", "noun", "My luggage is very heavy."),
            ("departure", "khởi hành", "noun", "The departure is at 8 AM."),
            ("arrival", "đến nơi", "noun", "Our arrival time is 3 PM."),
            ("destination", "điểm đến", "noun", "Paris is our destination."),
            ("explore", "khám phá", "verb", "We love to explore new cities."),
            ("souvenir", "quà lưu niệm", "noun", "I bought a souvenir for my mom."),
            ("hotel", "khách sạn", "noun", "The hotel is near the beach."),
            ("ticket", "vé", "noun", "I need two tickets please."),
        ],
        _ => &[
            ("hello", "xin chào", "interjection", "Hello, how are you?"),
            ("thank you", "cảm ơn", "phrase", "Thank you for your help."),
            ("please", "xin", "adverb", "Please pass the salt."),
            ("sorry", "xin lỗi", "interjection", "I am sorry for being late."),
            ("understand", "hiểu", "verb", "I understand the lesson."),
            ("practice", "luyện tập", "verb", "We practice every day."),
            ("learn", "học", "verb", "She learns English quickly."),
            ("speak", "nói", "verb", "Can you speak more slowly?"),
            ("repeat", "nhắc lại", "verb", "Please repeat that word."),
            ("correct", "đúng", "adjective", "Your answer is correct!"),
        ],
    };
    WordSet {
        words: rows
            .iter()
            .map(|(english, vietnamese, pos, example)| GeneratedWord {
                english: english.to_string(),
                vietnamese: vietnamese.to_string(),
                part_of_speech: pos.to_string(),
                example_sentence: example.to_string(),
            })
            .collect(),
    }
}

fn flashcard(request: &FlashcardRequest) -> GeneratedFlashcard {
    let word = &request.word;
    GeneratedFlashcard {
        mnemonic_vi: format!(
            "Nhớ từ \"{}\" giống như \"{}\", hãy tưởng tượng hình ảnh!",
            word.english, word.vietnamese
        ),
        example_en: word.example_sentence.clone(),
        example_vi: format!("Câu ví dụ bằng tiếng Việt cho \"{}\".", word.vietnamese),
        phonetic_vi: String::new(),
        phonetic_en: String::new(),
    }
}

/// One multiple-choice and one translation exercise per word.
fn practice_round(request: &PracticeRoundRequest) -> GeneratedPracticeRound {
    let words: Vec<_> = request.words.iter().take(MAX_SELECTED_WORDS).collect();
    let translations: Vec<String> = words.iter().map(|w| w.vietnamese.clone()).collect();
    let mut exercises = Vec::with_capacity(words.len() * 2);
    for word in &words {
        let mut options = vec![word.vietnamese.clone()];
        options.extend(
            translations
                .iter()
                .filter(|t| **t != word.vietnamese)
                .take(3)
                .cloned(),
        );
        while options.len() < 4 {
            options.push(FILLER_OPTION.to_string());
        }
        exercises.push(GeneratedExercise {
            kind: "multipleChoice".to_string(),
            prompt: format!("'{}' nghĩa là gì?", word.english),
            correct_answer: word.vietnamese.clone(),
            options,
        });
        exercises.push(GeneratedExercise {
            kind: "translate".to_string(),
            prompt: format!("Dịch sang tiếng Anh: \"{}\"", word.vietnamese),
            correct_answer: word.english.clone(),
            options: Vec::new(),
        });
    }
    GeneratedPracticeRound { exercises }
}

fn feedback(request: &FeedbackRequest) -> GeneratedFeedback {
    GeneratedFeedback {
        score: Some(request.score as f64),
        comment_vi: tier_comment(request.score, request.total),
        corrections: request
            .mistakes
            .iter()
            .map(|m| GeneratedCorrection {
                prompt: m.prompt.clone(),
                student_answer: m.answer.clone(),
                corrected_answer: m.correct_answer.clone(),
                explanation: format!("Câu trả lời đúng là \"{}\".", m.correct_answer),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema::Mistake, topic::Topic, vocab::WordEntry};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_word_set_by_topic() {
        let stub = StubLanguageModel::new();
        let request: GenerationRequest = WordSetRequest {
            topic: Topic::find("travel").unwrap(),
        }
        .into();
        let value = stub
            .respond(&Transcript::default(), &request, &GenerationOptions::default())
            .await
            .unwrap();
        let set: WordSet = serde_json::from_value(value).unwrap();
        assert_eq!(set.words.len(), 10);
        assert_eq!(set.words[1].english, "passport");
    }

    #[tokio::test]
    async fn test_stream_reassembles_reply() {
        let stub = StubLanguageModel::new();
        let mut stream = stub
            .stream_response(&Transcript::default(), "hi", &GenerationOptions::default())
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk.unwrap());
        }
        assert_eq!(text, STREAMED_REPLY);
    }

    #[tokio::test]
    async fn test_context_limit_and_injected_failure() {
        let stub = StubLanguageModel::new().with_context_limit(3);
        let mut transcript = Transcript::with_instructions("x");
        transcript.push_exchange("a", "b");
        let request: GenerationRequest = FeedbackRequest {
            learner_name: "Minh".into(),
            score: 1,
            total: 2,
            mistakes: vec![Mistake {
                prompt: "p".into(),
                answer: "a".into(),
                correct_answer: "c".into(),
            }],
        }
        .into();
        let err = stub
            .respond(&transcript, &request, &GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::ContextWindowExceeded);

        stub.fail_next("feedback");
        let short = Transcript::with_instructions("x");
        let err = stub
            .respond(&short, &request, &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Request(_)));
        assert!(stub
            .respond(&short, &request, &GenerationOptions::default())
            .await
            .is_ok());
        assert_eq!(stub.requests_served(), 3);
    }

    #[test]
    fn test_practice_round_two_per_word() {
        let words = vec![
            WordEntry::new("hotel", "khách sạn", "noun", "The hotel is near the beach."),
            WordEntry::new("ticket", "vé", "noun", "I need two tickets please."),
        ];
        let round = practice_round(&PracticeRoundRequest { words });
        assert_eq!(round.exercises.len(), 4);
        assert_eq!(round.exercises[0].options.len(), 4);
        assert!(round.exercises[0].options.contains(&FILLER_OPTION.to_string()));
        assert_eq!(round.exercises[3].correct_answer, "ticket");
    }
}
