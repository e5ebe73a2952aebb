//! Model Session Adapter
//!
//! Owns the general and tutor sessions, funnels every model call through an
//! availability check, and implements context-overflow recovery.
//!
//! Each session lives behind its own mutex. The lock is taken to snapshot the
//! transcript before a call and again to commit the finished exchange, never
//! across the call itself. Every reset or recovery bumps the session epoch so
//! that exchanges started against a replaced session are dropped.

use crate::{
    error::{GenerationError, ServiceError},
    exercise::{Exercise, PracticeRound, exercises_from_generated},
    feedback::{RoundFeedback, mistakes},
    llm_client::{Availability, GenerationOptions, LanguageModel},
    schema::{
        FeedbackRequest, FlashcardRequest, GenerationRequest, PracticeRoundRequest,
        StructuredRequest, WORDS_PER_BATCH, WordSetRequest,
    },
    topic::Topic,
    transcript::Transcript,
    vocab::{Flashcard, WordEntry},
};
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Instructions of a fresh general session.
pub const DEFAULT_GENERAL_INSTRUCTIONS: &str = "You are a helpful assistant.";
/// Instructions of a fresh tutor session before a learner name is known.
pub const DEFAULT_TUTOR_INSTRUCTIONS: &str = "Bạn là một gia sư tiếng Anh thân thiện dành cho người Việt ở trình độ A1–A2. Luôn trả lời bằng tiếng Việt, ngắn gọn và khích lệ.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    General,
    Tutor,
}

struct SessionSlot {
    instructions: String,
    transcript: Option<Transcript>,
    epoch: u64,
}

impl SessionSlot {
    fn new(instructions: &str) -> Self {
        Self {
            instructions: instructions.to_string(),
            transcript: None,
            epoch: 0,
        }
    }

    /// Transcript to send with the next call, starting the session if needed.
    fn snapshot(&mut self) -> (Transcript, u64) {
        let transcript = self
            .transcript
            .get_or_insert_with(|| Transcript::with_instructions(self.instructions.clone()));
        (transcript.clone(), self.epoch)
    }

    fn commit(&mut self, epoch: u64, prompt: &str, reply: &str) -> bool {
        if epoch != self.epoch {
            return false;
        }
        match self.transcript.as_mut() {
            Some(transcript) => {
                transcript.push_exchange(prompt, reply);
                true
            }
            None => false,
        }
    }

    /// Condenses the live transcript. Skipped when the session was already
    /// replaced since `epoch`.
    fn recover(&mut self, epoch: u64) -> Option<(usize, usize)> {
        if epoch != self.epoch {
            return None;
        }
        let transcript = self.transcript.as_ref()?;
        let condensed = transcript.condensed();
        let lengths = (transcript.len(), condensed.len());
        self.transcript = Some(condensed);
        self.epoch += 1;
        Some(lengths)
    }

    fn reset(&mut self) {
        self.transcript = None;
        self.epoch += 1;
    }
}

pub struct ModelSessionAdapter {
    model: Arc<dyn LanguageModel>,
    general: Mutex<SessionSlot>,
    tutor: Mutex<SessionSlot>,
}

impl ModelSessionAdapter {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            general: Mutex::new(SessionSlot::new(DEFAULT_GENERAL_INSTRUCTIONS)),
            tutor: Mutex::new(SessionSlot::new(DEFAULT_TUTOR_INSTRUCTIONS)),
        }
    }

    fn slot(&self, kind: SessionKind) -> &Mutex<SessionSlot> {
        match kind {
            SessionKind::General => &self.general,
            SessionKind::Tutor => &self.tutor,
        }
    }

    pub async fn check_availability(&self) -> Availability {
        self.model.availability().await
    }

    async fn ensure_available(&self) -> Result<(), GenerationError> {
        if self.model.availability().await.is_available() {
            Ok(())
        } else {
            Err(GenerationError::Unsupported)
        }
    }

    /// Sets the instructions a fresh `kind` session starts with. A live
    /// session keeps its instructions until it is reset.
    pub async fn set_instructions(&self, kind: SessionKind, instructions: impl Into<String>) {
        self.slot(kind).lock().await.instructions = instructions.into();
    }

    /// Drops the `kind` session; the next call starts a fresh one.
    pub async fn reset_session(&self, kind: SessionKind) {
        self.slot(kind).lock().await.reset();
        tracing::debug!(session = ?kind, "Session reset");
    }

    /// The live transcript of `kind`, or the instructions alone when the
    /// session has not started yet.
    pub async fn transcript(&self, kind: SessionKind) -> Transcript {
        let slot = self.slot(kind).lock().await;
        match &slot.transcript {
            Some(transcript) => transcript.clone(),
            None => Transcript::with_instructions(slot.instructions.clone()),
        }
    }

    /// Maps a backend failure onto the caller-facing taxonomy, recovering the
    /// session on overflow.
    async fn fail(&self, kind: SessionKind, epoch: u64, error: ServiceError) -> GenerationError {
        match error {
            ServiceError::ContextWindowExceeded => {
                match self.slot(kind).lock().await.recover(epoch) {
                    Some((before, after)) => tracing::warn!(
                        session = ?kind,
                        before,
                        after,
                        "Context window exceeded, transcript condensed"
                    ),
                    None => tracing::debug!(
                        session = ?kind,
                        "Context window exceeded on a replaced session, recovery skipped"
                    ),
                }
                GenerationError::ContextOverflow
            }
            ServiceError::Unavailable(reason) => {
                tracing::warn!(session = ?kind, %reason, "Model became unavailable");
                GenerationError::Unsupported
            }
            ServiceError::Request(reason) | ServiceError::Decode(reason) => {
                GenerationError::GenerationFailed(reason)
            }
        }
    }

    async fn commit(&self, kind: SessionKind, epoch: u64, prompt: &str, reply: &str) {
        if !self.slot(kind).lock().await.commit(epoch, prompt, reply) {
            tracing::debug!(session = ?kind, epoch, "Session replaced during call, exchange dropped");
        }
    }

    /// Streams a free-text reply. `on_partial` receives the accumulated text
    /// after every chunk. Dropping the returned future cancels the call and
    /// leaves the session untouched.
    pub async fn stream_text<F>(
        &self,
        kind: SessionKind,
        prompt: &str,
        options: &GenerationOptions,
        mut on_partial: F,
    ) -> Result<String, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        self.ensure_available().await?;
        let (transcript, epoch) = self.slot(kind).lock().await.snapshot();

        let mut stream = match self.model.stream_response(&transcript, prompt, options).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(kind, epoch, e).await),
        };

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(delta) if delta.is_empty() => {}
                Ok(delta) => {
                    text.push_str(&delta);
                    on_partial(&text);
                }
                Err(e) => return Err(self.fail(kind, epoch, e).await),
            }
        }

        self.commit(kind, epoch, prompt, &text).await;
        Ok(text)
    }

    /// Runs one structured request and decodes the typed response.
    pub async fn generate_structured<R: StructuredRequest>(
        &self,
        kind: SessionKind,
        request: R,
        options: &GenerationOptions,
    ) -> Result<R::Response, GenerationError> {
        self.ensure_available().await?;
        let request: GenerationRequest = request.into();
        let prompt = request.prompt();
        let (transcript, epoch) = self.slot(kind).lock().await.snapshot();

        let value = match self.model.respond(&transcript, &request, options).await {
            Ok(value) => value,
            Err(e) => return Err(self.fail(kind, epoch, e).await),
        };
        let reply = value.to_string();
        let response = serde_json::from_value::<R::Response>(value).map_err(|e| {
            tracing::warn!(schema = request.schema_name(), error = %e, "Malformed structured response");
            GenerationError::failed(format!("malformed {} response: {e}", request.schema_name()))
        })?;

        self.commit(kind, epoch, &prompt, &reply).await;
        Ok(response)
    }

    /// Ten words for `topic`, deduplicated. An empty batch is a failure.
    pub async fn generate_words(&self, topic: &Topic) -> Result<Vec<WordEntry>, GenerationError> {
        let request = WordSetRequest {
            topic: topic.clone(),
        };
        let set = self
            .generate_structured(SessionKind::Tutor, request, &GenerationOptions::default())
            .await?;
        let mut words = WordEntry::from_word_set(set);
        if words.is_empty() {
            return Err(GenerationError::failed("the model returned no words"));
        }
        words.truncate(WORDS_PER_BATCH);
        Ok(words)
    }

    pub async fn generate_flashcard(&self, word: &WordEntry) -> Result<Flashcard, GenerationError> {
        let request = FlashcardRequest { word: word.clone() };
        let generated = self
            .generate_structured(SessionKind::Tutor, request, &GenerationOptions::default())
            .await?;
        if generated.mnemonic_vi.trim().is_empty() {
            return Err(GenerationError::failed(format!(
                "flashcard for '{}' has no mnemonic",
                word.english
            )));
        }
        Ok(Flashcard::from_generated(word.clone(), generated))
    }

    pub async fn generate_exercises<R>(
        &self,
        words: &[WordEntry],
        rng: &mut R,
    ) -> Result<Vec<Exercise>, GenerationError>
    where
        R: Rng + Send + ?Sized,
    {
        let request = PracticeRoundRequest {
            words: words.to_vec(),
        };
        let generated = self
            .generate_structured(SessionKind::Tutor, request, &GenerationOptions::default())
            .await?;
        exercises_from_generated(generated, words, rng)
    }

    /// Feedback for a finished round. Score, total and corrections are
    /// computed locally; the model adds its remark and explanations.
    pub async fn generate_feedback(
        &self,
        round: &PracticeRound,
        learner_name: &str,
    ) -> Result<RoundFeedback, GenerationError> {
        let request = FeedbackRequest {
            learner_name: learner_name.to_string(),
            score: round.correct_count(),
            total: round.exercises().len(),
            mistakes: mistakes(round),
        };
        let generated = self
            .generate_structured(SessionKind::Tutor, request, &GenerationOptions::default())
            .await?;
        Ok(RoundFeedback::compose(round, Some(generated)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        llm_client::{MockLanguageModel, TextStream, UnavailableReason},
        stub::StubLanguageModel,
        transcript::Role,
    };
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn available(mock: &mut MockLanguageModel) {
        mock.expect_availability()
            .returning(|| Availability::Available);
    }

    fn topic() -> Topic {
        Topic::find("food").unwrap()
    }

    fn word_set_json() -> serde_json::Value {
        json!({
            "words": [
                {"english": "meal", "vietnamese": "bữa ăn", "part_of_speech": "noun", "example_sentence": "A meal."},
                {"english": "cook", "vietnamese": "nấu ăn", "part_of_speech": "verb", "example_sentence": "I cook."}
            ]
        })
    }

    #[tokio::test]
    async fn test_overflow_condenses_to_first_and_last() {
        let mut mock = MockLanguageModel::new();
        available(&mut mock);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mock.expect_respond().returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(word_set_json())
            } else {
                Err(ServiceError::ContextWindowExceeded)
            }
        });
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        for _ in 0..3 {
            adapter.generate_words(&topic()).await.unwrap();
        }
        let before = adapter.transcript(SessionKind::Tutor).await;
        assert_eq!(before.len(), 7);

        let err = adapter.generate_words(&topic()).await.unwrap_err();
        assert_eq!(err, GenerationError::ContextOverflow);

        let after = adapter.transcript(SessionKind::Tutor).await;
        assert_eq!(after.len(), 2);
        assert_eq!(after.entries()[0], before.entries()[0]);
        assert_eq!(after.entries()[1], before.entries()[6]);
        assert_eq!(after.entries()[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_unavailable_model_is_never_called() {
        let mut mock = MockLanguageModel::new();
        mock.expect_availability()
            .returning(|| Availability::Unavailable(UnavailableReason::NotEnabled));
        mock.expect_respond().never();
        mock.expect_stream_response().never();
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        assert!(!adapter.check_availability().await.is_available());
        let err = adapter.generate_words(&topic()).await.unwrap_err();
        assert_eq!(err, GenerationError::Unsupported);
        let err = adapter
            .stream_text(SessionKind::General, "hi", &GenerationOptions::default(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Unsupported);
    }

    #[tokio::test]
    async fn test_malformed_output_is_not_committed() {
        let mut mock = MockLanguageModel::new();
        available(&mut mock);
        mock.expect_respond()
            .returning(|_, _, _| Ok(json!({"unexpected": true})));
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        let err = adapter.generate_words(&topic()).await.unwrap_err();
        assert!(matches!(err, GenerationError::GenerationFailed(ref r) if r.contains("word_set")));
        assert_eq!(adapter.transcript(SessionKind::Tutor).await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_failure() {
        let mut mock = MockLanguageModel::new();
        available(&mut mock);
        mock.expect_respond()
            .returning(|_, _, _| Ok(json!({"words": []})));
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        let err = adapter.generate_words(&topic()).await.unwrap_err();
        assert!(matches!(err, GenerationError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn test_stream_reports_accumulated_text_and_commits() {
        let mut mock = MockLanguageModel::new();
        available(&mut mock);
        mock.expect_stream_response().returning(|_, _, _| {
            let chunks = vec![Ok("Xin".to_string()), Ok(" chào".to_string())];
            Ok(Box::pin(futures::stream::iter(chunks)) as TextStream)
        });
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        let mut partials = Vec::new();
        let text = adapter
            .stream_text(
                SessionKind::General,
                "hello",
                &GenerationOptions::default(),
                |partial| partials.push(partial.to_string()),
            )
            .await
            .unwrap();
        assert_eq!(text, "Xin chào");
        assert_eq!(partials, vec!["Xin", "Xin chào"]);

        let transcript = adapter.transcript(SessionKind::General).await;
        assert_eq!(transcript.entries()[0].content, DEFAULT_GENERAL_INSTRUCTIONS);
        assert_eq!(transcript.entries()[1].content, "hello");
        assert_eq!(transcript.entries()[2].content, "Xin chào");
    }

    #[tokio::test]
    async fn test_stream_error_midway_leaves_session_untouched() {
        let mut mock = MockLanguageModel::new();
        available(&mut mock);
        mock.expect_stream_response().returning(|_, _, _| {
            let chunks = vec![
                Ok("Xin".to_string()),
                Err(ServiceError::Request("connection reset".into())),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)) as TextStream)
        });
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        let err = adapter
            .stream_text(SessionKind::General, "hello", &GenerationOptions::default(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::failed("connection reset"));
        assert_eq!(adapter.transcript(SessionKind::General).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_stream_commits_nothing() {
        let stub = StubLanguageModel::new().with_chunk_delay(Duration::from_millis(20));
        let adapter = ModelSessionAdapter::new(Arc::new(stub));

        let mut partials = 0;
        let outcome = tokio::time::timeout(
            Duration::from_millis(70),
            adapter.stream_text(SessionKind::General, "hi", &GenerationOptions::default(), |_| {
                partials += 1
            }),
        )
        .await;
        assert!(outcome.is_err());
        assert!(partials > 0);
        assert_eq!(adapter.transcript(SessionKind::General).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_during_call_drops_exchange() {
        let stub = StubLanguageModel::new().with_chunk_delay(Duration::from_millis(5));
        let adapter = ModelSessionAdapter::new(Arc::new(stub));
        let options = GenerationOptions::default();

        let (result, _) = tokio::join!(
            adapter.stream_text(SessionKind::General, "hi", &options, |_| {}),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                adapter.reset_session(SessionKind::General).await;
            }
        );
        assert!(result.is_ok());
        assert_eq!(adapter.transcript(SessionKind::General).await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_overflows_condense_once() {
        let stub = StubLanguageModel::new()
            .with_context_limit(5)
            .with_latency(Duration::from_millis(5));
        let adapter = ModelSessionAdapter::new(Arc::new(stub));
        let options = GenerationOptions::default();
        for prompt in ["one", "two"] {
            adapter
                .stream_text(SessionKind::General, prompt, &options, |_| {})
                .await
                .unwrap();
        }
        let before = adapter.transcript(SessionKind::General).await;
        assert_eq!(before.len(), 5);

        let (first, second) = tokio::join!(
            adapter.stream_text(SessionKind::General, "three", &options, |_| {}),
            adapter.stream_text(SessionKind::General, "four", &options, |_| {}),
        );
        assert_eq!(first, Err(GenerationError::ContextOverflow));
        assert_eq!(second, Err(GenerationError::ContextOverflow));

        let after = adapter.transcript(SessionKind::General).await;
        assert_eq!(after.entries(), &[before.entries()[0].clone(), before.entries()[4].clone()]);

        adapter
            .stream_text(SessionKind::General, "five", &options, |_| {})
            .await
            .unwrap();
        let last = adapter.transcript(SessionKind::General).await;
        assert_eq!(last.len(), 4);
        assert_eq!(last.entries()[2].content, "five");
    }

    #[tokio::test]
    async fn test_instructions_apply_to_fresh_sessions() {
        let adapter = ModelSessionAdapter::new(Arc::new(StubLanguageModel::new()));
        adapter
            .stream_text(SessionKind::General, "hi", &GenerationOptions::default(), |_| {})
            .await
            .unwrap();

        adapter.set_instructions(SessionKind::General, "Be terse.").await;
        let live = adapter.transcript(SessionKind::General).await;
        assert_eq!(live.entries()[0].content, DEFAULT_GENERAL_INSTRUCTIONS);
        assert_eq!(live.len(), 3);

        adapter.reset_session(SessionKind::General).await;
        let fresh = adapter.transcript(SessionKind::General).await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh.entries()[0].content, "Be terse.");
        assert_eq!(adapter.transcript(SessionKind::Tutor).await.len(), 1);
    }

    #[tokio::test]
    async fn test_feedback_is_scored_locally() {
        let mut mock = MockLanguageModel::new();
        available(&mut mock);
        mock.expect_respond().returning(|_, _, _| {
            Ok(json!({"score": 99, "comment_vi": "Giỏi!", "corrections": []}))
        });
        let adapter = ModelSessionAdapter::new(Arc::new(mock));

        let word = WordEntry::new("meal", "bữa ăn", "noun", "A meal.");
        let exercises = (0..2)
            .map(|i| {
                Exercise::new(
                    crate::exercise::ExerciseKind::Translate,
                    format!("p{i}"),
                    "meal",
                    vec![],
                    word.clone(),
                )
            })
            .collect();
        let mut round = PracticeRound::new(exercises);
        for answer in ["meal", "fish"] {
            let result = crate::exercise::ExerciseResult::grade(round.current().unwrap(), answer);
            round.record(result);
        }
        let feedback = adapter.generate_feedback(&round, "Lan").await.unwrap();
        assert_eq!(feedback.score, 1);
        assert_eq!(feedback.total, 2);
        assert_eq!(feedback.corrections.len(), 1);
        assert_eq!(feedback.tutor_note.as_deref(), Some("Giỏi!"));
    }
}
