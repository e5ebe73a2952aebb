//! Tutor Session State Machine
//!
//! Sequences the guided vocabulary loop: greeting, topic selection, word
//! generation and selection, flashcard review, a practice round and its
//! feedback, then a quick reply. Every operation validates the current phase
//! before touching any state, and every mutation publishes a fresh
//! [`TutorSnapshot`] to the optional update channel.

use crate::{
    adapter::{ModelSessionAdapter, SessionKind},
    error::{GenerationError, TransitionError, TutorError},
    exercise::{Exercise, ExerciseKind, ExerciseResult, PracticeRound},
    feedback::{QuickReply, QuickReplyAction, RoundFeedback},
    llm_client::{Availability, GenerationOptions},
    schema::MAX_SELECTED_WORDS,
    topic::Topic,
    vocab::{Flashcard, WordEntry},
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Tutor instructions. `{learner_name}` is replaced once the name is known.
pub const DEFAULT_TUTOR_TEMPLATE: &str = "Bạn là một gia sư tiếng Anh thân thiện dành cho người Việt ở trình độ A1–A2. Học viên tên là {learner_name}; hãy gọi tên học viên khi phù hợp. Luôn trả lời bằng tiếng Việt, ngắn gọn và khích lệ.";

pub const OVERFLOW_NOTICE: &str =
    "Cuộc hội thoại đã bị rút gọn do giới hạn ngữ cảnh. Vui lòng gửi lại tin nhắn cuối.";
pub const APOLOGY_MESSAGE: &str = "Xin lỗi, mình gặp lỗi khi tạo phản hồi. Bạn thử lại nhé!";

/// Fills the learner name into an instructions template.
pub fn render_instructions(template: &str, learner_name: &str) -> String {
    template.replace("{learner_name}", learner_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Greeting,
    TopicSelection,
    WordGeneration,
    WordSelection,
    FlashcardGeneration,
    FlashcardReview,
    PracticeRound,
    Feedback,
    FreeChat,
}

impl Phase {
    /// Free-text input is only accepted in free chat.
    pub fn accepts_free_text(self) -> bool {
        self == Phase::FreeChat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A message of the learner-facing conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Banner shown above the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Notice {
    Error(String),
    ContextOverflow,
}

impl Notice {
    pub fn text(&self) -> &str {
        match self {
            Notice::Error(message) => message,
            Notice::ContextOverflow => OVERFLOW_NOTICE,
        }
    }

    /// Banner for a failed generation call.
    pub fn for_error(error: &GenerationError) -> Self {
        match error {
            GenerationError::ContextOverflow => Notice::ContextOverflow,
            GenerationError::Unsupported => {
                Notice::Error("Mô hình ngôn ngữ không khả dụng trên thiết bị này.".to_string())
            }
            GenerationError::GenerationFailed(reason) => {
                Notice::Error(format!("Không thể tạo phản hồi: {reason}"))
            }
        }
    }
}

/// The current exercise as shown to the learner, without its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseView {
    pub id: Uuid,
    pub kind: ExerciseKind,
    pub prompt: String,
    pub options: Vec<String>,
    pub index: usize,
    pub total: usize,
}

/// Owned, serializable view of the whole tutor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorSnapshot {
    pub phase: Phase,
    pub learner_name: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Topic chips, offered during topic selection only.
    pub topics: Vec<Topic>,
    pub topic: Option<Topic>,
    pub words: Vec<WordEntry>,
    /// Indices into `words`, in selection order.
    pub selected: Vec<usize>,
    pub flashcards: Vec<Flashcard>,
    pub viewed_cards: Vec<Uuid>,
    pub exercise: Option<ExerciseView>,
    pub results: Vec<ExerciseResult>,
    pub feedback: Option<RoundFeedback>,
    pub quick_replies: Vec<QuickReply>,
    pub notice: Option<Notice>,
}

pub struct TutorSession {
    adapter: Arc<ModelSessionAdapter>,
    rng: Box<dyn RngCore + Send + Sync>,
    updates: Option<mpsc::Sender<TutorSnapshot>>,
    instructions_template: String,

    phase: Phase,
    learner_name: Option<String>,
    messages: Vec<ChatMessage>,
    topic: Option<Topic>,
    words: Vec<WordEntry>,
    selected: Vec<usize>,
    flashcards: Vec<Flashcard>,
    viewed_cards: Vec<Uuid>,
    round: Option<PracticeRound>,
    feedback: Option<RoundFeedback>,
    notice: Option<Notice>,
    /// Phase to return to if the running generation is abandoned.
    resume: Option<Phase>,
}

impl TutorSession {
    pub fn new(adapter: Arc<ModelSessionAdapter>) -> Self {
        Self {
            adapter,
            rng: Box::new(StdRng::from_os_rng()),
            updates: None,
            instructions_template: DEFAULT_TUTOR_TEMPLATE.to_string(),
            phase: Phase::Greeting,
            learner_name: None,
            messages: Vec::new(),
            topic: None,
            words: Vec::new(),
            selected: Vec::new(),
            flashcards: Vec::new(),
            viewed_cards: Vec::new(),
            round: None,
            feedback: None,
            notice: None,
            resume: None,
        }
    }

    /// Shuffles option sets with `rng` instead of an OS-seeded generator.
    pub fn with_rng(mut self, rng: impl RngCore + Send + Sync + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Publishes a snapshot on `tx` after every mutation.
    pub fn with_updates(mut self, tx: mpsc::Sender<TutorSnapshot>) -> Self {
        self.updates = Some(tx);
        self
    }

    pub fn with_instructions_template(mut self, template: impl Into<String>) -> Self {
        self.instructions_template = template.into();
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn learner_name(&self) -> Option<&str> {
        self.learner_name.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn words(&self) -> &[WordEntry] {
        &self.words
    }

    pub fn selected_words(&self) -> Vec<WordEntry> {
        self.selected
            .iter()
            .filter_map(|&i| self.words.get(i).cloned())
            .collect()
    }

    pub fn flashcards(&self) -> &[Flashcard] {
        &self.flashcards
    }

    pub fn round(&self) -> Option<&PracticeRound> {
        self.round.as_ref()
    }

    /// The exercise waiting for an answer, with its correct answer.
    pub fn current_exercise(&self) -> Option<&Exercise> {
        match self.phase {
            Phase::PracticeRound => self.round.as_ref()?.current(),
            _ => None,
        }
    }

    pub fn feedback(&self) -> Option<&RoundFeedback> {
        self.feedback.as_ref()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn snapshot(&self) -> TutorSnapshot {
        let exercise = self.round.as_ref().and_then(|round| {
            let current = self.current_exercise()?;
            Some(ExerciseView {
                id: current.id,
                kind: current.kind,
                prompt: current.prompt.clone(),
                options: current.options.clone(),
                index: round.results().len(),
                total: round.exercises().len(),
            })
        });
        TutorSnapshot {
            phase: self.phase,
            learner_name: self.learner_name.clone(),
            messages: self.messages.clone(),
            topics: match self.phase {
                Phase::TopicSelection => Topic::catalog(),
                _ => Vec::new(),
            },
            topic: self.topic.clone(),
            words: self.words.clone(),
            selected: self.selected.clone(),
            flashcards: self.flashcards.clone(),
            viewed_cards: self.viewed_cards.clone(),
            exercise,
            results: self
                .round
                .as_ref()
                .map(|r| r.results().to_vec())
                .unwrap_or_default(),
            feedback: self.feedback.clone(),
            quick_replies: match (&self.phase, &self.feedback) {
                (Phase::Feedback, Some(feedback)) => QuickReply::after_feedback(feedback),
                _ => Vec::new(),
            },
            notice: self.notice.clone(),
        }
    }

    async fn publish(&self) {
        if let Some(tx) = &self.updates {
            if tx.send(self.snapshot()).await.is_err() {
                tracing::warn!("Failed to publish tutor snapshot: receiver dropped.");
            }
        }
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), TransitionError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(TransitionError::WrongPhase {
                expected,
                actual: self.phase,
            })
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::info!(from = ?self.phase, to = ?phase, "Tutor phase changed");
            self.phase = phase;
        }
    }

    /// Records a failed generation call: the overflow banner alone, or an
    /// error banner plus an apology message.
    async fn fail(&mut self, error: GenerationError) -> TutorError {
        tracing::warn!(phase = ?self.phase, error = %error, "Tutor generation failed");
        self.notice = Some(Notice::for_error(&error));
        if error != GenerationError::ContextOverflow {
            self.messages.push(ChatMessage::assistant(APOLOGY_MESSAGE));
        }
        self.publish().await;
        TutorError::Generation(error)
    }

    /// Publishes the initial state and reports whether the model can be used.
    pub async fn start(&mut self) -> Availability {
        let availability = self.adapter.check_availability().await;
        if let Some(reason) = availability.reason() {
            tracing::warn!(%reason, "Tutor started without an available model");
        }
        self.publish().await;
        availability
    }

    fn greet(&mut self) {
        let name = self.learner_name.clone().unwrap_or_default();
        self.messages.push(ChatMessage::assistant(format!(
            "Chào {name}! Rất vui được học cùng bạn. Hôm nay bạn muốn học từ vựng về chủ đề nào?"
        )));
        self.enter(Phase::TopicSelection);
    }

    pub async fn capture_name(&mut self, name: &str) -> Result<(), TutorError> {
        self.expect_phase(Phase::Greeting)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TransitionError::EmptyName.into());
        }
        self.learner_name = Some(name.to_string());
        self.adapter
            .set_instructions(
                SessionKind::Tutor,
                render_instructions(&self.instructions_template, name),
            )
            .await;
        self.adapter.reset_session(SessionKind::Tutor).await;
        tracing::info!(learner = %name, "Learner name captured");

        self.greet();
        self.publish().await;
        Ok(())
    }

    pub async fn choose_topic(&mut self, key: &str) -> Result<(), TutorError> {
        self.expect_phase(Phase::TopicSelection)?;
        let topic =
            Topic::find(key).ok_or_else(|| TransitionError::UnknownTopic(key.to_string()))?;
        // A retry after a failed or cancelled attempt reuses the learner's chip.
        if self.topic.as_ref() != Some(&topic) {
            self.messages.push(ChatMessage::user(topic.chip_label()));
            self.topic = Some(topic.clone());
        }
        self.generate_words(topic, Phase::TopicSelection).await
    }

    /// Requests a word batch; `origin` is restored if the request fails.
    async fn generate_words(&mut self, topic: Topic, origin: Phase) -> Result<(), TutorError> {
        self.notice = None;
        self.resume = Some(origin);
        self.enter(Phase::WordGeneration);
        self.publish().await;

        let outcome = self.adapter.generate_words(&topic).await;
        self.resume = None;
        match outcome {
            Ok(words) => {
                self.messages.push(ChatMessage::assistant(format!(
                    "Đây là {} từ về chủ đề {}. Hãy chọn tối đa {} từ bạn muốn học!",
                    words.len(),
                    topic.chip_label(),
                    MAX_SELECTED_WORDS
                )));
                self.words = words;
                self.selected.clear();
                self.enter(Phase::WordSelection);
                self.publish().await;
                Ok(())
            }
            Err(e) => {
                self.enter(origin);
                Err(self.fail(e).await)
            }
        }
    }

    /// Selects or deselects the word at `index`. Selection order is kept.
    pub async fn toggle_word(&mut self, index: usize) -> Result<(), TutorError> {
        self.expect_phase(Phase::WordSelection)?;
        if index >= self.words.len() {
            return Err(TransitionError::OutOfRange {
                index,
                len: self.words.len(),
            }
            .into());
        }
        if let Some(pos) = self.selected.iter().position(|&i| i == index) {
            self.selected.remove(pos);
        } else if self.selected.len() >= MAX_SELECTED_WORDS {
            return Err(TransitionError::SelectionFull {
                max: MAX_SELECTED_WORDS,
            }
            .into());
        } else {
            self.selected.push(index);
        }
        self.publish().await;
        Ok(())
    }

    /// Generates one flashcard per selected word, concurrently. Any failure
    /// fails the whole step and no card is kept.
    pub async fn confirm_selection(&mut self) -> Result<(), TutorError> {
        self.expect_phase(Phase::WordSelection)?;
        if self.selected.is_empty() || self.selected.len() > MAX_SELECTED_WORDS {
            return Err(TransitionError::InvalidSelection {
                max: MAX_SELECTED_WORDS,
            }
            .into());
        }
        let words = self.selected_words();
        let labels: Vec<&str> = words.iter().map(|w| w.english.as_str()).collect();
        self.messages.push(ChatMessage::user(labels.join(", ")));
        self.notice = None;
        self.resume = Some(Phase::WordSelection);
        self.enter(Phase::FlashcardGeneration);
        self.publish().await;

        let adapter = self.adapter.clone();
        let cards = try_join_all(words.iter().map(|word| adapter.generate_flashcard(word))).await;
        self.resume = None;
        match cards {
            Ok(cards) => {
                self.messages.push(ChatMessage::assistant(format!(
                    "Mình đã chuẩn bị {} thẻ học. Hãy xem từng thẻ rồi bắt đầu luyện tập nhé!",
                    cards.len()
                )));
                self.flashcards = cards;
                self.viewed_cards.clear();
                self.enter(Phase::FlashcardReview);
                self.publish().await;
                Ok(())
            }
            Err(e) => {
                self.enter(Phase::WordSelection);
                Err(self.fail(e).await)
            }
        }
    }

    pub async fn view_card(&mut self, index: usize) -> Result<(), TutorError> {
        self.expect_phase(Phase::FlashcardReview)?;
        let card = self
            .flashcards
            .get(index)
            .ok_or(TransitionError::OutOfRange {
                index,
                len: self.flashcards.len(),
            })?;
        if !self.viewed_cards.contains(&card.id) {
            self.viewed_cards.push(card.id);
            self.publish().await;
        }
        Ok(())
    }

    /// Stores an illustration produced outside the tutor loop.
    pub async fn attach_image(&mut self, card_id: Uuid, image: String) -> Result<(), TutorError> {
        let card = self
            .flashcards
            .iter_mut()
            .find(|c| c.id == card_id)
            .ok_or(TransitionError::UnknownFlashcard(card_id))?;
        card.image = Some(image);
        self.publish().await;
        Ok(())
    }

    /// Ends the review, whether or not every card was viewed, and requests
    /// the practice round. The phase only changes once the round exists.
    pub async fn finish_review(&mut self) -> Result<(), TutorError> {
        self.expect_phase(Phase::FlashcardReview)?;
        let skipped = self.flashcards.len().saturating_sub(self.viewed_cards.len());
        tracing::debug!(skipped, "Flashcard review finished");
        self.notice = None;

        let words: Vec<WordEntry> = self
            .flashcards
            .iter()
            .take(MAX_SELECTED_WORDS)
            .map(|c| c.word.clone())
            .collect();
        match self.adapter.generate_exercises(&words, &mut *self.rng).await {
            Ok(exercises) => {
                self.messages.push(ChatMessage::assistant(format!(
                    "Bắt đầu luyện tập! Có {} câu hỏi đang chờ bạn.",
                    exercises.len()
                )));
                self.round = Some(PracticeRound::new(exercises));
                self.feedback = None;
                self.enter(Phase::PracticeRound);
                self.publish().await;
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Scores `answer` against the current exercise. The last answer of a
    /// round is only recorded once its feedback has been generated.
    pub async fn submit_answer(&mut self, answer: &str) -> Result<ExerciseResult, TutorError> {
        self.expect_phase(Phase::PracticeRound)?;
        let round = self
            .round
            .as_ref()
            .ok_or(TransitionError::NoPendingExercise)?;
        let exercise = round.current().ok_or(TransitionError::NoPendingExercise)?;
        let result = ExerciseResult::grade(exercise, answer);
        let verdict = if result.is_correct {
            "✅ Chính xác!".to_string()
        } else {
            format!("❌ Chưa đúng. Đáp án là \"{}\".", exercise.correct_answer)
        };
        let last = round.is_last();
        let mut updated = round.clone();
        updated.record(result.clone());

        if !last {
            self.round = Some(updated);
            self.messages.push(ChatMessage::user(answer.trim()));
            self.messages.push(ChatMessage::assistant(verdict));
            self.publish().await;
            return Ok(result);
        }

        self.notice = None;
        let name = self.learner_name.clone().unwrap_or_default();
        match self.adapter.generate_feedback(&updated, &name).await {
            Ok(feedback) => {
                self.round = Some(updated);
                self.messages.push(ChatMessage::user(answer.trim()));
                self.messages.push(ChatMessage::assistant(verdict));
                let mut summary = feedback.comment_vi.clone();
                if let Some(note) = &feedback.tutor_note {
                    summary.push('\n');
                    summary.push_str(note);
                }
                self.messages.push(ChatMessage::assistant(summary));
                tracing::info!(score = feedback.score, total = feedback.total, "Practice round finished");
                self.feedback = Some(feedback);
                self.enter(Phase::Feedback);
                self.publish().await;
                Ok(result)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    pub async fn quick_reply(&mut self, action: QuickReplyAction) -> Result<(), TutorError> {
        self.expect_phase(Phase::Feedback)?;
        tracing::info!(?action, "Quick reply chosen");
        match action {
            QuickReplyAction::NewTopic => {
                self.adapter.reset_session(SessionKind::Tutor).await;
                self.topic = None;
                self.words.clear();
                self.selected.clear();
                self.flashcards.clear();
                self.viewed_cards.clear();
                self.round = None;
                self.feedback = None;
                self.notice = None;
                self.enter(Phase::Greeting);
                if self.learner_name.is_some() {
                    self.greet();
                }
                self.publish().await;
                Ok(())
            }
            QuickReplyAction::AddMoreWords => match self.topic.clone() {
                Some(topic) => self.generate_words(topic, Phase::Feedback).await,
                None => {
                    self.messages.push(ChatMessage::assistant(
                        "Bạn muốn học thêm từ về chủ đề nào?",
                    ));
                    self.enter(Phase::TopicSelection);
                    self.publish().await;
                    Ok(())
                }
            },
            QuickReplyAction::TryAgain => {
                let round = self
                    .round
                    .as_ref()
                    .ok_or(TransitionError::NoPendingExercise)?
                    .restarted();
                self.messages
                    .push(ChatMessage::assistant("Cùng làm lại bài luyện tập nhé!"));
                self.round = Some(round);
                self.feedback = None;
                self.notice = None;
                self.enter(Phase::PracticeRound);
                self.publish().await;
                Ok(())
            }
            QuickReplyAction::FreeChat => {
                self.messages.push(ChatMessage::assistant(
                    "Bạn muốn hỏi gì về tiếng Anh? Mình sẵn sàng trả lời!",
                ));
                self.notice = None;
                self.enter(Phase::FreeChat);
                self.publish().await;
                Ok(())
            }
        }
    }

    /// Restores a consistent phase after the future of an operation was
    /// dropped mid-generation, and republishes the state.
    pub async fn recover_cancelled(&mut self) {
        if let Some(origin) = self.resume.take() {
            tracing::info!(from = ?self.phase, to = ?origin, "Generation abandoned");
            self.enter(origin);
        }
        self.publish().await;
    }

    /// One open chat turn on the tutor session. Failures other than overflow
    /// leave an apology in the conversation; the next turn works as usual.
    pub async fn send_free_chat<F>(&mut self, text: &str, on_partial: F) -> Result<String, TutorError>
    where
        F: FnMut(&str) + Send,
    {
        if !self.phase.accepts_free_text() {
            return Err(TransitionError::WrongPhase {
                expected: Phase::FreeChat,
                actual: self.phase,
            }
            .into());
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(TransitionError::EmptyMessage.into());
        }
        self.messages.push(ChatMessage::user(text));
        self.notice = None;
        self.publish().await;

        match self
            .adapter
            .stream_text(SessionKind::Tutor, text, &GenerationOptions::default(), on_partial)
            .await
        {
            Ok(reply) => {
                self.messages.push(ChatMessage::assistant(reply.clone()));
                self.publish().await;
                Ok(reply)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}
