//! Session Lab
//!
//! Experiments with session instructions and sampling. Settings edited here
//! take effect for the next fresh session; `apply_settings` forces one. The
//! streamed partial text is observable through a `watch` channel while a
//! reply is being generated, and the live transcript can be inspected after
//! every turn.

use crate::{
    adapter::{DEFAULT_GENERAL_INSTRUCTIONS, ModelSessionAdapter, SessionKind},
    chat::GeneratingGuard,
    error::GenerationError,
    llm_client::GenerationOptions,
    transcript::Transcript,
    tutor::{ChatMessage, Notice},
};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{Mutex, watch};

pub const LAB_APOLOGY: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSettings {
    pub instructions: String,
    pub greedy: bool,
    pub temperature: f64,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_GENERAL_INSTRUCTIONS.to_string(),
            greedy: false,
            temperature: 1.0,
        }
    }
}

impl LabSettings {
    /// Greedy sampling wins over the temperature.
    pub fn generation_options(&self) -> GenerationOptions {
        if self.greedy {
            GenerationOptions::greedy()
        } else {
            GenerationOptions::with_temperature(self.temperature)
        }
    }
}

#[derive(Default)]
struct LabState {
    settings: LabSettings,
    messages: Vec<ChatMessage>,
    notice: Option<Notice>,
}

pub struct SessionLab {
    adapter: Arc<ModelSessionAdapter>,
    state: Mutex<LabState>,
    partial: watch::Sender<String>,
    generating: AtomicBool,
}

impl SessionLab {
    pub fn new(adapter: Arc<ModelSessionAdapter>) -> Self {
        let (partial, _) = watch::channel(String::new());
        Self {
            adapter,
            state: Mutex::new(LabState::default()),
            partial,
            generating: AtomicBool::new(false),
        }
    }

    /// Learner-facing reason the model cannot be used, if any.
    pub async fn unavailability_reason(&self) -> Option<String> {
        self.adapter.check_availability().await.reason()
    }

    pub async fn settings(&self) -> LabSettings {
        self.state.lock().await.settings.clone()
    }

    /// Stores new settings. Instructions only reach the model once a fresh
    /// session starts.
    pub async fn update_settings(&self, settings: LabSettings) {
        self.adapter
            .set_instructions(SessionKind::General, settings.instructions.clone())
            .await;
        self.state.lock().await.settings = settings;
    }

    /// Clears the chat and recreates the session with the current settings.
    pub async fn apply_settings(&self) -> Transcript {
        let instructions = {
            let mut state = self.state.lock().await;
            state.messages.clear();
            state.notice = None;
            state.settings.instructions.clone()
        };
        self.partial.send_replace(String::new());
        self.adapter
            .set_instructions(SessionKind::General, instructions)
            .await;
        self.adapter.reset_session(SessionKind::General).await;
        tracing::info!("Lab session recreated");
        self.transcript().await
    }

    pub async fn transcript(&self) -> Transcript {
        self.adapter.transcript(SessionKind::General).await
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.messages.clone()
    }

    pub async fn notice(&self) -> Option<Notice> {
        self.state.lock().await.notice.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Text streamed so far for the reply in progress.
    pub fn partial_text(&self) -> String {
        self.partial.borrow().clone()
    }

    pub fn subscribe_partial(&self) -> watch::Receiver<String> {
        self.partial.subscribe()
    }

    /// Sends `text` with the configured sampling. Ignored when empty or
    /// while another reply is being generated.
    pub async fn send_message(&self, text: &str) -> Result<Option<String>, GenerationError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let Some(_guard) = GeneratingGuard::acquire(&self.generating) else {
            return Ok(None);
        };
        let options = {
            let mut state = self.state.lock().await;
            state.messages.push(ChatMessage::user(text));
            state.notice = None;
            state.settings.generation_options()
        };
        self.partial.send_replace(String::new());
        tracing::debug!(sampling = ?options.sampling, "Lab message sent");

        let partial = &self.partial;
        let result = self
            .adapter
            .stream_text(SessionKind::General, text, &options, |text| {
                partial.send_replace(text.to_string());
            })
            .await;
        self.partial.send_replace(String::new());

        let mut state = self.state.lock().await;
        match result {
            Ok(reply) => {
                state.messages.push(ChatMessage::assistant(reply.clone()));
                Ok(Some(reply))
            }
            Err(GenerationError::ContextOverflow) => {
                state.notice = Some(Notice::ContextOverflow);
                Err(GenerationError::ContextOverflow)
            }
            Err(e) => {
                state.messages.push(ChatMessage::assistant(LAB_APOLOGY));
                state.notice = Some(Notice::for_error(&e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        llm_client::{Availability, MockLanguageModel, Sampling, TextStream, UnavailableReason},
        stub::StubLanguageModel,
        transcript::Role,
    };
    use std::time::Duration;

    fn lab_with(stub: StubLanguageModel) -> Arc<SessionLab> {
        let adapter = Arc::new(ModelSessionAdapter::new(Arc::new(stub)));
        Arc::new(SessionLab::new(adapter))
    }

    #[test]
    fn test_greedy_overrides_temperature() {
        let mut settings = LabSettings {
            temperature: 0.3,
            ..LabSettings::default()
        };
        assert_eq!(settings.generation_options().temperature(), Some(0.3));
        settings.greedy = true;
        assert_eq!(settings.generation_options().sampling, Sampling::Greedy);
    }

    #[tokio::test]
    async fn test_unavailability_reason() {
        assert_eq!(lab_with(StubLanguageModel::new()).unavailability_reason().await, None);
        let lab = lab_with(StubLanguageModel::unavailable(UnavailableReason::ModelNotReady));
        let reason = lab.unavailability_reason().await.unwrap();
        assert!(reason.contains("tải xuống"));
        assert_eq!(lab.send_message("hi").await, Err(GenerationError::Unsupported));
    }

    #[tokio::test]
    async fn test_apply_settings_recreates_session() {
        let lab = lab_with(StubLanguageModel::new());
        lab.send_message("hi").await.unwrap();
        assert_eq!(lab.transcript().await.len(), 3);

        lab.update_settings(LabSettings {
            instructions: "Answer in haiku.".into(),
            ..LabSettings::default()
        })
        .await;
        assert_eq!(lab.transcript().await.len(), 3);

        let transcript = lab.apply_settings().await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.entries()[0].role, Role::Instructions);
        assert_eq!(transcript.entries()[0].content, "Answer in haiku.");
        assert!(lab.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_text_is_observable() {
        let lab = lab_with(StubLanguageModel::new().with_chunk_delay(Duration::from_millis(5)));
        let mut partial = lab.subscribe_partial();
        let background = lab.clone();
        let send = tokio::spawn(async move { background.send_message("hi").await });

        partial.changed().await.unwrap();
        partial.changed().await.unwrap();
        assert!(lab.is_generating());
        let seen = partial.borrow_and_update().clone();
        assert!(!seen.is_empty());

        let reply = send.await.unwrap().unwrap().unwrap();
        assert!(reply.starts_with(&seen));
        assert!(lab.partial_text().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_shows_condensed_transcript() {
        let lab = lab_with(StubLanguageModel::new().with_context_limit(5));
        lab.send_message("one").await.unwrap();
        lab.send_message("two").await.unwrap();
        assert_eq!(lab.transcript().await.len(), 5);

        let err = lab.send_message("three").await.unwrap_err();
        assert_eq!(err, GenerationError::ContextOverflow);
        let transcript = lab.transcript().await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.entries()[1].role, Role::Assistant);
        assert_eq!(lab.notice().await, Some(Notice::ContextOverflow));
        assert_eq!(lab.messages().await.len(), 5);
    }

    #[tokio::test]
    async fn test_sampling_reaches_the_model() {
        let mut mock = MockLanguageModel::new();
        mock.expect_availability()
            .returning(|| Availability::Available);
        mock.expect_stream_response()
            .withf(|_, prompt, options| prompt.to_string() == "hi" && options.sampling == Sampling::Greedy)
            .times(1)
            .returning(|_, _, _| {
                Ok(Box::pin(futures::stream::iter(vec![Ok("ok".to_string())])) as TextStream)
            });
        let lab = SessionLab::new(Arc::new(ModelSessionAdapter::new(Arc::new(mock))));
        lab.update_settings(LabSettings {
            greedy: true,
            ..LabSettings::default()
        })
        .await;

        assert_eq!(lab.send_message("hi").await, Ok(Some("ok".to_string())));
    }
}
