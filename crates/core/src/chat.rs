//! General chat: a plain assistant conversation on the general session.

use crate::{
    adapter::{ModelSessionAdapter, SessionKind},
    error::GenerationError,
    llm_client::{Availability, GenerationOptions},
    tutor::{ChatMessage, Notice},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;

pub const GREETING: &str = "Hello! I'm your AI assistant. How can I help you today?";

/// Marks a conversation as generating until dropped, including when the
/// sending future is cancelled.
pub(crate) struct GeneratingGuard<'a>(&'a AtomicBool);

impl<'a> GeneratingGuard<'a> {
    /// `None` if a reply is already being generated.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ChatState {
    messages: Vec<ChatMessage>,
    notice: Option<Notice>,
}

pub struct GeneralChat {
    adapter: Arc<ModelSessionAdapter>,
    state: Mutex<ChatState>,
    generating: AtomicBool,
}

impl GeneralChat {
    pub fn new(adapter: Arc<ModelSessionAdapter>) -> Self {
        Self {
            adapter,
            state: Mutex::new(ChatState::default()),
            generating: AtomicBool::new(false),
        }
    }

    /// Checks the model and greets the user once it is available.
    pub async fn start(&self) -> Availability {
        let availability = self.adapter.check_availability().await;
        if availability.is_available() {
            let mut state = self.state.lock().await;
            if state.messages.is_empty() {
                state.messages.push(ChatMessage::assistant(GREETING));
            }
        }
        availability
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.messages.clone()
    }

    pub async fn notice(&self) -> Option<Notice> {
        self.state.lock().await.notice.clone()
    }

    /// Sends `text` and streams the reply. Returns `Ok(None)` when the input
    /// is empty or another reply is still being generated.
    pub async fn send_message<F>(
        &self,
        text: &str,
        on_partial: F,
    ) -> Result<Option<String>, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let Some(_guard) = GeneratingGuard::acquire(&self.generating) else {
            tracing::debug!("Message ignored, a reply is still being generated");
            return Ok(None);
        };
        {
            let mut state = self.state.lock().await;
            state.messages.push(ChatMessage::user(text));
            state.notice = None;
        }

        let result = self
            .adapter
            .stream_text(SessionKind::General, text, &GenerationOptions::default(), on_partial)
            .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(reply) => {
                state.messages.push(ChatMessage::assistant(reply.clone()));
                Ok(Some(reply))
            }
            Err(e) => {
                if e != GenerationError::ContextOverflow {
                    state.messages.push(ChatMessage::assistant(format!(
                        "Sorry, I encountered an error: {e}. Please try again."
                    )));
                }
                state.notice = Some(Notice::for_error(&e));
                Err(e)
            }
        }
    }

    /// Forgets the conversation and starts a fresh general session.
    pub async fn clear_conversation(&self) {
        self.adapter.reset_session(SessionKind::General).await;
        let mut state = self.state.lock().await;
        state.messages.clear();
        state.notice = None;
    }
}
