//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every connection needs: the generation backend and
//! the instruction templates loaded at startup.

use crate::config::Config;
use std::sync::Arc;
use vocab_tutor_core::LanguageModel;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn LanguageModel>,
    /// Tutor instructions; `{learner_name}` is substituted per learner.
    pub tutor_template: Arc<String>,
    pub general_instructions: Arc<String>,
    pub config: Arc<Config>,
}
