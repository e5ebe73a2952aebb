pub mod adapter;
pub mod chat;
pub mod error;
pub mod exercise;
pub mod feedback;
pub mod lab;
pub mod llm_client;
pub mod schema;
pub mod stub;
pub mod topic;
pub mod transcript;
pub mod tutor;
pub mod vocab;

pub use adapter::{ModelSessionAdapter, SessionKind};
pub use error::{GenerationError, ServiceError, TransitionError, TutorError};
pub use llm_client::{Availability, GenerationOptions, LanguageModel};
pub use tutor::{Phase, TutorSession, TutorSnapshot};
