//! Defines the WebSocket message protocol between the browser client and the API server.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vocab_tutor_core::{
    TutorSnapshot,
    feedback::QuickReplyAction,
    lab::LabSettings,
    transcript::Transcript,
    tutor::{ChatMessage, Notice},
};

/// Messages sent from the client to a tutor session (`/ws`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Checks availability and requests the first snapshot.
    Start,
    CaptureName { name: String },
    /// Topic id or either of its labels.
    ChooseTopic { topic: String },
    ToggleWord { index: usize },
    ConfirmSelection,
    ViewCard { index: usize },
    /// An illustration for a flashcard, produced outside the server.
    AttachImage { card_id: Uuid, image: String },
    FinishReview,
    SubmitAnswer { answer: String },
    QuickReply { action: QuickReplyAction },
    /// A free-chat turn; only accepted in the free chat phase.
    Chat { text: String },
    /// Aborts the operation in flight, if any.
    Cancel,
}

/// Messages sent from the client to a general chat session (`/ws/chat`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatClientMessage {
    Message { text: String },
    Clear,
    Cancel,
}

/// Messages sent from the client to a session lab (`/ws/lab`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LabClientMessage {
    /// Takes effect with the next fresh session.
    UpdateSettings { settings: LabSettings },
    /// Clears the conversation and recreates the session.
    ApplySettings,
    Message { text: String },
    Cancel,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The model cannot be used; generation requests will fail.
    Unavailable { reason: String },
    /// The complete tutor state after a change.
    Snapshot { state: TutorSnapshot },
    /// The general chat conversation after a change.
    Conversation {
        messages: Vec<ChatMessage>,
        notice: Option<Notice>,
    },
    /// Session lab settings and the live transcript after a change.
    LabState {
        settings: LabSettings,
        transcript: Transcript,
    },
    /// Signals the beginning of a streamed text response.
    ResponseStart,
    /// Text appended to the streamed response.
    ResponseChunk { chunk: String },
    ResponseEnd,
    /// An operation was rejected or failed.
    Error { message: String },
    /// An event arrived while another operation was in flight and was dropped.
    Busy,
}
