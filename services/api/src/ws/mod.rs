//! WebSocket Session Management
//!
//! This module contains the logic for driving tutor and general chat sessions
//! over WebSockets. It is structured into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the connection lifecycle and supervises in-flight operations.
//! - `dispatch`: Applies client events to the tutor state machine.
//! - `chat`: Runs a plain assistant conversation on its own endpoint.
//! - `lab`: Edits session instructions and sampling, and exposes the transcript.

mod chat;
mod dispatch;
mod lab;
pub mod protocol;
pub mod session;

pub use chat::chat_ws_handler;
pub use lab::lab_ws_handler;
pub use session::ws_handler;
