//! General chat over WebSocket (`/ws/chat`).
//!
//! A plain assistant conversation that shares the connection plumbing of the
//! tutor endpoint but runs on the general session of its own adapter.

use super::{
    dispatch::chunk_relay,
    protocol::{ChatClientMessage, ServerMessage},
    session::{Frame, Outbound, Outcome, next_frame, send, supervise, write_loop},
};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;
use vocab_tutor_core::{ModelSessionAdapter, SessionKind, chat::GeneralChat};

/// Axum handler to upgrade an HTTP connection to a general chat WebSocket.
pub async fn chat_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("chat_session", %session_id);
    async move {
        info!("New chat WebSocket connection.");
        if let Err(e) = run_chat_session(socket, state).await {
            error!(error = ?e, "Chat session terminated with error.");
        }
        info!("Chat session finished.");
    }
    .instrument(span)
    .await
}

async fn run_chat_session(socket: WebSocket, state: Arc<AppState>) -> Result<()> {
    let (sink, mut socket_rx) = socket.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, None).in_current_span());

    let adapter = Arc::new(ModelSessionAdapter::new(state.model.clone()));
    adapter
        .set_instructions(SessionKind::General, state.general_instructions.as_str())
        .await;
    let chat = GeneralChat::new(adapter);

    let availability = chat.start().await;
    if let Some(reason) = availability.reason() {
        send(&outbound, ServerMessage::Unavailable { reason });
    }
    publish(&chat, &outbound).await;

    loop {
        let text = match next_frame::<ChatClientMessage>(&mut socket_rx, &outbound).await {
            Frame::Event(ChatClientMessage::Message { text }) => text,
            Frame::Event(ChatClientMessage::Clear) => {
                chat.clear_conversation().await;
                publish(&chat, &outbound).await;
                continue;
            }
            Frame::Event(ChatClientMessage::Cancel) => {
                debug!("Cancel received with nothing in flight.");
                continue;
            }
            Frame::Skip => continue,
            Frame::Closed => break,
        };

        send(&outbound, ServerMessage::ResponseStart);
        let operation = chat.send_message(&text, chunk_relay(&outbound));
        let outcome = supervise(operation, &mut socket_rx, &outbound, |m: &ChatClientMessage| {
            *m == ChatClientMessage::Cancel
        })
        .await;
        send(&outbound, ServerMessage::ResponseEnd);

        match outcome {
            Outcome::Finished(Ok(_)) | Outcome::Cancelled => {}
            Outcome::Finished(Err(e)) => {
                warn!(error = %e, "Chat reply failed.");
                send(&outbound, ServerMessage::Error {
                    message: e.to_string(),
                });
            }
            Outcome::Closed => break,
        }
        publish(&chat, &outbound).await;
    }

    drop(outbound);
    writer.await??;
    Ok(())
}

async fn publish(chat: &GeneralChat, outbound: &Outbound) {
    send(outbound, ServerMessage::Conversation {
        messages: chat.messages().await,
        notice: chat.notice().await,
    });
}
