//! Session lab over WebSocket (`/ws/lab`).
//!
//! A client edits the instructions and sampling of a general session, forces
//! a fresh session with them, and chats against it. Every change is answered
//! with the current settings and the live transcript.

use super::{
    dispatch::chunk_relay,
    protocol::{LabClientMessage, ServerMessage},
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
use vocab_tutor_core::{
    GenerationError, ModelSessionAdapter,
    lab::{LabSettings, SessionLab},
};

/// Axum handler to upgrade an HTTP connection to a session lab WebSocket.
pub async fn lab_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("lab_session", %session_id);
    async move {
        info!("New lab WebSocket connection.");
        if let Err(e) = run_lab_session(socket, state).await {
            error!(error = ?e, "Lab session terminated with error.");
        }
        info!("Lab session finished.");
    }
    .instrument(span)
    .await
}

async fn run_lab_session(socket: WebSocket, state: Arc<AppState>) -> Result<()> {
    let (sink, mut socket_rx) = socket.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, None).in_current_span());

    let lab = SessionLab::new(Arc::new(ModelSessionAdapter::new(state.model.clone())));
    lab.update_settings(LabSettings {
        instructions: state.general_instructions.to_string(),
        ..LabSettings::default()
    })
    .await;

    if let Some(reason) = lab.unavailability_reason().await {
        send(&outbound, ServerMessage::Unavailable { reason });
    }
    publish(&lab, &outbound).await;

    loop {
        let text = match next_frame::<LabClientMessage>(&mut socket_rx, &outbound).await {
            Frame::Event(LabClientMessage::Message { text }) => text,
            Frame::Event(LabClientMessage::UpdateSettings { settings }) => {
                debug!(greedy = settings.greedy, temperature = settings.temperature, "Lab settings updated.");
                lab.update_settings(settings).await;
                publish(&lab, &outbound).await;
                continue;
            }
            Frame::Event(LabClientMessage::ApplySettings) => {
                lab.apply_settings().await;
                publish(&lab, &outbound).await;
                continue;
            }
            Frame::Event(LabClientMessage::Cancel) => {
                debug!("Cancel received with nothing in flight.");
                continue;
            }
            Frame::Skip => continue,
            Frame::Closed => break,
        };

        send(&outbound, ServerMessage::ResponseStart);
        let operation = stream_reply(&lab, &text, &outbound);
        let outcome = supervise(operation, &mut socket_rx, &outbound, |m: &LabClientMessage| {
            *m == LabClientMessage::Cancel
        })
        .await;
        send(&outbound, ServerMessage::ResponseEnd);

        match outcome {
            Outcome::Finished(Ok(_)) | Outcome::Cancelled => {}
            Outcome::Finished(Err(e)) => {
                warn!(error = %e, "Lab reply failed.");
                send(&outbound, ServerMessage::Error {
                    message: e.to_string(),
                });
            }
            Outcome::Closed => break,
        }
        publish(&lab, &outbound).await;
    }

    drop(outbound);
    writer.await??;
    Ok(())
}

/// Sends `text` to the lab and relays the growing reply as `response_chunk`
/// deltas.
async fn stream_reply(
    lab: &SessionLab,
    text: &str,
    outbound: &Outbound,
) -> Result<Option<String>, GenerationError> {
    let mut partial = lab.subscribe_partial();
    let mut relay = chunk_relay(outbound);
    let reply = lab.send_message(text);
    tokio::pin!(reply);
    loop {
        tokio::select! {
            result = &mut reply => {
                // The watch channel only keeps the latest value, so flush
                // whatever it skipped.
                if let Ok(Some(full)) = &result {
                    relay(full);
                }
                return result;
            }
            Ok(()) = partial.changed() => {
                let text = partial.borrow_and_update().clone();
                if !text.is_empty() {
                    relay(&text);
                }
            }
        }
    }
}

async fn publish(lab: &SessionLab, outbound: &Outbound) {
    send(outbound, ServerMessage::Conversation {
        messages: lab.messages().await,
        notice: lab.notice().await,
    });
    send(outbound, ServerMessage::LabState {
        settings: lab.settings().await,
        transcript: lab.transcript().await,
    });
}
