//! Manages the WebSocket connection lifecycle for a tutor session.
//!
//! Every connection owns its own session adapter and tutor. Outgoing traffic
//! goes through a single writer task; the read loop applies one client event
//! at a time and keeps reading while it runs, so a `cancel` or a close frame
//! can abort it.

use super::{
    dispatch,
    protocol::{ClientMessage, ServerMessage},
};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;
use vocab_tutor_core::{ModelSessionAdapter, TutorSession, TutorSnapshot};

/// Queue of messages for the writer task.
pub(crate) type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Axum handler to upgrade an HTTP connection to a tutor WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("tutor_session", %session_id);
    async move {
        info!("New tutor WebSocket connection.");
        if let Err(e) = run_tutor_session(socket, state).await {
            error!(error = ?e, "Tutor session terminated with error.");
        }
        info!("Tutor session finished.");
    }
    .instrument(span)
    .await
}

async fn run_tutor_session(socket: WebSocket, state: Arc<AppState>) -> Result<()> {
    let (sink, mut socket_rx) = socket.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
    let writer = tokio::spawn(write_loop(sink, outbound_rx, Some(snapshot_rx)).in_current_span());

    let adapter = Arc::new(ModelSessionAdapter::new(state.model.clone()));
    let mut tutor = TutorSession::new(adapter)
        .with_instructions_template(state.tutor_template.as_str())
        .with_updates(snapshot_tx);

    loop {
        let message = match next_frame::<ClientMessage>(&mut socket_rx, &outbound).await {
            Frame::Event(ClientMessage::Cancel) => {
                debug!("Cancel received with nothing in flight.");
                continue;
            }
            Frame::Event(message) => message,
            Frame::Skip => continue,
            Frame::Closed => break,
        };

        let operation = dispatch::apply(&mut tutor, message, &outbound);
        let outcome = supervise(operation, &mut socket_rx, &outbound, |m: &ClientMessage| {
            *m == ClientMessage::Cancel
        })
        .await;
        match outcome {
            Outcome::Finished(Ok(())) => {}
            Outcome::Finished(Err(e)) => {
                warn!(error = %e, phase = ?tutor.phase(), "Tutor operation rejected.");
                send(&outbound, ServerMessage::Error {
                    message: e.to_string(),
                });
            }
            Outcome::Cancelled => tutor.recover_cancelled().await,
            Outcome::Closed => break,
        }
    }

    // Dropping the tutor and the outbound queue lets the writer drain and exit.
    drop(tutor);
    drop(outbound);
    writer.await??;
    info!("WebSocket connection closed.");
    Ok(())
}

pub(crate) enum Frame<T> {
    Event(T),
    /// Nothing to act on (pings, binary data, malformed JSON).
    Skip,
    Closed,
}

/// Reads the next client event from the socket.
pub(crate) async fn next_frame<T: DeserializeOwned>(
    socket_rx: &mut SplitStream<WebSocket>,
    outbound: &Outbound,
) -> Frame<T> {
    match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<T>(&text) {
            Ok(event) => Frame::Event(event),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed client message.");
                send(outbound, ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                });
                Frame::Skip
            }
        },
        Some(Ok(Message::Binary(_))) => {
            warn!("Ignoring binary message from client.");
            Frame::Skip
        }
        Some(Ok(Message::Close(_))) => {
            info!("Client sent close frame. Shutting down session.");
            Frame::Closed
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Frame::Skip,
        Some(Err(e)) => {
            error!("Error receiving from client WebSocket: {:?}", e);
            Frame::Closed
        }
        None => Frame::Closed,
    }
}

pub(crate) enum Outcome<R> {
    Finished(R),
    Cancelled,
    Closed,
}

/// Drives `operation` to completion while still reading the socket. Other
/// events are answered with `busy`; a cancel event or a closed socket drops
/// the operation.
pub(crate) async fn supervise<T, R>(
    operation: impl Future<Output = R>,
    socket_rx: &mut SplitStream<WebSocket>,
    outbound: &Outbound,
    is_cancel: impl Fn(&T) -> bool,
) -> Outcome<R>
where
    T: DeserializeOwned,
{
    tokio::pin!(operation);
    loop {
        tokio::select! {
            result = &mut operation => return Outcome::Finished(result),
            frame = next_frame::<T>(socket_rx, outbound) => match frame {
                Frame::Event(event) if is_cancel(&event) => {
                    info!("In-flight operation cancelled by client.");
                    return Outcome::Cancelled;
                }
                Frame::Event(_) => send(outbound, ServerMessage::Busy),
                Frame::Skip => {}
                Frame::Closed => return Outcome::Closed,
            }
        }
    }
}

/// Queues `message` for the writer task.
pub(crate) fn send(outbound: &Outbound, message: ServerMessage) {
    if outbound.send(message).is_err() {
        warn!("Failed to queue server message: writer task stopped.");
    }
}

/// Serializes queued messages onto the socket. Snapshots are written first
/// so clients see a state change before the messages that follow it.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    mut snapshots: Option<mpsc::Receiver<TutorSnapshot>>,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            Some(state) = next_snapshot(&mut snapshots) => ServerMessage::Snapshot { state },
            Some(message) = outbound.recv() => message,
            else => break,
        };
        send_msg(&mut sink, message).await?;
    }
    let _ = sink.close().await;
    Ok(())
}

async fn next_snapshot(snapshots: &mut Option<mpsc::Receiver<TutorSnapshot>>) -> Option<TutorSnapshot> {
    match snapshots {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
async fn send_msg(socket_tx: &mut SplitSink<WebSocket, Message>, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
