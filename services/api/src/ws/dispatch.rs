//! Applies client events to the tutor state machine.

use super::{
    protocol::{ClientMessage, ServerMessage},
    session::{Outbound, send},
};
use tracing::debug;
use vocab_tutor_core::{TutorError, TutorSession};

/// Runs the tutor operation behind `message`. State changes reach the client
/// through the tutor's snapshot channel; streamed text goes to `outbound`.
pub(crate) async fn apply(
    tutor: &mut TutorSession,
    message: ClientMessage,
    outbound: &Outbound,
) -> Result<(), TutorError> {
    debug!(?message, phase = ?tutor.phase(), "Applying client event.");
    match message {
        ClientMessage::Start => {
            let availability = tutor.start().await;
            if let Some(reason) = availability.reason() {
                send(outbound, ServerMessage::Unavailable { reason });
            }
            Ok(())
        }
        ClientMessage::CaptureName { name } => tutor.capture_name(&name).await,
        ClientMessage::ChooseTopic { topic } => tutor.choose_topic(&topic).await,
        ClientMessage::ToggleWord { index } => tutor.toggle_word(index).await,
        ClientMessage::ConfirmSelection => tutor.confirm_selection().await,
        ClientMessage::ViewCard { index } => tutor.view_card(index).await,
        ClientMessage::AttachImage { card_id, image } => tutor.attach_image(card_id, image).await,
        ClientMessage::FinishReview => tutor.finish_review().await,
        ClientMessage::SubmitAnswer { answer } => {
            let result = tutor.submit_answer(&answer).await?;
            debug!(correct = result.is_correct, "Answer graded.");
            Ok(())
        }
        ClientMessage::QuickReply { action } => tutor.quick_reply(action).await,
        ClientMessage::Chat { text } => {
            send(outbound, ServerMessage::ResponseStart);
            let result = tutor.send_free_chat(&text, chunk_relay(outbound)).await;
            send(outbound, ServerMessage::ResponseEnd);
            result.map(|_| ())
        }
        // Handled by the session loop.
        ClientMessage::Cancel => Ok(()),
    }
}

/// Turns the accumulated partial text of a stream into `response_chunk`
/// deltas.
pub(crate) fn chunk_relay(outbound: &Outbound) -> impl FnMut(&str) + Send + '_ {
    let mut sent = 0;
    move |text: &str| {
        if let Some(delta) = text.get(sent..).filter(|delta| !delta.is_empty()) {
            send(outbound, ServerMessage::ResponseChunk {
                chunk: delta.to_string(),
            });
        }
        sent = text.len();
    }
}
