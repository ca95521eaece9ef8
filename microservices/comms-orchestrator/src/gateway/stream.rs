//! Bidirectional audio stream
//!
//! The Telephony Provider connects a WebSocket per call and exchanges
//! JSON frames: `media` carries base64 mu-law audio both ways, `mark`
//! delimits caller utterances, `stop` ends the stream. Outbound frames
//! drain the session's bounded queue in push order, so wire order
//! always matches synthesis completion order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use dastak_core::{CallId, CommsError};
use dastak_telephony_sdk::StreamFrame;

use crate::orchestrator::CallEvent;
use crate::session::CallSession;

use super::{ApiError, GatewayState};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "callId")]
    call_id: String,
    #[serde(default)]
    token: Option<String>,
}

pub async fn stream_ws(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.as_deref().unwrap_or("");
    if token != state.stream_token {
        state.auth_failures.fetch_add(1, Ordering::Relaxed);
        return Err(CommsError::Auth("stream token invalid".into()).into());
    }

    let call_id = CallId::new(query.call_id);
    let Some(session) = state.orchestrator.store().get(&call_id) else {
        return Err(CommsError::NotFound(format!("call {call_id}")).into());
    };

    info!(call_id = %call_id, "Audio stream connected");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session)))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, session: Arc<CallSession>) {
    let (mut sink, mut stream) = socket.split();

    // Writer: drain the session's outbound queue in order.
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_session.cancel.cancelled() => break,
                frame = writer_session.outbound.next() => {
                    let frames = StreamFrame::media_frames(&frame);
                    for media in frames {
                        if sink.send(Message::Text(media.to_json().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        let _ = sink.send(Message::Text(StreamFrame::Stop.to_json().into())).await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match StreamFrame::parse(&text) {
                Ok(StreamFrame::Start { stream_id, .. }) => {
                    debug!(call_id = %session.call_id, stream_id = %stream_id, "Stream started");
                }
                Ok(frame @ StreamFrame::Media { .. }) => match frame.media_bytes() {
                    Ok(audio) => on_inbound_media(&state, &session, &audio).await,
                    Err(e) => warn!(call_id = %session.call_id, error = %e, "Bad media frame"),
                },
                Ok(StreamFrame::Mark { name }) => {
                    debug!(call_id = %session.call_id, mark = %name, "Utterance mark");
                    let audio = session.take_inbound();
                    if !audio.is_empty() {
                        state
                            .orchestrator
                            .deliver(&session.call_id, CallEvent::Audio { audio })
                            .await;
                    }
                }
                Ok(StreamFrame::Stop) => {
                    state
                        .orchestrator
                        .deliver(&session.call_id, CallEvent::Hangup)
                        .await;
                    break;
                }
                Err(e) => {
                    warn!(call_id = %session.call_id, error = %e, "Unparseable stream frame");
                }
            },
            Ok(Message::Binary(bytes)) => on_inbound_media(&state, &session, &bytes).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    info!(call_id = %session.call_id, "Audio stream closed");
}

/// Caller audio. Speaking while prompts are still queued is barge-in:
/// outbound audio stops immediately and the machine listens.
async fn on_inbound_media(state: &Arc<GatewayState>, session: &Arc<CallSession>, audio: &[u8]) {
    if session.outbound.queued() > 0 {
        state
            .orchestrator
            .deliver(&session.call_id, CallEvent::Interrupt)
            .await;
    }
    session.buffer_inbound(audio);
    session.touch();
}
