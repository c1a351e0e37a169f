//! Streaming transport
//!
//! One WebSocket per session. Server frames are [`Event`]s in emission
//! order, closed right after the terminal event. The only client frame is
//! `{"type":"cancel"}`; closing the socket before the terminal event counts
//! as a cancel.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::SessionError;
use crate::protocol::{ClientMessage, Event};
use crate::session::{EventStream, SessionRegistry, CANCEL_REASON, DISCONNECT_REASON};

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, SessionError> {
    let accepted = state.gateway.registry().cancel(&task_id, CANCEL_REASON)?;
    Ok(Json(json!({ "task_id": task_id, "accepted": accepted })))
}

pub async fn events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, SessionError> {
    // Attach before upgrading so unknown or taken sessions get a plain HTTP error
    let stream = state.gateway.registry().attach(&task_id)?;
    let registry = state.gateway.registry().clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, incoming) = socket.split();
        pump(sink, incoming, stream, registry, task_id).await
    }))
}

/// What to do after a client frame
#[derive(Debug, PartialEq, Eq)]
enum ClientAction {
    Continue,
    /// The client went away
    Hangup,
}

fn on_client_frame(registry: &SessionRegistry, task_id: &str, frame: Message) -> ClientAction {
    match frame {
        Message::Text(text) => {
            match ClientMessage::from_frame(text.as_str()) {
                Ok(ClientMessage::Cancel) => request_cancel(registry, task_id, CANCEL_REASON),
                Err(e) => warn!("[{}] Protocol violation, ignoring client frame: {}", task_id, e),
            }
            ClientAction::Continue
        }
        Message::Close(_) => ClientAction::Hangup,
        Message::Binary(_) => {
            warn!("[{}] Protocol violation, ignoring binary frame", task_id);
            ClientAction::Continue
        }
        Message::Ping(_) | Message::Pong(_) => ClientAction::Continue,
    }
}

fn request_cancel(registry: &SessionRegistry, task_id: &str, reason: &str) {
    match registry.cancel(task_id, reason) {
        Ok(true) => info!("[{}] Cancel requested: {}", task_id, reason),
        Ok(false) => debug!("[{}] Cancel already pending", task_id),
        // The session finished in the meantime
        Err(e) => debug!("[{}] Cancel ignored: {}", task_id, e),
    }
}

/// Forward session events to `sink` and client frames from `incoming`
/// until the terminal event is sent or the client goes away
async fn pump<Si, St, E>(
    mut sink: Si,
    mut incoming: St,
    mut events: EventStream,
    registry: Arc<SessionRegistry>,
    task_id: String,
) where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    debug!("[{}] Stream opened", task_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Session gone without a terminal event
                    warn!("[{}] Event stream ended without a terminal event", task_id);
                    break;
                };
                let terminal = event.is_terminal();
                if !send_event(&mut sink, &task_id, &event).await {
                    request_cancel(&registry, &task_id, DISCONNECT_REASON);
                    break;
                }
                if terminal {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = incoming.next() => {
                let action = match frame {
                    Some(Ok(frame)) => on_client_frame(&registry, &task_id, frame),
                    Some(Err(e)) => {
                        debug!("[{}] Socket error: {}", task_id, e);
                        ClientAction::Hangup
                    }
                    None => ClientAction::Hangup,
                };
                if action == ClientAction::Hangup {
                    request_cancel(&registry, &task_id, DISCONNECT_REASON);
                    break;
                }
            }
        }
    }

    debug!("[{}] Stream closed", task_id);
}

async fn send_event<Si>(sink: &mut Si, task_id: &str, event: &Event) -> bool
where
    Si: Sink<Message> + Unpin,
{
    let frame = match event.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("[{}] Failed to encode {} event: {}", task_id, event.kind(), e);
            return true;
        }
    };
    sink.send(Message::Text(frame.into())).await.is_ok()
}
