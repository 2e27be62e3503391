use axum::{
    extract::{
        rejection::PathRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use repcheck_core::{LandmarkFrame, LandmarkPoint, SessionId, StreamCoordinator, StreamEvent};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{api::ApiError, AppState};

/// Messages a client sends on a per-session socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Frame {
        #[serde(default)]
        landmarks: Option<Vec<LandmarkPoint>>,
    },
    SetExercise {
        exercise_type: String,
    },
}

/// Mirrors the process-wide stream's events.
pub async fn events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.coordinator.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, events))
}

async fn forward_events(socket: WebSocket, mut events: broadcast::Receiver<StreamEvent>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "event socket error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Opens a stream of its own for one workout. The session must exist before
/// the upgrade is accepted.
pub async fn session(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    id: Result<Path<SessionId>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(session_id) = id?;
    let summary = state.sessions.session(session_id).await?;
    let coordinator = state.session_coordinator(&summary.exercise_id)?;
    Ok(ws.on_upgrade(move |socket| run_session(socket, session_id, coordinator)))
}

async fn run_session(socket: WebSocket, session_id: SessionId, coordinator: StreamCoordinator) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = coordinator.subscribe();

    if let Err(err) = coordinator.start(session_id).await {
        let rejected = StreamEvent::Rejected {
            session_id,
            message: err.to_string(),
        };
        let _ = send_event(&mut sender, &rejected).await;
        return;
    }
    tracing::info!(session = session_id, "session socket connected");

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(message) = handle_client_message(&coordinator, &text).await {
                        let rejected = StreamEvent::Rejected { session_id, message };
                        if send_event(&mut sender, &rejected).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(session = session_id, error = %err, "session socket error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(session = session_id, missed, "session socket lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Err(err) = coordinator.stop().await {
        tracing::warn!(session = session_id, error = %err, "failed to stop session stream");
    }
    tracing::info!(session = session_id, "session socket closed");
}

async fn handle_client_message(
    coordinator: &StreamCoordinator,
    text: &str,
) -> Result<(), String> {
    let message: ClientMessage = serde_json::from_str(text).map_err(|err| err.to_string())?;
    let outcome = match message {
        ClientMessage::Frame { landmarks } => coordinator
            .submit(LandmarkFrame::from_detection(landmarks))
            .await
            .map(|_| ()),
        ClientMessage::SetExercise { exercise_type } => {
            coordinator.select_exercise(&exercise_type).map(|_| ())
        }
    };
    outcome.map_err(|err| err.to_string())
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &StreamEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode stream event");
            Ok(())
        }
    }
}
