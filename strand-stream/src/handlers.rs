use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use strand_core::error::{SessionError, StrandError};
use strand_core::event::{EventEnvelope, StreamEvent};

use crate::broadcaster::{ChannelSubscriber, DeliveryError, Subscriber};
use crate::state::StreamState;
use crate::types::{ConfirmRequest, ConfirmResponse, ErrorResponse, TaskAccepted, TaskRequest};

const SSE_BUFFER: usize = 256;

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Websocket connection as a broadcast subscriber.
struct SocketSubscriber {
    out: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl Subscriber for SocketSubscriber {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), DeliveryError> {
        let text =
            serde_json::to_string(envelope).map_err(|e| DeliveryError::Other(e.to_string()))?;
        self.out
            .send(Message::Text(text.into()))
            .map_err(|_| DeliveryError::Closed)
    }
}

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<StreamState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: StreamState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let subscriber_id = state
        .broadcaster()
        .add(Arc::new(SocketSubscriber {
            out: out_tx.clone(),
        }))
        .await;

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(subscriber_id, error = %err, "websocket receive error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let request = parse_prompt_frame(text.as_str());
                if request.prompt.trim().is_empty() {
                    send_direct(&out_tx, "", StreamEvent::error("prompt is required"));
                    continue;
                }
                let session_id = state.submit(request.session_id, request.prompt).await;
                tracing::debug!(subscriber_id, session_id = %session_id, "prompt received over websocket");
            }
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            Message::Binary(_) | Message::Pong(_) => {}
        }
    }

    state.broadcaster().remove(subscriber_id).await;
    drop(out_tx);
    let _ = writer.await;
}

/// A text frame is either a JSON task request or the bare prompt.
fn parse_prompt_frame(text: &str) -> TaskRequest {
    serde_json::from_str::<TaskRequest>(text).unwrap_or_else(|_| TaskRequest {
        prompt: text.to_string(),
        session_id: None,
    })
}

fn send_direct(out: &mpsc::UnboundedSender<Message>, session_id: &str, event: StreamEvent) {
    match serde_json::to_string(&EventEnvelope::new(session_id, event)) {
        Ok(text) => {
            let _ = out.send(Message::Text(text.into()));
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode websocket event"),
    }
}

/// GET /api/v1/events: the same broadcast as the websocket, over SSE.
#[instrument(skip(state))]
pub async fn events_handler(State(state): State<StreamState>) -> Response {
    let (subscriber, rx) = ChannelSubscriber::new(SSE_BUFFER);
    state.broadcaster().add(Arc::new(subscriber)).await;

    let stream = ReceiverStream::new(rx).map(|envelope| {
        let event = Event::default().event(envelope.event.kind());
        Ok::<_, Infallible>(match event.json_data(&envelope) {
            Ok(event) => event,
            Err(_) => Event::default().data("{\"type\":\"error\",\"payload\":{\"err\":\"encode failed\"}}"),
        })
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// POST /api/v1/tasks
#[instrument(skip(state, body))]
pub async fn submit_task_handler(
    State(state): State<StreamState>,
    Json(body): Json<TaskRequest>,
) -> Response {
    if body.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty_prompt", "prompt is required");
    }
    let session_id = state.submit(body.session_id, body.prompt).await;
    (StatusCode::ACCEPTED, Json(TaskAccepted::new(session_id))).into_response()
}

/// POST /api/v1/tool-calls/{id}/confirm
#[instrument(skip(state, body))]
pub async fn confirm_tool_call_handler(
    State(state): State<StreamState>,
    Path(id): Path<String>,
    Json(body): Json<ConfirmRequest>,
) -> Response {
    if !state.runner().confirm(&id, body.outcome).await {
        return error_response(
            StatusCode::NOT_FOUND,
            "confirmation_not_found",
            &format!("no tool call '{id}' is awaiting confirmation"),
        );
    }
    (
        StatusCode::OK,
        Json(ConfirmResponse {
            id,
            outcome: body.outcome,
        }),
    )
        .into_response()
}

/// POST /api/v1/sessions/{id}/compress
#[instrument(skip(state))]
pub async fn compress_session_handler(
    State(state): State<StreamState>,
    Path(id): Path<String>,
) -> Response {
    match state.runner().compress(&id).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(StrandError::Session(SessionError::NotFound(_))) => error_response(
            StatusCode::NOT_FOUND,
            "session_not_found",
            &format!("session '{id}' not found"),
        ),
        Err(StrandError::Session(err @ SessionError::NothingToCompress)) => {
            error_response(StatusCode::CONFLICT, "nothing_to_compress", &err.to_string())
        }
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "compression_failed",
            &err.to_string(),
        ),
    }
}

/// POST /api/v1/sessions/{id}/cancel
#[instrument(skip(state))]
pub async fn cancel_session_handler(
    State(state): State<StreamState>,
    Path(id): Path<String>,
) -> Response {
    if state.cancel(&id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "session_not_running",
            &format!("session '{id}' has no turn in flight"),
        )
    }
}

/// GET /healthz
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<StreamState>) -> Response {
    (StatusCode::OK, Json(state.health().await)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::to_bytes;
    use strand_core::tool_call::ConfirmationOutcome;

    use crate::state::tests::echo_state;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn task_is_accepted_and_streamed_out_of_band() {
        let state = echo_state();
        let (sub, mut rx) = ChannelSubscriber::new(16);
        state.broadcaster().add(Arc::new(sub)).await;

        let response = submit_task_handler(
            State(state.clone()),
            Json(TaskRequest {
                prompt: "build it".into(),
                session_id: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "task accepted");
        let session_id = body["sessionId"].as_str().expect("session id").to_string();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("in time")
            .expect("event");
        assert_eq!(first.session_id, session_id);
        let wire = serde_json::to_value(&first).expect("encode");
        assert_eq!(wire["type"], "streaming_started");
        assert_eq!(wire["sessionId"], session_id.as_str());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let response = submit_task_handler(
            State(echo_state()),
            Json(TaskRequest {
                prompt: "   ".into(),
                session_id: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "empty_prompt");
    }

    #[tokio::test]
    async fn confirmation_for_unknown_call_is_not_found() {
        let state = echo_state();
        let missing = confirm_tool_call_handler(
            State(state.clone()),
            Path("other".into()),
            Json(ConfirmRequest {
                outcome: ConfirmationOutcome::Cancel,
            }),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let found = confirm_tool_call_handler(
            State(state),
            Path("known".into()),
            Json(ConfirmRequest {
                outcome: ConfirmationOutcome::ProceedOnce,
            }),
        )
        .await;
        assert_eq!(found.status(), StatusCode::OK);
        let body = body_json(found).await;
        assert_eq!(body["id"], "known");
        assert_eq!(body["outcome"], "proceed_once");
    }

    #[tokio::test]
    async fn compressing_unknown_session_is_not_found() {
        let response =
            compress_session_handler(State(echo_state()), Path("missing".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "session_not_found");
    }

    #[tokio::test]
    async fn cancelling_idle_session_is_not_found() {
        let response = cancel_session_handler(State(echo_state()), Path("idle".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = health_handler(State(echo_state())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["subscribers"], 0);
    }

    #[test]
    fn frames_accept_json_or_bare_text() {
        let json = parse_prompt_frame(r#"{"prompt":"hi","sessionId":"s-1"}"#);
        assert_eq!(json.prompt, "hi");
        assert_eq!(json.session_id.as_deref(), Some("s-1"));

        let bare = parse_prompt_frame("list the files");
        assert_eq!(bare.prompt, "list the files");
        assert!(bare.session_id.is_none());
    }

    #[tokio::test]
    async fn socket_subscriber_writes_text_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = SocketSubscriber { out: tx };
        sub.deliver(&EventEnvelope::new("s", StreamEvent::StreamingStarted {}))
            .await
            .expect("delivered");
        match rx.recv().await {
            Some(Message::Text(text)) => {
                let value: serde_json::Value =
                    serde_json::from_str(text.as_str()).expect("json frame");
                assert_eq!(value["type"], "streaming_started");
                assert_eq!(value["sessionId"], "s");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        drop(rx);
        assert_eq!(
            sub.deliver(&EventEnvelope::new("s", StreamEvent::StreamingStarted {}))
                .await,
            Err(DeliveryError::Closed)
        );
    }
}
