use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Path, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dl_agent::ServerFrame;

use crate::error::ApiErrorResponse;
use crate::state::AppState;

fn is_websocket_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// `GET /agent/{id}` serves both the metadata and the agent's socket; an
/// upgrade request gets the socket.
pub async fn agent_or_upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    let agent = match state.bridge.get_agent(&id).await {
        Ok(agent) => agent,
        Err(err) => return ApiErrorResponse::from(err).into_response(),
    };

    let (mut parts, _body) = request.into_parts();
    if !is_websocket_request(&parts.headers) {
        return Json(agent).into_response();
    }

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::warn!(agent_id = %id, "WebSocket upgrade rejected: {}", rejection.body_text());
            return rejection.into_response();
        }
    };
    tracing::info!(agent_id = %id, "WebSocket upgrade accepted");
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    let Ok(text) = serde_json::to_string(frame) else {
        return true;
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: AppState, agent_id: String) {
    let (connection, mut frames) = match state.bridge.connect(&agent_id).await {
        Ok(attached) => attached,
        Err(err) => {
            send_frame(&mut socket, &ServerFrame::error(err.to_string())).await;
            return;
        }
    };
    tracing::info!(agent_id = %agent_id, connection, "WebSocket connection established");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state
                            .bridge
                            .handle_client_text(&agent_id, connection, text.as_str())
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(agent_id = %agent_id, "WebSocket receive failed: {}", err);
                        break;
                    }
                    _ => continue,
                }
            }

            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    // The agent was deleted or the server is shutting down.
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    state.bridge.disconnect(&agent_id, connection).await;
    tracing::info!(agent_id = %agent_id, connection, "WebSocket connection closed");
}
