use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::SignalMessage;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::service::RoomService;

/// Landing page served for every room; the WebSocket URL is substituted in.
const ROOM_PAGE: &str = include_str!("room.html");

/// Shared application state.
pub struct AppState {
    pub service: Arc<RoomService>,
}

/// Build the Axum router with all routes. Anything unmatched falls through
/// to the default 404.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_redirect))
        .route("/room/{id}", get(room_page))
        .route("/websocket/room/{id}", get(room_ws_upgrade))
        .with_state(state)
}

/// GET / - every visitor gets a fresh room.
async fn index_redirect() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, format!("/room/{}", Uuid::new_v4()))],
    )
}

/// GET /room/:id - ensure the room exists and serve the landing page.
async fn room_page(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Html<String> {
    state.service.create_or_get_room(&room_id).await;

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let ws_url = format!("ws://{host}/websocket/room/{room_id}");
    // JSON-encode so the URL lands in the script as a proper string literal
    // whatever the room id contains.
    let ws_literal = serde_json::to_string(&ws_url).unwrap_or_else(|_| "\"\"".to_string());
    Html(ROOM_PAGE.replace("__WS_URL__", &ws_literal))
}

/// GET /websocket/room/:id - signaling WebSocket upgrade.
async fn room_ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::info!(room = %room_id, "signaling WebSocket upgrade");
    let service = Arc::clone(&state.service);
    ws.max_message_size(65_536) // 64KB max for signaling messages
        .on_upgrade(move |socket| handle_signaling_ws(socket, room_id, service))
}

/// Pump one peer's signaling: spawn the coordinator's send-listener onto
/// the (mutex-guarded) write half, then feed inbound frames to the peer
/// until the socket or the protocol gives up. Teardown closes the peer and
/// cancels the listener on every path.
async fn handle_signaling_ws(socket: WebSocket, room_id: String, service: Arc<RoomService>) {
    let room = service.create_or_get_room(&room_id).await;
    let peer = match service.init_peer_connection(&room).await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!(room = %room_id, "failed to init peer connection: {e:#}");
            return;
        }
    };
    let peer_id = peer.id();
    tracing::info!(room = %room_id, peer = %peer_id, "peer connected to signaling");

    let (sink, mut stream) = socket.split();
    // Concurrent producers (send-listener, error paths) never interleave
    // frames: every write goes through this mutex.
    let sink = Arc::new(Mutex::new(sink));
    let cancel = CancellationToken::new();

    {
        let sink = Arc::clone(&sink);
        peer.coordinator().listen_send_events(
            cancel.clone(),
            Box::new(move |event| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    let frame =
                        match serde_json::to_string(&SignalMessage::new(event.event, event.data)) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!("failed to encode signaling frame: {e}");
                                return;
                            }
                        };
                    let mut sink = sink.lock().await;
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        tracing::debug!("signaling send failed: {e}");
                    }
                })
            }),
        );
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(raw)) => {
                let msg: SignalMessage = match serde_json::from_str(&raw) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(peer = %peer_id, "malformed signaling message: {e}");
                        break;
                    }
                };
                if let Err(e) = peer.handle_event(&msg.event, &msg.data).await {
                    tracing::warn!(peer = %peer_id, event = %msg.event, "signaling event failed: {e:#}");
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // Only text frames carry signaling
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(peer = %peer_id, "signaling read failed: {e}");
                break;
            }
        }
    }

    cancel.cancel();
    if let Err(e) = peer.close().await {
        tracing::warn!(peer = %peer_id, "failed to close peer: {e:#}");
    }
    room.remove_peer(peer_id).await;
    tracing::info!(room = %room_id, peer = %peer_id, "peer left signaling");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_router() -> Router {
        build_router(Arc::new(AppState {
            service: Arc::new(RoomService::new()),
        }))
    }

    #[tokio::test]
    async fn index_redirects_to_a_fresh_room() {
        let response = test_router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        let room_id = location.strip_prefix("/room/").unwrap();
        assert!(Uuid::parse_str(room_id).is_ok());
    }

    #[tokio::test]
    async fn room_page_carries_the_websocket_url() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/room/abc123")
                    .header(header::HOST, "meet.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8(body.to_vec()).unwrap();
        assert!(page.contains("ws://meet.example.com/websocket/room/abc123"));
        assert!(!page.contains("__WS_URL__"));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
