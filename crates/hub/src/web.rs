//! HTTP/WebSocket surface: axum router, per-role upgrade handlers, and the
//! per-connection tasks that drive the Event Hub's typed messaging (§4.3,
//! §6). Structured like `handle_browser_ws`/`handle_agent_ws`: each
//! connection runs its own `tokio::select!` loop over inbound WebSocket
//! frames, its Event Hub outbox, and a ping/pong keepalive.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::time::{interval, Duration, Instant};
use uuid::Uuid;

use wall_protocol::{ClientMessage, ServerMessage, WallHubConfig};

use crate::auth;
use crate::event_hub::{EventHub, Role};
use crate::registry::Registry;
use crate::router;

/// Shared application state.
pub struct AppState {
    pub config: WallHubConfig,
    pub registry: Registry,
    pub hub: EventHub,
}

impl AppState {
    pub fn new(config: WallHubConfig, registry: Registry, hub: EventHub) -> Self {
        Self {
            config,
            registry,
            hub,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let web_root = state.config.server.web_root.clone();
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws/admin", get(admin_ws_upgrade))
        .route("/ws/viewer", get(viewer_ws_upgrade))
        .route("/ws/broadcaster", get(broadcaster_ws_upgrade))
        .with_state(state);

    app.fallback_service(tower_http::services::ServeDir::new(web_root))
}

async fn health_check() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct AdminQuery {
    token: Option<String>,
}

async fn admin_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query.token);

    if !auth::check_admin_token(
        state.config.auth.admin_bearer_token.as_deref(),
        presented.as_deref(),
    ) {
        return (StatusCode::UNAUTHORIZED, "invalid admin token").into_response();
    }

    ws.on_upgrade(move |socket| handle_admin_ws(socket, state)).into_response()
}

async fn viewer_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer_ws(socket, state)).into_response()
}

async fn broadcaster_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_broadcaster_ws(socket, state)).into_response()
}

fn ping_keepalive(state: &AppState) -> (Duration, Duration) {
    (
        Duration::from_secs(state.config.event_hub.ping_interval_seconds),
        Duration::from_secs(state.config.event_hub.pong_timeout_seconds),
    )
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    let Ok(json) = serde_json::to_string(msg) else {
        tracing::error!("failed to serialize outbound message");
        return true;
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

/// Admin connection: bootstraps with the current roster, then relays
/// `clients-update`/`stream-dimensions-update` fan-out and handles
/// `get-clients` / `update-client-config` requests.
async fn handle_admin_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let transport_id = Uuid::new_v4().to_string();
    tracing::info!(%transport_id, "admin connected");
    let mut outbox = state.hub.register(transport_id.clone(), Role::Admin).await;

    let roster = state.registry.snapshot_roster().await;
    if !send_json(&mut socket, &ServerMessage::ClientsUpdate { clients: roster }).await {
        state.hub.unregister(&transport_id).await;
        return;
    }

    let (ping_interval, pong_timeout) = ping_keepalive(&state);
    let mut ping_tick = interval(ping_interval);
    ping_tick.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    tracing::debug!(%transport_id, "admin ping timeout");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = outbox.recv() => {
                let Some(msg) = msg else { break };
                if !send_json(&mut socket, &msg).await {
                    break;
                }
            }
            frame = socket.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_admin_message(&state, &transport_id, &text).await;
                    }
                    Ok(Message::Pong(_)) => last_pong = Instant::now(),
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(&transport_id).await;
    tracing::info!(%transport_id, "admin disconnected");
}

async fn handle_admin_message(state: &AppState, transport_id: &str, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(%transport_id, "bad admin message: {e}");
            state
                .hub
                .send_to(
                    transport_id,
                    ServerMessage::Error {
                        code: "BAD_INPUT".into(),
                        message: e.to_string(),
                    },
                )
                .await;
            return;
        }
    };

    match msg {
        ClientMessage::GetClients {} => {
            let roster = state.registry.snapshot_roster().await;
            state
                .hub
                .send_to(transport_id, ServerMessage::ClientsUpdate { clients: roster })
                .await;
        }
        ClientMessage::UpdateClientConfig { client_id, config } => {
            if let Some(display_name) = config.display_name {
                if let Err(e) = state.registry.set_display_name(&client_id, display_name).await {
                    send_error(state, transport_id, &e).await;
                    return;
                }
            }
            if let Some(region) = config.region {
                if let Err(e) = state.registry.set_region(&client_id, region).await {
                    send_error(state, transport_id, &e).await;
                }
            }
        }
        other => {
            tracing::warn!(%transport_id, ?other, "unexpected message on admin transport");
        }
    }
}

async fn send_error(state: &AppState, transport_id: &str, err: &crate::registry::RegistryError) {
    state
        .hub
        .send_to(
            transport_id,
            ServerMessage::Error {
                code: "UNKNOWN_VIEWER".into(),
                message: err.to_string(),
            },
        )
        .await;
}

/// Viewer connection. The first inbound message MUST be `register-viewer`;
/// anything else is rejected and the socket is closed (§6).
async fn handle_viewer_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let transport_id = Uuid::new_v4().to_string();

    let client_id = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::RegisterViewer { client_id, display_name }) => (client_id, display_name),
            Ok(_) => {
                let _ = send_json(
                    &mut socket,
                    &ServerMessage::Error {
                        code: "BAD_INPUT".into(),
                        message: "expected register-viewer".into(),
                    },
                )
                .await;
                return;
            }
            Err(e) => {
                let _ = send_json(
                    &mut socket,
                    &ServerMessage::Error {
                        code: "BAD_INPUT".into(),
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        },
        _ => return,
    };
    let (client_id, display_name) = client_id;

    tracing::info!(%transport_id, %client_id, "viewer connected");

    // Only one live transport per clientId: kick whatever was there before.
    if let Some(old) = state.hub.transport_id_for_viewer(&client_id).await {
        state.hub.unregister(&old).await;
    }

    let mut outbox = state
        .hub
        .register(transport_id.clone(), Role::Viewer { client_id: client_id.clone() })
        .await;
    state.registry.upsert_viewer(&client_id, &transport_id, display_name).await;

    if let Some(geometry) = state.registry.broadcaster_geometry().await {
        state
            .hub
            .send_to(
                &transport_id,
                ServerMessage::StreamDimensions {
                    width: geometry.width,
                    height: geometry.height,
                },
            )
            .await;
    }

    let (ping_interval, pong_timeout) = ping_keepalive(&state);
    let mut ping_tick = interval(ping_interval);
    ping_tick.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    tracing::debug!(%transport_id, %client_id, "viewer ping timeout");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = outbox.recv() => {
                let Some(msg) = msg else { break };
                if !send_json(&mut socket, &msg).await {
                    break;
                }
            }
            frame = socket.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_viewer_message(&state, &transport_id, &client_id, &text).await;
                    }
                    Ok(Message::Pong(_)) => last_pong = Instant::now(),
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(&transport_id).await;
    state.registry.mark_disconnected(&transport_id).await;
    tracing::info!(%transport_id, %client_id, "viewer disconnected");
}

async fn handle_viewer_message(state: &AppState, transport_id: &str, client_id: &str, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(%transport_id, "bad viewer message: {e}");
            return;
        }
    };

    match msg {
        ClientMessage::GetClientConfig { client_id: requested } => {
            if requested != client_id {
                return;
            }
            if let Some(record) = state.registry.viewer_record(client_id).await {
                state
                    .hub
                    .send_to(transport_id, ServerMessage::ClientConfig { record })
                    .await;
            }
        }
        ClientMessage::ViewerAnswer { sdp } => {
            let broadcaster = state.hub.transport_id_for_broadcaster().await;
            router::forward_viewer_answer(&state.hub, broadcaster.as_deref(), transport_id, sdp).await;
        }
        ClientMessage::ViewerIceCandidate { candidate } => {
            let broadcaster = state.hub.transport_id_for_broadcaster().await;
            router::forward_viewer_ice(&state.hub, broadcaster.as_deref(), transport_id, candidate).await;
        }
        other => {
            tracing::warn!(%transport_id, ?other, "unexpected message on viewer transport");
        }
    }
}

/// Broadcaster connection. The first inbound message MUST be
/// `register-broadcaster`; at most one broadcaster transport is ever live
/// (Invariant 1) — registering replaces and closes any prior one.
async fn handle_broadcaster_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let transport_id = Uuid::new_v4().to_string();

    let geometry = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::RegisterBroadcaster { geometry }) => geometry,
            _ => return,
        },
        _ => return,
    };

    tracing::info!(%transport_id, ?geometry, "broadcaster connected");
    let mut outbox = state.hub.register(transport_id.clone(), Role::Broadcaster).await;
    state.registry.register_broadcaster(&transport_id, geometry).await;

    let (ping_interval, pong_timeout) = ping_keepalive(&state);
    let mut ping_tick = interval(ping_interval);
    ping_tick.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    tracing::debug!(%transport_id, "broadcaster ping timeout");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = outbox.recv() => {
                let Some(msg) = msg else { break };
                if !send_json(&mut socket, &msg).await {
                    break;
                }
            }
            frame = socket.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => {
                        handle_broadcaster_message(&state, &text).await;
                    }
                    Ok(Message::Pong(_)) => last_pong = Instant::now(),
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(&transport_id).await;
    state.registry.mark_disconnected(&transport_id).await;
    tracing::info!(%transport_id, "broadcaster disconnected");
}

async fn handle_broadcaster_message(state: &AppState, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("bad broadcaster message: {e}");
            return;
        }
    };

    match msg {
        ClientMessage::BroadcasterOffer { viewer_transport_id, sdp } => {
            router::forward_broadcaster_offer(&state.hub, &viewer_transport_id, sdp).await;
        }
        ClientMessage::BroadcasterIceCandidate { viewer_transport_id, candidate } => {
            router::forward_broadcaster_ice(&state.hub, &viewer_transport_id, candidate).await;
        }
        other => {
            tracing::warn!(?other, "unexpected message on broadcaster transport");
        }
    }
}
