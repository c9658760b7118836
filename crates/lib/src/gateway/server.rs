//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::exec::SandboxSettings;
use crate::gatekeeper::{Directive, Gatekeeper};
use crate::gateway::protocol::{
    ConnectParams, ExecuteParams, HelloOk, SessionParams, WsRequest, WsResponse,
};
use crate::init;
use crate::policy::PolicyTable;
use crate::session::SessionStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// Build connect.challenge event JSON (nonce + ts). Sent as the first frame after WS open.
fn connect_challenge_event(nonce: &str, ts_ms: u64) -> String {
    serde_json::to_string(&json!({
        "type": "event",
        "event": "connect.challenge",
        "payload": { "nonce": nonce, "ts": ts_ms }
    }))
    .unwrap_or_else(|_| r#"{"type":"event","event":"connect.challenge","payload":{}}"#.to_string())
}

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, gatekeeper, terminal sessions).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients (e.g. shutdown). Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    pub gatekeeper: Gatekeeper,
    pub sessions: Arc<SessionStore>,
}

impl GatewayState {
    /// State with the built-in policy table and sandbox settings from `config.terminal`.
    pub fn new(config: Config) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let gatekeeper = Gatekeeper::new(
            Arc::new(PolicyTable::builtin()),
            SandboxSettings::from_config(&config.terminal),
        );
        let sessions = Arc::new(SessionStore::new(config.terminal.history_limit));
        Self {
            required_token: require_connect_token(&config),
            config: Arc::new(config),
            event_tx,
            gatekeeper,
            sessions,
        }
    }
}

pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or ARCHDASH_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let port = config.gateway.port;
    let state = GatewayState::new(config);
    let event_tx = state.event_tx.clone();
    log::info!(
        "gateway: {} policy entries, working dir {}",
        state.gatekeeper.policies().len(),
        state.gatekeeper.settings().working_dir.display()
    );

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients first.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");

    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

/// GET /ws upgrades to WebSocket. First request must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_response(socket: &mut WebSocket, res: &WsResponse) -> bool {
    let text = serde_json::to_string(res).unwrap_or_default();
    socket.send(Message::Text(text)).await.is_ok()
}

/// Check connect params against the configured token.
fn authenticate(state: &GatewayState, params: &ConnectParams) -> Result<(), &'static str> {
    let Some(ref required) = state.required_token else {
        return Ok(());
    };
    let provided = params.auth.token.as_deref().unwrap_or("").trim();
    if provided.is_empty() {
        return Err("unauthorized: gateway token missing (set ARCHDASH_GATEWAY_TOKEN or gateway.auth.token)");
    }
    if provided != required {
        return Err("unauthorized: gateway token mismatch");
    }
    Ok(())
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut connected = false;
    let mut event_rx = state.event_tx.subscribe();
    // Requests run in their own tasks so a slow command never holds up events or other frames.
    let (res_tx, mut res_rx) = mpsc::unbounded_channel::<WsResponse>();

    let nonce = uuid::Uuid::new_v4().to_string();
    let ts_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    if socket
        .send(Message::Text(connect_challenge_event(&nonce, ts_ms)))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(res) = res_rx.recv() => {
                if !send_response(&mut socket, &res).await {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }

                let res = if req.method == "connect" {
                    match serde_json::from_value::<ConnectParams>(req.params.clone()) {
                        Err(_) => WsResponse::err(&req.id, "invalid connect params"),
                        Ok(params) => match authenticate(&state, &params) {
                            Err(e) => {
                                log::warn!("gateway: rejected connect: {}", e);
                                WsResponse::err(&req.id, e)
                            }
                            Ok(()) => {
                                connected = true;
                                let protocol = params
                                    .max_protocol
                                    .unwrap_or(PROTOCOL_VERSION)
                                    .min(PROTOCOL_VERSION);
                                let hello = HelloOk { typ: "hello-ok".to_string(), protocol };
                                WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})))
                            }
                        },
                    }
                } else if !connected {
                    WsResponse::err(&req.id, "connect required")
                } else {
                    let state = state.clone();
                    let res_tx = res_tx.clone();
                    tokio::spawn(async move {
                        let _ = res_tx.send(handle_request(&state, &req).await);
                    });
                    continue;
                };
                if !send_response(&mut socket, &res).await {
                    break;
                }
            }
        }
    }

    if !connected {
        log::debug!("ws client disconnected before connecting");
    }
}

fn parse_params<T: DeserializeOwned>(req: &WsRequest) -> Result<T, WsResponse> {
    serde_json::from_value(req.params.clone()).map_err(|_| {
        WsResponse::err(&req.id, format!("invalid {} params", req.method))
    })
}

/// Dispatch one request from a connected client.
async fn handle_request(state: &GatewayState, req: &WsRequest) -> WsResponse {
    match req.method.as_str() {
        "health" => WsResponse::ok(
            &req.id,
            json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
            }),
        ),
        "status" => {
            let auth_mode = if state.required_token.is_some() {
                "token"
            } else {
                "none"
            };
            let settings = state.gatekeeper.settings();
            WsResponse::ok(
                &req.id,
                json!({
                    "runtime": "running",
                    "protocol": PROTOCOL_VERSION,
                    "port": state.config.gateway.port,
                    "bind": state.config.gateway.bind,
                    "auth": auth_mode,
                    "policyEntries": state.gatekeeper.policies().len(),
                    "sessions": state.sessions.len().await,
                    "workingDir": settings.working_dir,
                    "maxOutputBytes": settings.max_output_bytes,
                }),
            )
        }
        "terminal.open" => {
            let session_id = state.sessions.create().await;
            WsResponse::ok(&req.id, json!({ "sessionId": session_id }))
        }
        "terminal.execute" => {
            let params: ExecuteParams = match parse_params(req) {
                Ok(p) => p,
                Err(res) => return res,
            };
            if let Some(ref id) = params.session_id {
                if !state.sessions.exists(id).await {
                    return WsResponse::err(&req.id, "session not found");
                }
            }
            let result = state.gatekeeper.execute(&params.command).await;
            if let Some(ref id) = params.session_id {
                let recorded = match result.special {
                    Some(Directive::Clear) => state.sessions.clear(id).await,
                    Some(Directive::Exit) => {
                        state.sessions.close(id).await;
                        Ok(())
                    }
                    None => {
                        state
                            .sessions
                            .record(id, params.command.trim(), result.clone())
                            .await
                    }
                };
                if let Err(e) = recorded {
                    log::debug!("gateway: session {} gone while executing: {}", id, e);
                }
            }
            let mut payload = serde_json::to_value(&result).unwrap_or(json!({}));
            if let (Some(obj), Some(id)) = (payload.as_object_mut(), params.session_id) {
                obj.insert("sessionId".to_string(), json!(id));
            }
            WsResponse::ok(&req.id, payload)
        }
        "terminal.history" => {
            let params: SessionParams = match parse_params(req) {
                Ok(p) => p,
                Err(res) => return res,
            };
            match state.sessions.get(&params.session_id).await {
                Some(session) => WsResponse::ok(
                    &req.id,
                    json!({
                        "sessionId": session.id,
                        "createdAt": session.created_at,
                        "entries": session.history,
                    }),
                ),
                None => WsResponse::err(&req.id, "session not found"),
            }
        }
        "terminal.close" => {
            let params: SessionParams = match parse_params(req) {
                Ok(p) => p,
                Err(res) => return res,
            };
            let closed = state.sessions.close(&params.session_id).await;
            WsResponse::ok(&req.id, json!({ "closed": closed }))
        }
        "terminal.help" => WsResponse::ok(&req.id, json!({ "text": state.gatekeeper.help_text() })),
        "policy.list" => {
            let entries: Vec<_> = state.gatekeeper.policies().entries().collect();
            WsResponse::ok(&req.id, json!({ "entries": entries }))
        }
        _ => WsResponse::err(&req.id, format!("unknown method: {}", req.method)),
    }
}
