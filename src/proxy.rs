//! Proxy Boundary (C6): HTTP forwarder and WebSocket relay. The two
//! concurrent pumps per WS connection, cancel-on-either-close shape is
//! grounded on the teacher's `proxy.rs`/`runtime.rs` CONNECT-tunnel
//! relay; the transport itself is `axum` (client-facing) and
//! `reqwest`/`tokio-tungstenite` (upstream-facing) rather than the
//! teacher's raw socket plumbing, per `SPEC_FULL.md` §1.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message as AxumMessage;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::routing::get;
use futures_util::SinkExt;
use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use url::Url;

use crate::cli::Mode;
use crate::error::ProxyError;
use crate::http_gate::CheckResult;
use crate::http_gate::HttpGate;
use crate::state::SharedAllowlist;
use crate::ws_filter::WsFilter;

/// Matches the HTTP client's timeout budget declared in spec §5.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_WS_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Request-side hop-by-hop headers, reproduced verbatim from the
/// reference implementation's `HOP_BY_HOP_HEADERS`.
const REQUEST_HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Response-side set: the request-side set plus `content-length` and
/// `content-encoding`, because `reqwest` already decompressed the body
/// and axum re-encodes the outgoing response with its own framing.
const RESPONSE_HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "content-encoding",
];

pub struct AppState {
    pub mode: Mode,
    pub ha_url: Url,
    pub allowlist: SharedAllowlist,
    http_client: reqwest::Client,
}

impl AppState {
    pub fn new(mode: Mode, ha_url: Url, allowlist: SharedAllowlist) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TOTAL_TIMEOUT)
            .build()?;
        Ok(Self {
            mode,
            ha_url,
            allowlist,
            http_client,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(any(catch_all))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(json!({
        "status": "healthy",
        "mode": state.mode.as_str(),
        "ha_url": state.ha_url.as_str(),
    }))
    .into_response()
}

/// Single entry point for every other path and method: dispatches to
/// the WebSocket relay on an upgrade request, otherwise to the HTTP
/// forwarder.
async fn catch_all(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
    body: Bytes,
) -> Response {
    match ws {
        Some(upgrade) => handle_websocket(state, uri, upgrade).await,
        None => handle_http(state, method, uri, headers, body).await,
    }
}

async fn handle_http(state: Arc<AppState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();

    if matches!(state.mode, Mode::Limit) {
        let check = state
            .allowlist
            .with_read(|allowlist| HttpGate::new(allowlist).check_request(&path, method.as_str(), &query));
        if !check.allowed {
            return deny_response(&check);
        }
    }

    let mut target = state.ha_url.clone();
    target.set_path(&path);
    target.set_query(if query.is_empty() { None } else { Some(&query) });

    let mut request = state.http_client.request(method, target.as_str());
    for (name, value) in headers.iter() {
        if !REQUEST_HOP_BY_HOP.contains(&name.as_str()) {
            request = request.header(name, value);
        }
    }
    request = request.body(body.to_vec());

    let response = match request.send().await {
        Ok(response) => response,
        Err(source) => {
            let err = ProxyError::Upstream(source);
            tracing::error!(%err, path, "upstream request failed");
            return (StatusCode::BAD_GATEWAY, axum::Json(json!({"error": err.to_string()}))).into_response();
        }
    };

    let status = response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if !RESPONSE_HOP_BY_HOP.contains(&name.as_str()) {
            response_headers.insert(name.clone(), value.clone());
        }
    }
    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(source) => {
            let err = ProxyError::Upstream(source);
            tracing::error!(%err, path, "failed reading upstream response body");
            return (StatusCode::BAD_GATEWAY, axum::Json(json!({"error": err.to_string()}))).into_response();
        }
    };

    if let Some(content_type) = response_headers.get(axum::http::header::CONTENT_TYPE) {
        if let Ok(content_type) = content_type.to_str() {
            state.allowlist.learn_from_response(content_type, &body);
        }
    }
    state.allowlist.learn_from_request(&path, if query.is_empty() { None } else { Some(&query) });

    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        *headers_mut = response_headers;
    }
    #[allow(clippy::expect_used)]
    builder.body(Body::from(body)).expect("status and headers already validated by reqwest/axum")
}

fn deny_response(check: &CheckResult) -> Response {
    (StatusCode::FORBIDDEN, axum::Json(json!({"error": check.reason}))).into_response()
}

async fn handle_websocket(state: Arc<AppState>, uri: Uri, upgrade: WebSocketUpgrade) -> Response {
    let mut upstream_url = state.ha_url.clone();
    let scheme = if upstream_url.scheme() == "https" { "wss" } else { "ws" };
    #[allow(clippy::expect_used)]
    upstream_url.set_scheme(scheme).expect("ws/wss are valid schemes for any base url");
    upstream_url.set_path(uri.path());
    upstream_url.set_query(uri.query());

    upgrade.max_frame_size(MAX_WS_FRAME_BYTES).on_upgrade(move |socket| async move {
        relay_websocket(state, upstream_url, socket).await;
    })
}

/// Two sibling pumps, client→upstream and upstream→client, wired
/// through `tokio::select!` so that either side completing or
/// erroring cancels the other and closes both sockets. The client
/// sink is owned by a single writer task fed through a channel, since
/// both the client→upstream pump (policy-deny error frames) and the
/// upstream→client pump (filtered server frames) need to write to it.
async fn relay_websocket(state: Arc<AppState>, upstream_url: Url, client_socket: WebSocket) {
    let ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
        max_frame_size: Some(MAX_WS_FRAME_BYTES),
        ..Default::default()
    };
    let (upstream_stream, _response) =
        match tokio_tungstenite::connect_async_with_config(upstream_url.as_str(), Some(ws_config), false).await {
        Ok(pair) => pair,
        Err(source) => {
            let err = ProxyError::WsHandshake(source);
            tracing::error!(%err, "upstream websocket handshake failed");
            let mut client_socket = client_socket;
            let _ = client_socket
                .send(AxumMessage::Close(Some(CloseFrame {
                    code: 1011,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (mut client_sink, mut client_stream) = client_socket.split();
    let (mut upstream_sink, mut upstream_stream) = upstream_stream.split();
    let (to_client_tx, mut to_client_rx) = tokio::sync::mpsc::unbounded_channel::<AxumMessage>();

    // The connection-scoped filter state (pending request ids, active
    // entity subscriptions) is consulted from both directions and
    // therefore needs its own lock, distinct from the allowlist's.
    let filter = parking_lot::Mutex::new(WsFilter::new());

    let client_writer = async {
        while let Some(message) = to_client_rx.recv().await {
            if client_sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = client_sink.close().await;
    };

    let client_to_upstream = async {
        while let Some(message) = client_stream.next().await {
            let Ok(message) = message else { break };
            let forward = match message {
                AxumMessage::Text(text) => client_text_to_upstream(&state, &filter, &text, &to_client_tx),
                AxumMessage::Binary(data) => {
                    if matches!(state.mode, Mode::Limit) {
                        tracing::warn!("blocked binary websocket frame");
                        None
                    } else {
                        Some(UpstreamMessage::Binary(data.to_vec().into()))
                    }
                }
                AxumMessage::Ping(data) => Some(UpstreamMessage::Ping(data.to_vec().into())),
                AxumMessage::Pong(data) => Some(UpstreamMessage::Pong(data.to_vec().into())),
                AxumMessage::Close(_) => None,
            };
            if let Some(forward) = forward {
                if upstream_sink.send(forward).await.is_err() {
                    break;
                }
            }
        }
        let _ = upstream_sink.close().await;
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_stream.next().await {
            let Ok(message) = message else { break };
            let forward = match message {
                UpstreamMessage::Text(text) => server_text_to_client(&state, &filter, &text.to_string()),
                UpstreamMessage::Binary(data) => Some(AxumMessage::Binary(data.to_vec().into())),
                UpstreamMessage::Ping(data) => Some(AxumMessage::Ping(data.to_vec().into())),
                UpstreamMessage::Pong(data) => Some(AxumMessage::Pong(data.to_vec().into())),
                UpstreamMessage::Close(_) | UpstreamMessage::Frame(_) => None,
            };
            if let Some(forward) = forward {
                if to_client_tx.send(forward).is_err() {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = client_writer => {}
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

/// Client→upstream text frame handling: filter in limit mode (pushing
/// a policy-deny frame back to the client writer on rejection), learn
/// in learn mode, per spec §4.6's "text frames pass through C5 (or C4
/// in learn mode)".
fn client_text_to_upstream(
    state: &Arc<AppState>,
    filter: &parking_lot::Mutex<WsFilter>,
    text: &str,
    to_client_tx: &tokio::sync::mpsc::UnboundedSender<AxumMessage>,
) -> Option<UpstreamMessage> {
    match &state.allowlist {
        SharedAllowlist::Limit(allowlist) => {
            let (allowed, error_frame) = filter.lock().filter_client_message(allowlist, text);
            if !allowed {
                if let Some(frame) = error_frame {
                    let _ = to_client_tx.send(AxumMessage::Text(frame.into()));
                }
                return None;
            }
            Some(UpstreamMessage::Text(text.to_string().into()))
        }
        SharedAllowlist::Learn(_) => {
            state.allowlist.learn_from_websocket_message(text);
            Some(UpstreamMessage::Text(text.to_string().into()))
        }
    }
}

/// Upstream→client text frame handling. Mirrors `client_text_to_upstream`:
/// only one of filtering (limit mode) or learning (learn mode) ever
/// applies to a given connection, never both.
fn server_text_to_client(state: &Arc<AppState>, filter: &parking_lot::Mutex<WsFilter>, text: &str) -> Option<AxumMessage> {
    match &state.allowlist {
        SharedAllowlist::Limit(allowlist) => {
            filter.lock().filter_server_message(allowlist, text).map(|t| AxumMessage::Text(t.into()))
        }
        SharedAllowlist::Learn(_) => {
            state.allowlist.learn_from_websocket_message(text);
            Some(AxumMessage::Text(text.to_string().into()))
        }
    }
}

pub async fn run(bind_host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind_host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    let router = build_router(state.clone()).layer(tower_http::trace::TraceLayer::new_for_http());
    let result = axum::serve(listener, router.into_make_service()).await;
    state.allowlist.save_on_shutdown();
    result.map_err(Into::into)
}
