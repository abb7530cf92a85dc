use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

use crate::bundle;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::inject::{should_inject, InjectStream};
use crate::log::LogKind;
use crate::registry::{
    mint_exec_id, mint_session_id, ExecutionOutcome, OutboundFrame, Session, SessionRegistry,
    SESSION_COOKIE,
};

/// Reserved path for the browser telemetry WebSocket; never forwarded.
pub const METRICS_PATH: &str = "/__devtool_metrics";

/// Lifecycle of one proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Point-in-time statistics for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub id: String,
    pub target_url: String,
    pub listen_addr: Option<String>,
    pub state: ProxyState,
    pub uptime_ms: u64,
    pub total_requests: u64,
    pub sessions: usize,
    pub buffered_entries: usize,
}

/// Incoming telemetry frame. Unknown `type` values are accepted and stored
/// verbatim.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// One listening reverse proxy bound to one upstream target: forwards HTTP,
/// rewrites HTML responses, owns the session registry, and correlates
/// server-to-browser execution requests with their replies.
pub struct ProxyInstance {
    id: String,
    target: Url,
    config: ProxyConfig,
    registry: Arc<SessionRegistry>,
    client: reqwest::Client,
    state: Mutex<ProxyState>,
    bound_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    request_seq: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ProxyInstance {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let target = Url::parse(&config.target_url)?;
        if target.host_str().is_none() {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "target {} has no host",
                config.target_url
            )));
        }
        // The proxy must hand redirects back to the browser untouched.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            id: config.id.clone(),
            target,
            registry: Arc::new(SessionRegistry::new(
                config.buffer_capacity,
                config.max_payload_bytes,
            )),
            client,
            state: Mutex::new(ProxyState::Starting),
            bound_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            serve_task: Mutex::new(None),
            request_seq: AtomicU64::new(0),
            started_at: Mutex::new(None),
            config,
        })
    }

    /// Binds the listener and starts serving. A busy requested port falls
    /// back to an OS-assigned one; the actually bound address is recorded on
    /// the instance.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        if *self.state.lock().unwrap() != ProxyState::Starting {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "proxy {} already started",
                self.id
            )));
        }

        let bind_address = self.config.bind_address.as_str();
        let listener = match TcpListener::bind((bind_address, self.config.listen_port)).await {
            Ok(listener) => listener,
            Err(err)
                if err.kind() == std::io::ErrorKind::AddrInUse && self.config.listen_port != 0 =>
            {
                warn!(
                    "port {} busy for proxy {}, asking the OS for a free one",
                    self.config.listen_port, self.id
                );
                match TcpListener::bind((bind_address, 0)).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        *self.state.lock().unwrap() = ProxyState::Stopped;
                        return Err(ProxyError::Bind(err));
                    }
                }
            }
            Err(err) => {
                *self.state.lock().unwrap() = ProxyState::Stopped;
                return Err(ProxyError::Bind(err));
            }
        };
        let addr = listener.local_addr().map_err(ProxyError::Bind)?;
        *self.bound_addr.lock().unwrap() = Some(addr);

        let router = self.router();
        let token = self.shutdown.clone();
        let id = self.id.clone();
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await });
        let handle = tokio::spawn(async move {
            if let Err(err) = serve.await {
                warn!("proxy {} server exited: {}", id, err);
            }
        });
        *self.serve_task.lock().unwrap() = Some(handle);
        *self.started_at.lock().unwrap() = Some(Instant::now());
        *self.state.lock().unwrap() = ProxyState::Running;
        info!("proxy {} listening on {} -> {}", self.id, addr, self.target);
        Ok(())
    }

    /// Graceful stop: stop accepting, close every telemetry socket, drain
    /// in-flight requests up to the configured deadline, then hard-close
    /// whatever remains. Idempotent; the listener is released before this
    /// returns.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ProxyState::Stopped | ProxyState::Stopping => return,
                _ => *state = ProxyState::Stopping,
            }
        }
        info!("proxy {} stopping", self.id);
        self.shutdown.cancel();
        self.registry.close();
        let task = self.serve_task.lock().unwrap().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.config.drain_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("proxy {} drain deadline exceeded, hard-closing", self.id);
                task.abort();
                let _ = task.await;
            }
        }
        *self.state.lock().unwrap() = ProxyState::Stopped;
        info!("proxy {} stopped", self.id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_url(&self) -> &Url {
        &self.target
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProxyState::Running
    }

    /// The session registry this instance owns; the external log-reading
    /// surface (`list`, per-session `snapshot`/`since`) hangs off it.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ProxyStats {
        let uptime_ms = self
            .started_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        ProxyStats {
            id: self.id.clone(),
            target_url: self.target.to_string(),
            listen_addr: self.listen_addr().map(|addr| addr.to_string()),
            state: self.state(),
            uptime_ms,
            total_requests: self.request_seq.load(Ordering::Relaxed),
            sessions: self.registry.session_count(),
            buffered_entries: self.registry.total_buffered(),
        }
    }

    /// Dispatches `code` to the session's browser and waits for the matching
    /// reply frame. Fails synchronously with `NoBrowser` when no socket is
    /// bound; on deadline the pending record is removed and any later reply
    /// is discarded.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        deadline: Duration,
    ) -> Result<ExecutionOutcome, ProxyError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| ProxyError::NoBrowser(session_id.to_string()))?;
        let tx = session
            .sender()
            .ok_or_else(|| ProxyError::NoBrowser(session_id.to_string()))?;

        let exec_id = mint_exec_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        session.insert_pending(exec_id.clone(), reply_tx);

        let frame = json!({ "type": "execute", "id": exec_id, "code": code }).to_string();
        if tx.send(OutboundFrame::Text(frame)).is_err() {
            session.remove_pending(&exec_id);
            return Err(ProxyError::NoBrowser(session_id.to_string()));
        }

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Pending table torn down underneath us: socket gone or proxy
            // stopping.
            Ok(Err(_)) => Err(ProxyError::NoBrowser(session_id.to_string())),
            Err(_) => {
                session.remove_pending(&exec_id);
                Err(ProxyError::ExecutionTimeout(session_id.to_string()))
            }
        }
    }

    /// Advisory status frame for browser-side UI; no reply expected. Returns
    /// the number of sockets reached.
    pub fn broadcast_activity(&self, active: bool) -> usize {
        let frame = json!({ "type": "activity", "payload": { "active": active } }).to_string();
        self.registry.broadcast(&frame)
    }

    /// Toast notification for every connected tab.
    pub fn broadcast_toast(
        &self,
        kind: &str,
        title: &str,
        message: &str,
        duration_ms: Option<u64>,
    ) -> usize {
        let mut payload = json!({ "type": kind, "title": title, "message": message });
        if let Some(ms) = duration_ms {
            payload["duration"] = json!(ms);
        }
        let frame = json!({ "type": "toast", "payload": payload }).to_string();
        self.registry.broadcast(&frame)
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(METRICS_PATH, get(metrics_handler))
            .fallback(forward_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// The forwarding pipeline for everything that is not the reserved
    /// telemetry endpoint.
    async fn forward(&self, req: Request, remote: SocketAddr) -> Response {
        let started = Instant::now();
        self.request_seq.fetch_add(1, Ordering::Relaxed);

        let (parts, body) = req.into_parts();
        let cookie_sid = session_cookie(&parts.headers);
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();

        let mut upstream_url = self.target.clone();
        upstream_url.set_path(parts.uri.path());
        upstream_url.set_query(parts.uri.query());

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        append_forwarded_headers(&mut headers, &parts.headers, remote);

        let mut builder = self
            .client
            .request(method.clone(), upstream_url.as_str())
            .headers(headers);
        // Only attach a body the client actually declared; a streamed empty
        // body would turn plain GETs into chunked requests.
        let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
            || parts.headers.contains_key(header::TRANSFER_ENCODING);
        if has_body {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let request = match builder.build() {
            Ok(request) => request,
            Err(err) => {
                let diagnostic =
                    ProxyError::UpstreamUnavailable(format!("{} (target: {})", err, self.target));
                return (StatusCode::BAD_GATEWAY, diagnostic.to_string()).into_response();
            }
        };

        let upstream = match self.client.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                let diagnostic = self.upstream_diagnostic(&err);
                warn!("proxy {} forward {} {} failed: {}", self.id, method, path, diagnostic);
                if let Some(sid) = cookie_sid.as_deref() {
                    self.registry.dispatch(
                        sid,
                        LogKind::Http,
                        json!({
                            "method": method.as_str(),
                            "path": path,
                            "status": StatusCode::BAD_GATEWAY.as_u16(),
                            "duration_ms": started.elapsed().as_millis() as u64,
                        }),
                        None,
                    );
                }
                return (StatusCode::BAD_GATEWAY, diagnostic).into_response();
            }
        };

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        self.rewrite_location(&mut response_headers);

        let sid = match cookie_sid {
            Some(sid) => sid,
            None => {
                let sid = mint_session_id();
                let cookie = format!("{SESSION_COOKIE}={sid}; Path=/; SameSite=Lax");
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    response_headers.append(header::SET_COOKIE, value);
                }
                sid
            }
        };
        let session = self.registry.get_or_create(&sid);
        session.append(
            LogKind::Http,
            json!({
                "method": method.as_str(),
                "path": path,
                "status": status.as_u16(),
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
            None,
        );

        let content_type = response_headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let html = should_inject(content_type);
        let encoding = response_headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let identity = encoding.is_empty() || encoding == "identity";

        let body = if html && identity {
            // Length changes under injection; force chunked transfer.
            response_headers.remove(header::CONTENT_LENGTH);
            Body::from_stream(InjectStream::new(upstream.bytes_stream(), bundle::snippet()))
        } else {
            if html {
                warn!(
                    "proxy {}: {} HTML response passed through without instrumentation",
                    self.id, encoding
                );
            }
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    fn upstream_diagnostic(&self, err: &reqwest::Error) -> String {
        let detail = if err.is_connect() {
            format!("cannot connect to {}; is the dev server running?", self.target)
        } else if err.is_timeout() {
            format!("request to {} timed out", self.target)
        } else {
            format!("{} (target: {})", err, self.target)
        };
        ProxyError::UpstreamUnavailable(detail).to_string()
    }

    /// Redirects that point at the upstream get steered back through the
    /// proxy so the browser never escapes instrumentation.
    fn rewrite_location(&self, headers: &mut HeaderMap) {
        let Some(location) = headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };
        // Relative redirects already stay on the proxy host.
        let Ok(mut url) = Url::parse(location) else {
            return;
        };
        if url.host_str() != self.target.host_str()
            || url.port_or_known_default() != self.target.port_or_known_default()
        {
            return;
        }
        let Some(addr) = self.listen_addr() else {
            return;
        };
        let _ = url.set_scheme("http");
        let _ = url.set_host(Some("localhost"));
        let _ = url.set_port(Some(addr.port()));
        if let Ok(value) = HeaderValue::from_str(url.as_str()) {
            headers.insert(header::LOCATION, value);
        }
    }

    /// Bridges a non-reserved WebSocket upgrade through to the origin.
    async fn bridge_websocket(self: Arc<Self>, upgrade: WebSocketUpgrade, req: Request) -> Response {
        let mut upstream_url = self.target.clone();
        let scheme = if self.target.scheme() == "https" { "wss" } else { "ws" };
        let _ = upstream_url.set_scheme(scheme);
        upstream_url.set_path(req.uri().path());
        upstream_url.set_query(req.uri().query());

        let upstream = match tokio_tungstenite::connect_async(upstream_url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!("websocket pass-through to {} failed: {}", upstream_url, err);
                let diagnostic = ProxyError::UpstreamUnavailable(format!(
                    "websocket upgrade to {} failed: {}",
                    upstream_url, err
                ));
                return (StatusCode::BAD_GATEWAY, diagnostic.to_string()).into_response();
            }
        };
        upgrade.on_upgrade(move |client| pump_websocket(client, upstream))
    }

    /// Read loop for one telemetry socket. Identity comes from the handshake
    /// cookie when present, else the first frame's `session_id`, else a fresh
    /// mint.
    async fn run_metrics_socket(self: Arc<Self>, socket: WebSocket, cookie_sid: Option<String>) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let write_deadline = self.config.write_timeout;

        // Single writer per socket; every outbound frame funnels through the
        // channel, so callers never race on the sink.
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        match tokio::time::timeout(write_deadline, ws_tx.send(Message::Text(text)))
                            .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break,
                            Err(_) => {
                                warn!("telemetry socket write deadline exceeded, dropping socket");
                                break;
                            }
                        }
                    }
                    OutboundFrame::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let mut bound: Option<(Arc<Session>, u64)> = None;
        if let Some(sid) = cookie_sid {
            bound = self.registry.bind_socket(&sid, tx.clone());
        }

        let mut malformed = 0u32;
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = tx.send(OutboundFrame::Close);
                    break;
                }
                incoming = ws_rx.next() => {
                    let Some(Ok(message)) = incoming else { break };
                    match message {
                        Message::Text(text) => match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(frame) => {
                                malformed = 0;
                                if !self.ingest_frame(&mut bound, &tx, frame) {
                                    break;
                                }
                            }
                            Err(err) => {
                                malformed += 1;
                                warn!("dropping malformed telemetry frame: {}", err);
                                if malformed >= self.config.malformed_frame_limit {
                                    warn!("closing telemetry socket after {} malformed frames", malformed);
                                    let _ = tx.send(OutboundFrame::Close);
                                    break;
                                }
                            }
                        },
                        Message::Binary(blob) => {
                            let payload = json!({
                                "bytes": BASE64.encode(&blob),
                                "length": blob.len(),
                            });
                            if let Some(session) = self.ensure_bound(&mut bound, &tx, None) {
                                session.append(LogKind::Audio, payload, None);
                            } else {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
            }
        }

        if let Some((session, conn_id)) = bound {
            self.registry.unbind_socket(session.id(), conn_id);
            debug!("telemetry socket for session {} disconnected", session.id());
        }
        drop(tx);
        let _ = writer.await;
    }

    /// Resolves the session for an unbound socket, minting an identifier if
    /// the peer never supplied one. Returns `None` when the registry has
    /// already closed.
    fn ensure_bound(
        &self,
        bound: &mut Option<(Arc<Session>, u64)>,
        tx: &mpsc::UnboundedSender<OutboundFrame>,
        frame_sid: Option<&str>,
    ) -> Option<Arc<Session>> {
        if let Some((session, _)) = bound.as_ref() {
            return Some(session.clone());
        }
        let sid = frame_sid
            .map(str::to_string)
            .unwrap_or_else(mint_session_id);
        let pair = self.registry.bind_socket(&sid, tx.clone())?;
        let session = pair.0.clone();
        *bound = Some(pair);
        Some(session)
    }

    /// Stores one parsed frame; execution replies additionally resolve their
    /// pending record. Returns false when the socket should close.
    fn ingest_frame(
        &self,
        bound: &mut Option<(Arc<Session>, u64)>,
        tx: &mpsc::UnboundedSender<OutboundFrame>,
        frame: InboundFrame,
    ) -> bool {
        let Some(session) = self.ensure_bound(bound, tx, frame.session_id.as_deref()) else {
            return false;
        };
        let kind = LogKind::from(frame.kind.as_str());
        if kind == LogKind::Execution {
            self.resolve_execution(&session, &frame.data);
        }
        session.append(kind, frame.data, frame.url);
        true
    }

    fn resolve_execution(&self, session: &Session, data: &serde_json::Value) {
        let Some(exec_id) = data.get("exec_id").and_then(|value| value.as_str()) else {
            warn!("execution reply without exec_id dropped");
            return;
        };
        let Some(reply) = session.take_pending(exec_id) else {
            debug!("late execution reply {} dropped", exec_id);
            return;
        };
        let outcome = ExecutionOutcome {
            result: data.get("result").cloned().unwrap_or(serde_json::Value::Null),
            error: data
                .get("error")
                .and_then(|value| value.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            duration_ms: data.get("duration").and_then(|value| value.as_i64()).unwrap_or(0),
        };
        let _ = reply.send(outcome);
    }
}

async fn metrics_handler(
    State(instance): State<Arc<ProxyInstance>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cookie_sid = session_cookie(&headers);
    ws.on_upgrade(move |socket| instance.run_metrics_socket(socket, cookie_sid))
}

async fn forward_handler(
    State(instance): State<Arc<ProxyInstance>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    if let Some(upgrade) = ws {
        return instance.bridge_websocket(upgrade, req).await;
    }
    instance.forward(req, remote).await
}

async fn pump_websocket(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let Some(converted) = client_to_upstream(message) else {
                continue;
            };
            if upstream_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };
    let to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(converted) = upstream_to_client(message) else {
                continue;
            };
            if client_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };
    tokio::join!(to_upstream, to_client);
}

fn client_to_upstream(message: Message) -> Option<tungstenite::Message> {
    match message {
        Message::Text(text) => Some(tungstenite::Message::text(text)),
        Message::Binary(data) => Some(tungstenite::Message::binary(data)),
        Message::Ping(data) => Some(tungstenite::Message::Ping(data.into())),
        Message::Pong(data) => Some(tungstenite::Message::Pong(data.into())),
        Message::Close(_) => Some(tungstenite::Message::Close(None)),
    }
}

fn upstream_to_client(message: tungstenite::Message) -> Option<Message> {
    match message {
        tungstenite::Message::Text(text) => Some(Message::Text(text.to_string())),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data.to_vec())),
        tungstenite::Message::Ping(data) => Some(Message::Ping(data.to_vec())),
        tungstenite::Message::Pong(data) => Some(Message::Pong(data.to_vec())),
        tungstenite::Message::Close(_) => Some(Message::Close(None)),
        tungstenite::Message::Frame(_) => None,
    }
}

/// Reads the session identifier from a request's `Cookie` header.
pub(crate) fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.trim().to_string())
    })
}

/// Headers that describe one hop, not the end-to-end exchange. Both legs
/// strip them, after dropping anything the `Connection` header names.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(',').map(|name| name.trim().to_ascii_lowercase()))
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_headers(headers: &mut HeaderMap, original: &HeaderMap, remote: SocketAddr) {
    let client_ip = remote.ip().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Some(host) = original.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
}
