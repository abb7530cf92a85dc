use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::log::{LogEntry, LogKind};
use crate::ring::LogBuffer;

/// First-party cookie carrying the per-tab session identifier.
pub const SESSION_COOKIE: &str = "__devtool_sid";

/// Frame queued for a socket's writer task. `Close` makes the writer emit a
/// clean close frame and exit.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Resolved result of a browser-side code evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
}

struct SocketBinding {
    conn_id: u64,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

/// Telemetry context of one browser tab: its log buffer, at most one bound
/// WebSocket, and the table of executions awaiting a reply.
pub struct Session {
    id: String,
    buffer: LogBuffer,
    max_payload_bytes: usize,
    binding: Mutex<Option<SocketBinding>>,
    pending: DashMap<String, oneshot::Sender<ExecutionOutcome>>,
    last_seen_ms: AtomicI64,
}

impl Session {
    fn new(id: String, buffer_capacity: usize, max_payload_bytes: usize) -> Self {
        Self {
            id,
            buffer: LogBuffer::new(buffer_capacity),
            max_payload_bytes,
            binding: Mutex::new(None),
            pending: DashMap::new(),
            last_seen_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().unwrap().is_some()
    }

    /// Appends a telemetry record, bounding the payload, and returns its
    /// sequence number.
    pub fn append(&self, kind: LogKind, payload: serde_json::Value, url: Option<String>) -> u64 {
        self.touch();
        self.buffer
            .append(LogEntry::new(&self.id, kind, payload, url, self.max_payload_bytes))
    }

    pub(crate) fn sender(&self) -> Option<mpsc::UnboundedSender<OutboundFrame>> {
        self.binding.lock().unwrap().as_ref().map(|b| b.tx.clone())
    }

    pub(crate) fn insert_pending(&self, exec_id: String, tx: oneshot::Sender<ExecutionOutcome>) {
        self.pending.insert(exec_id, tx);
    }

    /// Removes and returns the pending slot for `exec_id`. A second call for
    /// the same id (a late or duplicate reply) comes back empty.
    pub(crate) fn take_pending(&self, exec_id: &str) -> Option<oneshot::Sender<ExecutionOutcome>> {
        self.pending.remove(exec_id).map(|(_, tx)| tx)
    }

    pub(crate) fn remove_pending(&self, exec_id: &str) {
        self.pending.remove(exec_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Point-in-time view of one session for `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub buffered: usize,
    pub connected: bool,
}

/// Per-proxy map of session id to session record. Sessions are never removed
/// implicitly; they outlive WebSocket reconnects and go away only when the
/// owning proxy stops.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    buffer_capacity: usize,
    max_payload_bytes: usize,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(buffer_capacity: usize, max_payload_bytes: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer_capacity,
            max_payload_bytes,
            next_conn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!("session {} created", id);
                Arc::new(Session::new(
                    id.to_string(),
                    self.buffer_capacity,
                    self.max_payload_bytes,
                ))
            })
            .value()
            .clone()
    }

    /// Installs `tx` as the session's current socket, displacing (and cleanly
    /// closing) any prior one. Returns the session and the connection id the
    /// caller must present to `unbind_socket`. Refused once the registry is
    /// closed.
    pub fn bind_socket(
        &self,
        id: &str,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Option<(Arc<Session>, u64)> {
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(OutboundFrame::Close);
            return None;
        }
        let session = self.get_or_create(id);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let displaced = session
            .binding
            .lock()
            .unwrap()
            .replace(SocketBinding { conn_id, tx });
        if let Some(old) = displaced {
            debug!("session {} socket displaced by a new connection", id);
            let _ = old.tx.send(OutboundFrame::Close);
        }
        session.touch();
        Some((session, conn_id))
    }

    /// Clears the binding only if `conn_id` is still current, so a reader
    /// whose socket was displaced cannot tear down its successor.
    pub fn unbind_socket(&self, id: &str, conn_id: u64) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        let mut binding = session.binding.lock().unwrap();
        match binding.as_ref() {
            Some(current) if current.conn_id == conn_id => {
                *binding = None;
                true
            }
            _ => false,
        }
    }

    /// Telemetry ingest: appends to the session's buffer if the session
    /// exists. Late ingests after `close()` are dropped quietly.
    pub fn dispatch(&self, id: &str, kind: LogKind, payload: serde_json::Value, url: Option<String>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.get(id) {
            session.append(kind, payload, url);
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| SessionSummary {
                id: entry.key().clone(),
                buffered: entry.value().buffer.len(),
                connected: entry.value().is_bound(),
            })
            .collect()
    }

    /// Queues `text` on every currently-bound socket; returns how many
    /// sockets accepted it.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut sent = 0;
        for entry in self.sessions.iter() {
            if let Some(tx) = entry.value().sender() {
                if tx.send(OutboundFrame::Text(text.to_string())).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_buffered(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().buffer.len()).sum()
    }

    /// Closes every socket and drops all pending executions. The map itself
    /// is retained so late dispatches are silently ignored.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.sessions.iter() {
            let session = entry.value();
            if let Some(binding) = session.binding.lock().unwrap().take() {
                let _ = binding.tx.send(OutboundFrame::Close);
            }
            session.pending.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Mints a `sess-<base36-time>-<base36-random>` identifier, the same shape
/// the browser script generates on first load.
pub fn mint_session_id() -> String {
    format!("sess-{}", base36_pair())
}

/// Mints an opaque execution id for request/reply correlation.
pub fn mint_exec_id() -> String {
    format!("exec-{}", base36_pair())
}

fn base36_pair() -> String {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let noise: u64 = rand::random();
    format!("{}-{}", to_base36(now), to_base36(noise))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}
