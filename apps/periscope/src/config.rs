use std::time::Duration;

pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_MALFORMED_FRAME_LIMIT: u32 = 8;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for one proxy instance. The engine reads no environment
/// variables; everything arrives through this struct.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Caller-chosen stable identifier, unique within a manager.
    pub id: String,
    /// Upstream origin, e.g. `http://localhost:3000`.
    pub target_url: String,
    /// Port to listen on; 0 lets the OS pick.
    pub listen_port: u16,
    /// Address to bind. Loopback unless explicitly widened.
    pub bind_address: String,
    /// Ring-buffer capacity per session.
    pub buffer_capacity: usize,
    /// Bound on a single log entry's serialized payload.
    pub max_payload_bytes: usize,
    /// Consecutive malformed frames tolerated before a socket is closed.
    pub malformed_frame_limit: u32,
    /// How long `stop` waits for in-flight requests before hard-closing.
    pub drain_timeout: Duration,
    /// Per-frame WebSocket write deadline.
    pub write_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(id: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_url: target_url.into(),
            listen_port: 0,
            bind_address: "127.0.0.1".to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            malformed_frame_limit: DEFAULT_MALFORMED_FRAME_LIMIT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}
