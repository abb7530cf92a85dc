use serde::{Deserialize, Serialize};

/// Discriminant of a telemetry log entry. Kinds map 1:1 to the `type` field
/// of browser frames; anything unrecognized is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum LogKind {
    Error,
    Performance,
    CustomLog,
    Interactions,
    Mutations,
    Screenshot,
    Sketch,
    DesignState,
    DesignRequest,
    DesignChat,
    Execution,
    PanelMessage,
    Audio,
    Http,
    Other(String),
}

impl LogKind {
    pub fn as_str(&self) -> &str {
        match self {
            LogKind::Error => "error",
            LogKind::Performance => "performance",
            LogKind::CustomLog => "custom_log",
            LogKind::Interactions => "interactions",
            LogKind::Mutations => "mutations",
            LogKind::Screenshot => "screenshot",
            LogKind::Sketch => "sketch",
            LogKind::DesignState => "design_state",
            LogKind::DesignRequest => "design_request",
            LogKind::DesignChat => "design_chat",
            LogKind::Execution => "execution",
            LogKind::PanelMessage => "panel_message",
            LogKind::Audio => "audio",
            LogKind::Http => "http",
            LogKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for LogKind {
    fn from(value: &str) -> Self {
        match value {
            "error" => LogKind::Error,
            "performance" => LogKind::Performance,
            "custom_log" => LogKind::CustomLog,
            "interactions" => LogKind::Interactions,
            "mutations" => LogKind::Mutations,
            "screenshot" => LogKind::Screenshot,
            "sketch" => LogKind::Sketch,
            "design_state" => LogKind::DesignState,
            "design_request" => LogKind::DesignRequest,
            "design_chat" => LogKind::DesignChat,
            "execution" => LogKind::Execution,
            "panel_message" => LogKind::PanelMessage,
            "audio" => LogKind::Audio,
            "http" => LogKind::Http,
            other => LogKind::Other(other.to_string()),
        }
    }
}

impl From<String> for LogKind {
    fn from(value: String) -> Self {
        LogKind::from(value.as_str())
    }
}

impl From<LogKind> for String {
    fn from(kind: LogKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One buffered telemetry record. Sequence numbers are assigned by the
/// owning buffer and are unique within a session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub session_id: String,
    pub kind: LogKind,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl LogEntry {
    /// Builds an entry with the payload bounded to `max_payload_bytes` of
    /// serialized JSON. Oversize payloads are cut down to a string prefix and
    /// flagged; `seq` is left at zero for the buffer to assign.
    pub fn new(
        session_id: &str,
        kind: LogKind,
        payload: serde_json::Value,
        url: Option<String>,
        max_payload_bytes: usize,
    ) -> Self {
        let (payload, truncated) = bound_payload(payload, max_payload_bytes);
        Self {
            seq: 0,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            session_id: session_id.to_string(),
            kind,
            payload,
            truncated,
            url,
        }
    }
}

/// Caps a payload at `max` serialized bytes. Values within the bound pass
/// through untouched; anything larger collapses to a flagged string prefix of
/// its serialization.
fn bound_payload(payload: serde_json::Value, max: usize) -> (serde_json::Value, bool) {
    let serialized = payload.to_string();
    if serialized.len() <= max {
        return (payload, false);
    }
    let mut cut = max.min(serialized.len());
    while cut > 0 && !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    (serde_json::Value::String(serialized[..cut].to_string()), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn kind_round_trips_through_strings() {
        assert_eq!(LogKind::from("custom_log"), LogKind::CustomLog);
        assert_eq!(LogKind::CustomLog.as_str(), "custom_log");
        assert_eq!(LogKind::from("design_state").as_str(), "design_state");

        // Unknown kinds are stored verbatim, not rejected.
        let kind = LogKind::from("frobnicate");
        assert_eq!(kind, LogKind::Other("frobnicate".to_string()));
        assert_eq!(kind.as_str(), "frobnicate");
    }

    #[test_timeout::timeout]
    fn small_payloads_pass_through() {
        let entry = LogEntry::new("sess-a", LogKind::CustomLog, json!({"m": "hi"}), None, 1024);
        assert!(!entry.truncated);
        assert_eq!(entry.payload, json!({"m": "hi"}));
    }

    #[test_timeout::timeout]
    fn oversize_payloads_are_truncated_and_flagged() {
        let big = json!({ "blob": "x".repeat(4096) });
        let entry = LogEntry::new("sess-a", LogKind::Screenshot, big, None, 256);
        assert!(entry.truncated);
        let preview = entry.payload.as_str().expect("truncated payload is a string");
        assert!(preview.len() <= 256);
        assert!(preview.starts_with("{\"blob\""));
    }
}
