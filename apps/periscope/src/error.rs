use thiserror::Error;

/// Errors surfaced at the proxy API boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy {0} already exists")]
    ProxyExists(String),
    #[error("proxy {0} not found")]
    ProxyNotFound(String),
    #[error("proxy manager is shutting down")]
    ShuttingDown,
    #[error("no browser connected for session {0}")]
    NoBrowser(String),
    #[error("execution timed out for session {0}")]
    ExecutionTimeout(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("invalid target URL: {0}")]
    InvalidTarget(#[from] url::ParseError),
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
