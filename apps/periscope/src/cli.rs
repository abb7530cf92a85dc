use clap::Parser;

/// Instrumenting reverse proxy for front-end development.
#[derive(Debug, Parser)]
#[command(name = "periscope", version, about)]
pub struct Cli {
    /// Upstream origin to proxy, e.g. http://localhost:3000
    pub target: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 0)]
    pub port: u16,

    /// Stable identifier for this proxy
    #[arg(long, default_value = "dev")]
    pub id: String,

    /// Address to bind the listener to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Telemetry entries kept per browser session
    #[arg(long, default_value_t = periscope::config::DEFAULT_BUFFER_CAPACITY)]
    pub buffer_size: usize,
}
