use tracing_subscriber::{fmt, EnvFilter};

/// Env var read first for the log filter; `RUST_LOG` is the fallback.
pub const LOG_ENV: &str = "ACADEMYD_LOG";

/// Installs the global subscriber. Output goes to stderr: stdout carries
/// the JSON-lines protocol.
///
/// Filter precedence: `ACADEMYD_LOG`, then `RUST_LOG`, then `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}
