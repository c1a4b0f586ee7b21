mod approval;
mod auth;
mod backup;
mod calc;
mod db;
mod fees;
mod ipc;
mod logging;
mod printable;

use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Workspace opened before the first request, if set.
const WORKSPACE_ENV: &str = "ACADEMYD_WORKSPACE";

fn write_line(stdout: &mut io::Stdout, value: &serde_json::Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn main() {
    logging::init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "academyd starting");

    let mut state = ipc::AppState::default();
    if let Some(path) = std::env::var_os(WORKSPACE_ENV).filter(|p| !p.is_empty()) {
        if let Err(e) = ipc::open_workspace(&mut state, PathBuf::from(path)) {
            tracing::error!(error = %format!("{e:#}"), "failed to open workspace from {}", WORKSPACE_ENV);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "malformed request line");
                write_line(
                    &mut stdout,
                    &json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    }),
                );
                continue;
            }
        };

        let span = tracing::info_span!("request", id = %req.id, method = %req.method);
        let _enter = span.enter();
        tracing::debug!("dispatch");
        let resp = ipc::handle_request(&mut state, req);
        write_line(&mut stdout, &resp);
    }

    tracing::info!("stdin closed, shutting down");
}
