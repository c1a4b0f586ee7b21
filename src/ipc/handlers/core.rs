use crate::db;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Opens (creating if needed) the workspace database and drops any session.
/// On failure no workspace is left selected.
pub fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<()> {
    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => {
            state.workspace = None;
            state.db = None;
            state.session = None;
            return Err(e);
        }
    };
    tracing::info!(workspace = %path.display(), "workspace opened");
    state.workspace = Some(path);
    state.db = Some(conn);
    state.session = None;
    Ok(())
}

fn handle_health(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "signedInAs": state.session.as_ref().map(|s| s.role.as_str()),
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return Err(IpcError::bad("missing params.path"));
    };

    open_workspace(state, path.clone()).map_err(|e| IpcError::Db {
        code: "db_open_failed",
        message: format!("{e:#}"),
        table: None,
    })?;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
