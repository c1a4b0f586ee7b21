use crate::auth::Capability;
use crate::backup;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{require, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

use super::core::open_workspace;

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let out_path = required_str(req, "outPath")?;
    let Some(workspace_path) = state.workspace.clone() else {
        return Err(IpcError::NoWorkspace);
    };
    require(state, Capability::Backup)?;

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let export = backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path))
        .map_err(|e| IpcError::Io(format!("{e:#}")))?;
    tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace bundle exported");
    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256,
    }))
}

/// Replaces the open workspace's database and re-opens it. The session is
/// dropped because the restored user table may differ; a rejected bundle
/// leaves both the database and the session as they were.
fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let in_path = required_str(req, "inPath")?;
    let Some(workspace_path) = state.workspace.clone() else {
        return Err(IpcError::NoWorkspace);
    };
    require(state, Capability::Backup)?;

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(IpcError::NotFound("bundle file"));
    }

    // Drop open handle before replacing file.
    state.db = None;
    let previous_session = state.session.take();

    let imported = backup::import_workspace_bundle(&src, &workspace_path);
    open_workspace(state, workspace_path.clone()).map_err(|e| IpcError::Db {
        code: "db_open_failed",
        message: format!("{e:#}"),
        table: None,
    })?;
    let import = match imported {
        Ok(import) => import,
        Err(e) => {
            let message = format!("{e:#}");
            tracing::warn!(path = %in_path, error = %message, "workspace bundle rejected");
            state.session = previous_session;
            return Err(IpcError::Io(message));
        }
    };

    tracing::info!(
        path = %in_path,
        format = %import.bundle_format_detected,
        "workspace bundle imported"
    );
    Ok(json!({
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "dbSha256": import.db_sha256,
        "signedOut": true,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => handle_export_workspace_bundle(state, req),
        "backup.importWorkspaceBundle" => handle_import_workspace_bundle(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
