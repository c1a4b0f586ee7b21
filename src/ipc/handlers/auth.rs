use crate::auth::{self, Role};
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, required_str, session};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};

fn session_json(s: &Session) -> Value {
    json!({
        "userId": s.user_id,
        "name": s.name,
        "email": s.email,
        "role": s.role.as_str(),
    })
}

fn handle_login(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let email = auth::normalize_email(&required_str(req, "email")?)
        .map_err(|_| IpcError::InvalidCredentials)?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IpcError::bad("missing password"))?
        .to_string();

    let conn = db_conn(state)?;
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT id, name, role, password_salt, password_hash FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(IpcError::query)?;
    let Some((user_id, name, role_raw, salt, hash)) = row else {
        return Err(IpcError::InvalidCredentials);
    };
    if !auth::verify_password(&salt, &password, &hash) {
        tracing::warn!(email = %email, "login rejected");
        return Err(IpcError::InvalidCredentials);
    }
    let role = Role::parse(&role_raw).ok_or_else(|| IpcError::Db {
        code: "db_query_failed",
        message: format!("stored role is not recognised: {}", role_raw),
        table: Some("users"),
    })?;

    let s = Session {
        user_id,
        name,
        email,
        role,
    };
    let out = session_json(&s);
    tracing::info!(user = %s.user_id, role = s.role.as_str(), "signed in");
    state.session = Some(s);
    Ok(out)
}

fn handle_logout(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let was_signed_in = state.session.take().is_some();
    Ok(json!({ "signedOut": was_signed_in }))
}

fn handle_whoami(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let s = session(state)?;
    Ok(session_json(&s))
}

fn handle_change_password(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let current = req
        .params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IpcError::bad("missing currentPassword"))?;
    let next = req
        .params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IpcError::bad("missing newPassword"))?;
    auth::validate_password(next)?;

    let (salt, hash): (String, String) = conn
        .query_row(
            "SELECT password_salt, password_hash FROM users WHERE id = ?",
            [&me.user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(IpcError::query)?;
    if !auth::verify_password(&salt, current, &hash) {
        return Err(IpcError::InvalidCredentials);
    }

    let new_salt = auth::new_salt();
    conn.execute(
        "UPDATE users SET password_salt = ?, password_hash = ? WHERE id = ?",
        (&new_salt, auth::hash_password(&new_salt, next), &me.user_id),
    )
    .map_err(|e| IpcError::update("users", e))?;
    Ok(json!({ "changed": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "auth.login" => handle_login(state, req),
        "auth.logout" => handle_logout(state, req),
        "auth.whoami" => handle_whoami(state, req),
        "auth.changePassword" => handle_change_password(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
