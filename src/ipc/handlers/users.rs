use crate::auth::{self, Capability, Role};
use crate::db;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, optional_str, require, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn user_count(conn: &Connection) -> Result<i64, IpcError> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(IpcError::query)
}

/// The very first account may be created without a session and must be an admin.
fn handle_users_create(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let name = required_str(req, "name")?;
    let email = auth::normalize_email(&required_str(req, "email")?)?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| IpcError::bad("missing password"))?;
    auth::validate_password(password)?;
    let role_raw = required_str(req, "role")?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        IpcError::bad_with(
            "role must be one of: admin, supervisor, accountant, parent",
            json!({ "role": role_raw }),
        )
    })?;
    let phone = optional_str(req, "phone")?;

    if user_count(conn)? == 0 {
        if role != Role::Admin {
            return Err(IpcError::bad("the first account must be an admin"));
        }
    } else {
        require(state, Capability::ManageUsers)?;
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO users(id, name, email, role, phone, password_salt, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &name,
            &email,
            role.as_str(),
            &phone,
            &salt,
            auth::hash_password(&salt, password),
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| match IpcError::insert("users", e) {
        IpcError::Conflict(_) => IpcError::Conflict(format!("email already registered: {}", email)),
        other => other,
    })?;

    tracing::info!(user = %user_id, role = role.as_str(), "user created");
    Ok(json!({
        "userId": user_id,
        "name": name,
        "email": email,
        "role": role.as_str(),
    }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageUsers)?;
    let role = match optional_str(req, "role")? {
        None => None,
        Some(r) => Some(
            Role::parse(&r)
                .ok_or_else(|| IpcError::bad("role must be one of: admin, supervisor, accountant, parent"))?,
        ),
    };

    let mut stmt = conn
        .prepare(
            "SELECT
               u.id, u.name, u.email, u.role, u.phone, u.created_at,
               (SELECT COUNT(*) FROM students s WHERE s.parent_id = u.id) AS child_count
             FROM users u
             WHERE (?1 IS NULL OR u.role = ?1)
             ORDER BY u.name",
        )
        .map_err(IpcError::query)?;
    let users = stmt
        .query_map([role.map(Role::as_str)], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "phone": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "childCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    Ok(json!({ "users": users }))
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::ManageUsers)?;
    let user_id = required_str(req, "userId")?;
    if user_id == me.user_id {
        return Err(IpcError::Conflict("you cannot delete your own account".into()));
    }
    if !crate::ipc::helpers::exists(conn, "SELECT 1 FROM users WHERE id = ?", &user_id)? {
        return Err(IpcError::NotFound("user"));
    }

    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    let unlinked = tx
        .execute(
            "UPDATE students SET parent_id = NULL WHERE parent_id = ?",
            [&user_id],
        )
        .map_err(|e| IpcError::update("students", e))?;
    tx.execute("DELETE FROM notifications WHERE user_id = ?", [&user_id])
        .map_err(|e| IpcError::delete("notifications", e))?;
    tx.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| IpcError::delete("users", e))?;
    tx.commit().map_err(IpcError::tx)?;

    tracing::info!(user = %user_id, unlinked, "user deleted");
    Ok(json!({ "deleted": true, "studentsUnlinked": unlinked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "users.create" => handle_users_create(state, req),
        "users.list" => handle_users_list(state, req),
        "users.delete" => handle_users_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
