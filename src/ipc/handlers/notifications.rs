use crate::auth::{Capability, Role};
use crate::db;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, optional_bool, optional_str, require, required_str, session};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use super::setup;

const LIST_DEFAULT_LIMIT: i64 = 50;
const LIST_MAX_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Info,
    Success,
    Warning,
    Error,
}

impl Kind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "success" => Some(Self::Success),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

pub struct Draft<'a> {
    pub title: &'a str,
    pub message: &'a str,
    pub kind: Kind,
    pub link: Option<&'a str>,
}

/// Stores one notification and trims the recipient's oldest entries past the cap.
pub fn push(conn: &Connection, user_id: &str, draft: &Draft<'_>) -> Result<String, IpcError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notifications(id, user_id, title, message, kind, read, link, created_at)
         VALUES(?, ?, ?, ?, ?, 0, ?, ?)",
        (
            &id,
            user_id,
            draft.title,
            draft.message,
            draft.kind.as_str(),
            draft.link,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| IpcError::insert("notifications", e))?;

    let cap = setup::max_notifications_per_user(conn)?;
    conn.execute(
        "DELETE FROM notifications
         WHERE user_id = ?1 AND id NOT IN (
           SELECT id FROM notifications
           WHERE user_id = ?1
           ORDER BY created_at DESC, rowid DESC
           LIMIT ?2
         )",
        (user_id, cap),
    )
    .map_err(|e| IpcError::delete("notifications", e))?;
    Ok(id)
}

/// Notifies the linked parent, if any. Returns whether a row was written.
pub fn push_to_parent_of(
    conn: &Connection,
    student_id: &str,
    draft: &Draft<'_>,
) -> Result<bool, IpcError> {
    let parent = crate::ipc::helpers::student_parent(conn, student_id)?;
    match parent {
        Some(parent_id) => {
            push(conn, &parent_id, draft)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn notification_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "title": row.get::<_, String>(1)?,
        "message": row.get::<_, String>(2)?,
        "kind": row.get::<_, String>(3)?,
        "read": row.get::<_, i64>(4)? != 0,
        "link": row.get::<_, Option<String>>(5)?,
        "createdAt": row.get::<_, String>(6)?,
    }))
}

fn unread_count(conn: &Connection, user_id: &str) -> Result<i64, IpcError> {
    conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
        [user_id],
        |r| r.get(0),
    )
    .map_err(IpcError::query)
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let unread_only = optional_bool(req, "unreadOnly")?.unwrap_or(false);
    let limit = match req.params.get("limit") {
        None => LIST_DEFAULT_LIMIT,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=LIST_MAX_LIMIT).contains(&n) => n,
            _ => {
                return Err(IpcError::bad(format!(
                    "limit must be an integer in 1..={}",
                    LIST_MAX_LIMIT
                )))
            }
        },
    };

    let sql = if unread_only {
        "SELECT id, title, message, kind, read, link, created_at
         FROM notifications
         WHERE user_id = ? AND read = 0
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?"
    } else {
        "SELECT id, title, message, kind, read, link, created_at
         FROM notifications
         WHERE user_id = ?
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?"
    };
    let mut stmt = conn.prepare(sql).map_err(IpcError::query)?;
    let items = stmt
        .query_map((&me.user_id, limit), notification_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    Ok(json!({
        "notifications": items,
        "unreadCount": unread_count(conn, &me.user_id)?,
    }))
}

fn handle_unread_count(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    Ok(json!({ "unreadCount": unread_count(conn, &me.user_id)? }))
}

fn handle_mark_read(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let id = required_str(req, "notificationId")?;
    let changed = conn
        .execute(
            "UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?",
            (&id, &me.user_id),
        )
        .map_err(|e| IpcError::update("notifications", e))?;
    if changed == 0 {
        return Err(IpcError::NotFound("notification"));
    }
    Ok(json!({ "unreadCount": unread_count(conn, &me.user_id)? }))
}

fn handle_mark_all_read(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let changed = conn
        .execute(
            "UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0",
            [&me.user_id],
        )
        .map_err(|e| IpcError::update("notifications", e))?;
    Ok(json!({ "marked": changed, "unreadCount": 0 }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let id = required_str(req, "notificationId")?;
    let changed = conn
        .execute(
            "DELETE FROM notifications WHERE id = ? AND user_id = ?",
            (&id, &me.user_id),
        )
        .map_err(|e| IpcError::delete("notifications", e))?;
    if changed == 0 {
        return Err(IpcError::NotFound("notification"));
    }
    Ok(json!({ "unreadCount": unread_count(conn, &me.user_id)? }))
}

fn handle_clear(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let removed = conn
        .execute("DELETE FROM notifications WHERE user_id = ?", [&me.user_id])
        .map_err(|e| IpcError::delete("notifications", e))?;
    Ok(json!({ "removed": removed }))
}

/// Admin broadcast: to one user, to everyone in a role, or to every account.
fn handle_create(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageUsers)?;
    let title = required_str(req, "title")?;
    let message = required_str(req, "message")?;
    let kind = match optional_str(req, "kind")? {
        None => Kind::Info,
        Some(k) => Kind::parse(&k).ok_or_else(|| {
            IpcError::bad("kind must be one of: info, success, warning, error")
        })?,
    };
    let link = optional_str(req, "link")?;
    let user_id = optional_str(req, "userId")?;
    let role = match optional_str(req, "role")? {
        None => None,
        Some(r) => Some(Role::parse(&r).ok_or_else(|| {
            IpcError::bad("role must be one of: admin, supervisor, accountant, parent")
        })?),
    };
    if user_id.is_some() && role.is_some() {
        return Err(IpcError::bad("pass either userId or role, not both"));
    }

    let recipients: Vec<String> = if let Some(uid) = user_id {
        if !crate::ipc::helpers::exists(conn, "SELECT 1 FROM users WHERE id = ?", &uid)? {
            return Err(IpcError::NotFound("user"));
        }
        vec![uid]
    } else {
        let (sql, bind): (&str, Option<&str>) = match role {
            Some(r) => ("SELECT id FROM users WHERE role = ? ORDER BY created_at", Some(r.as_str())),
            None => ("SELECT id FROM users ORDER BY created_at", None),
        };
        let mut stmt = conn.prepare(sql).map_err(IpcError::query)?;
        let rows = match bind {
            Some(b) => stmt
                .query_map([b], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
            None => stmt
                .query_map([], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        };
        rows.map_err(IpcError::query)?
    };

    let draft = Draft {
        title: &title,
        message: &message,
        kind,
        link: link.as_deref(),
    };
    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    for uid in &recipients {
        push(&tx, uid, &draft)?;
    }
    tx.commit().map_err(IpcError::tx)?;
    tracing::info!(recipients = recipients.len(), "notification broadcast");
    Ok(json!({ "delivered": recipients.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "notifications.list" => handle_list(state, req),
        "notifications.unreadCount" => handle_unread_count(state, req),
        "notifications.markRead" => handle_mark_read(state, req),
        "notifications.markAllRead" => handle_mark_all_read(state, req),
        "notifications.delete" => handle_delete(state, req),
        "notifications.clear" => handle_clear(state, req),
        "notifications.create" => handle_create(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
