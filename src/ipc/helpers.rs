use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::Capability;
use crate::ipc::error::IpcError;
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request, Session};

pub const TERMS: [&str; 3] = ["First Term", "Second Term", "Third Term"];

pub fn db_conn(state: &AppState) -> Result<&Connection, IpcError> {
    state.db.as_ref().ok_or(IpcError::NoWorkspace)
}

pub fn session(state: &AppState) -> Result<Session, IpcError> {
    state.session.clone().ok_or(IpcError::Unauthenticated)
}

pub fn require(state: &AppState, cap: Capability) -> Result<Session, IpcError> {
    let s = session(state)?;
    if !s.role.can(cap) {
        return Err(IpcError::Forbidden(format!(
            "role {} may not {}",
            s.role.as_str(),
            cap.as_str().replace('_', " ")
        )));
    }
    Ok(s)
}

pub fn required_str(req: &Request, key: &str) -> Result<String, IpcError> {
    match optional_str(req, key)? {
        Some(v) => Ok(v),
        None => Err(IpcError::bad(format!("missing {}", key))),
    }
}

/// Missing, null and blank strings all read as absent.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, IpcError> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(IpcError::bad(format!("{} must be a string", key)));
            };
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, IpcError> {
    match req.params.get(key) {
        None => Err(IpcError::bad(format!("missing {}", key))),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| IpcError::bad(format!("{} must be a number", key))),
    }
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, IpcError> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| IpcError::bad(format!("{} must be boolean", key))),
    }
}

pub fn string_list(req: &Request, key: &str) -> Result<Vec<String>, IpcError> {
    let Some(arr) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(IpcError::bad(format!("{} must be an array of strings", key)));
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(IpcError::bad(format!("{} must be an array of strings", key)));
        };
        out.push(s.to_string());
    }
    Ok(out)
}

pub fn parse_term(raw: &str) -> Result<String, IpcError> {
    let t = raw.trim().to_ascii_lowercase();
    let canonical = match t.as_str() {
        "first term" | "first" | "1" => TERMS[0],
        "second term" | "second" | "2" => TERMS[1],
        "third term" | "third" | "3" => TERMS[2],
        _ => {
            return Err(IpcError::bad_with(
                "term must be one of: First Term, Second Term, Third Term",
                json!({ "term": raw }),
            ))
        }
    };
    Ok(canonical.to_string())
}

/// Sessions are written `YYYY/YYYY` with consecutive years.
pub fn parse_session(raw: &str) -> Result<String, IpcError> {
    let bad = || {
        IpcError::bad_with(
            "session must look like 2024/2025",
            json!({ "session": raw }),
        )
    };
    let t = raw.trim();
    let (a, b) = t.split_once('/').ok_or_else(bad)?;
    let four_digits = |s: &str| s.len() == 4 && s.bytes().all(|c| c.is_ascii_digit());
    if !four_digits(a) || !four_digits(b) {
        return Err(bad());
    }
    let start: i32 = a.parse().map_err(|_| bad())?;
    let end: i32 = b.parse().map_err(|_| bad())?;
    if end != start + 1 {
        return Err(bad());
    }
    Ok(format!("{}/{}", a, b))
}

pub fn optional_term(req: &Request) -> Result<Option<String>, IpcError> {
    optional_str(req, "term")?.map(|t| parse_term(&t)).transpose()
}

pub fn optional_session(req: &Request) -> Result<Option<String>, IpcError> {
    optional_str(req, "session")?
        .map(|s| parse_session(&s))
        .transpose()
}

/// Explicit `term`/`session` params win; otherwise the school's current period.
pub fn resolve_period(conn: &Connection, req: &Request) -> Result<(String, String), IpcError> {
    let term = optional_term(req)?;
    let session = optional_session(req)?;
    if let (Some(t), Some(s)) = (&term, &session) {
        return Ok((t.clone(), s.clone()));
    }
    let (cur_term, cur_session) = setup::current_period(conn)?;
    let term = term
        .or(cur_term)
        .ok_or_else(|| IpcError::bad("missing term and no current term is configured"))?;
    let session = session
        .or(cur_session)
        .ok_or_else(|| IpcError::bad("missing session and no current session is configured"))?;
    Ok((term, session))
}

pub fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, IpcError> {
    let found: Option<i64> = conn
        .query_row(sql, [id], |r| r.get(0))
        .optional()
        .map_err(IpcError::query)?;
    Ok(found.is_some())
}

pub fn student_parent(conn: &Connection, student_id: &str) -> Result<Option<String>, IpcError> {
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT parent_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(IpcError::query)?;
    match row {
        Some(parent) => Ok(parent),
        None => Err(IpcError::NotFound("student")),
    }
}

/// Parents may only reach their own children; other roles pass through.
pub fn ensure_can_see_student(
    conn: &Connection,
    session: &Session,
    student_id: &str,
) -> Result<(), IpcError> {
    let parent = student_parent(conn, student_id)?;
    if session.role == crate::auth::Role::Parent && parent.as_deref() != Some(session.user_id.as_str()) {
        return Err(IpcError::Forbidden(
            "parents may only view their own children".into(),
        ));
    }
    Ok(())
}
