use crate::auth::{Capability, Role};
use crate::db;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, exists, optional_str, require, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

const STUDENT_COLUMNS: &str = "s.id, s.admission_no, s.first_name, s.last_name, s.class_id, c.name,
       s.parent_id, s.gender, s.date_of_birth";

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let first: String = r.get(2)?;
    let last: String = r.get(3)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "admissionNo": r.get::<_, String>(1)?,
        "firstName": first,
        "lastName": last,
        "displayName": format!("{} {}", first, last),
        "classId": r.get::<_, String>(4)?,
        "className": r.get::<_, String>(5)?,
        "parentId": r.get::<_, Option<String>>(6)?,
        "gender": r.get::<_, Option<String>>(7)?,
        "dateOfBirth": r.get::<_, Option<String>>(8)?,
    }))
}

fn parse_gender(raw: &str) -> Result<String, IpcError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "male" | "m" => Ok("male".into()),
        "female" | "f" => Ok("female".into()),
        _ => Err(IpcError::bad("gender must be male or female")),
    }
}

fn parse_birth_date(raw: &str) -> Result<String, IpcError> {
    chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| IpcError::bad("dateOfBirth must be YYYY-MM-DD"))
}

fn ensure_parent_account(conn: &Connection, user_id: &str) -> Result<(), IpcError> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(IpcError::query)?;
    match role.as_deref().and_then(Role::parse) {
        Some(Role::Parent) => Ok(()),
        Some(_) => Err(IpcError::bad("parentId must reference a parent account")),
        None => Err(IpcError::NotFound("parent")),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ViewStudents)?;
    let class_id = optional_str(req, "classId")?;

    let sql = format!(
        "SELECT {}
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE (?1 IS NULL OR s.class_id = ?1)
         ORDER BY c.name, s.last_name, s.first_name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(IpcError::query)?;
    let students = stmt
        .query_map([&class_id], student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    Ok(json!({ "students": students }))
}

/// A parent's own children.
fn handle_students_mine(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::ViewOwnChildren)?;
    let sql = format!(
        "SELECT {}
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.parent_id = ?
         ORDER BY s.first_name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(IpcError::query)?;
    let students = stmt
        .query_map([&me.user_id], student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    Ok(json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let first_name = required_str(req, "firstName")?;
    let last_name = required_str(req, "lastName")?;
    let admission_no = required_str(req, "admissionNo")?.to_ascii_uppercase();
    let class_id = required_str(req, "classId")?;
    let parent_id = optional_str(req, "parentId")?;
    let gender = optional_str(req, "gender")?
        .map(|g| parse_gender(&g))
        .transpose()?;
    let date_of_birth = optional_str(req, "dateOfBirth")?
        .map(|d| parse_birth_date(&d))
        .transpose()?;

    if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(IpcError::NotFound("class"));
    }
    if let Some(pid) = &parent_id {
        ensure_parent_account(conn, pid)?;
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, parent_id, admission_no, first_name, last_name, gender, date_of_birth, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &parent_id,
            &admission_no,
            &first_name,
            &last_name,
            &gender,
            &date_of_birth,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| match IpcError::insert("students", e) {
        IpcError::Conflict(_) => {
            IpcError::Conflict(format!("admission number already in use: {}", admission_no))
        }
        other => other,
    })?;

    tracing::info!(student = %student_id, class = %class_id, "student created");
    Ok(json!({ "studentId": student_id, "admissionNo": admission_no }))
}

fn patch_text(
    patch: &Map<String, Value>,
    key: &str,
    column: &str,
    set_parts: &mut Vec<String>,
    bind_values: &mut Vec<SqlValue>,
) -> Result<(), IpcError> {
    if let Some(v) = patch.get(key) {
        let Some(s) = v.as_str() else {
            return Err(IpcError::bad(format!("patch.{} must be a string", key)));
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return Err(IpcError::bad(format!("{} must not be empty", key)));
        }
        set_parts.push(format!("{} = ?", column));
        bind_values.push(SqlValue::Text(s));
    }
    Ok(())
}

fn handle_students_update(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let student_id = required_str(req, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(IpcError::bad("missing/invalid patch"));
    };
    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(IpcError::NotFound("student"));
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();

    patch_text(patch, "firstName", "first_name", &mut set_parts, &mut bind_values)?;
    patch_text(patch, "lastName", "last_name", &mut set_parts, &mut bind_values)?;

    if let Some(v) = patch.get("admissionNo") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(IpcError::bad("patch.admissionNo must be a non-empty string"));
        };
        set_parts.push("admission_no = ?".into());
        bind_values.push(SqlValue::Text(s.to_ascii_uppercase()));
    }
    if let Some(v) = patch.get("classId") {
        let Some(cid) = v.as_str() else {
            return Err(IpcError::bad("patch.classId must be a string"));
        };
        if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", cid)? {
            return Err(IpcError::NotFound("class"));
        }
        set_parts.push("class_id = ?".into());
        bind_values.push(SqlValue::Text(cid.to_string()));
    }
    if let Some(v) = patch.get("parentId") {
        set_parts.push("parent_id = ?".into());
        if v.is_null() {
            bind_values.push(SqlValue::Null);
        } else if let Some(pid) = v.as_str() {
            ensure_parent_account(conn, pid)?;
            bind_values.push(SqlValue::Text(pid.to_string()));
        } else {
            return Err(IpcError::bad("patch.parentId must be a string or null"));
        }
    }
    if let Some(v) = patch.get("gender") {
        set_parts.push("gender = ?".into());
        match v.as_str() {
            _ if v.is_null() => bind_values.push(SqlValue::Null),
            Some(s) => bind_values.push(SqlValue::Text(parse_gender(s)?)),
            None => return Err(IpcError::bad("patch.gender must be a string or null")),
        }
    }
    if let Some(v) = patch.get("dateOfBirth") {
        set_parts.push("date_of_birth = ?".into());
        match v.as_str() {
            _ if v.is_null() => bind_values.push(SqlValue::Null),
            Some(s) => bind_values.push(SqlValue::Text(parse_birth_date(s)?)),
            None => return Err(IpcError::bad("patch.dateOfBirth must be a string or null")),
        }
    }

    if set_parts.is_empty() {
        return Err(IpcError::bad("patch has no recognised fields"));
    }
    set_parts.push("updated_at = ?".into());
    bind_values.push(SqlValue::Text(db::now_rfc3339()));
    bind_values.push(SqlValue::Text(student_id.clone()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| IpcError::update("students", e))?;
    Ok(json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let student_id = required_str(req, "studentId")?;
    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(IpcError::NotFound("student"));
    }

    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    let results = tx
        .execute("DELETE FROM results WHERE student_id = ?", [&student_id])
        .map_err(|e| IpcError::delete("results", e))?;
    let payments = tx
        .execute("DELETE FROM payments WHERE student_id = ?", [&student_id])
        .map_err(|e| IpcError::delete("payments", e))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| IpcError::delete("students", e))?;
    tx.commit().map_err(IpcError::tx)?;

    tracing::info!(student = %student_id, results, payments, "student deleted");
    Ok(json!({
        "deleted": true,
        "resultsRemoved": results,
        "paymentsRemoved": payments,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.mine" => handle_students_mine(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
