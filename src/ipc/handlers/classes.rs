use crate::auth::Capability;
use crate::db;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, exists, optional_str, require, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ViewStudents)?;

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.level,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM classes c
             ORDER BY c.name",
        )
        .map_err(IpcError::query)?;

    let classes = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "level": row.get::<_, Option<String>>(2)?,
                "studentCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    Ok(json!({ "classes": classes }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let name = required_str(req, "name")?;
    let level = optional_str(req, "level")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, level, created_at) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &level, db::now_rfc3339()),
    )
    .map_err(|e| IpcError::insert("classes", e))?;

    tracing::info!(class = %class_id, name = %name, "class created");
    Ok(json!({ "classId": class_id, "name": name, "level": level }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let class_id = required_str(req, "classId")?;

    if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(IpcError::NotFound("class"));
    }
    let enrolled: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(IpcError::query)?;
    if enrolled > 0 {
        return Err(IpcError::Conflict(format!(
            "class still has {} enrolled student(s); move or delete them first",
            enrolled
        )));
    }

    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    tx.execute("DELETE FROM fee_structures WHERE class_id = ?", [&class_id])
        .map_err(|e| IpcError::delete("fee_structures", e))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| IpcError::delete("classes", e))?;
    tx.commit().map_err(IpcError::tx)?;

    Ok(json!({ "deleted": true }))
}

fn handle_subjects_list(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ViewResults)?;
    let mut stmt = conn
        .prepare(
            "SELECT
               sub.id, sub.name, sub.code,
               (SELECT COUNT(*) FROM results r WHERE r.subject_id = sub.id) AS result_count
             FROM subjects sub
             ORDER BY sub.name",
        )
        .map_err(IpcError::query)?;
    let subjects = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "code": row.get::<_, Option<String>>(2)?,
                "resultCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let name = required_str(req, "name")?;
    let code = optional_str(req, "code")?.map(|c| c.to_ascii_uppercase());

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code) VALUES(?, ?, ?)",
        (&subject_id, &name, &code),
    )
    .map_err(|e| IpcError::insert("subjects", e))?;
    Ok(json!({ "subjectId": subject_id, "name": name, "code": code }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let subject_id = required_str(req, "subjectId")?;
    if !exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(IpcError::NotFound("subject"));
    }
    if exists(
        conn,
        "SELECT 1 FROM results WHERE subject_id = ? LIMIT 1",
        &subject_id,
    )? {
        return Err(IpcError::Conflict(
            "subject has recorded results and cannot be deleted".into(),
        ));
    }
    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| IpcError::delete("subjects", e))?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "classes.list" => handle_classes_list(state, req),
        "classes.create" => handle_classes_create(state, req),
        "classes.delete" => handle_classes_delete(state, req),
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.delete" => handle_subjects_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
