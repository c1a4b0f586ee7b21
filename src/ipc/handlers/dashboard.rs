use crate::approval::{self, ResultStatus};
use crate::auth::Role;
use crate::fees::{self, FeeStatus, PaymentStatus};
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, resolve_period, session};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

use super::fees::student_ledger;

fn count(conn: &Connection, sql: &str) -> Result<i64, IpcError> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(IpcError::query)
}

fn count_in_period(
    conn: &Connection,
    sql: &str,
    term: &str,
    session: &str,
) -> Result<i64, IpcError> {
    conn.query_row(sql, (term, session), |r| r.get(0))
        .map_err(IpcError::query)
}

fn results_by_status(
    conn: &Connection,
    term: &str,
    session: &str,
) -> Result<Map<String, Value>, IpcError> {
    let mut out = Map::new();
    for status in [
        ResultStatus::Pending,
        ResultStatus::Approved,
        ResultStatus::Blocked,
    ] {
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM results WHERE term = ? AND session = ? AND status = ?",
                (term, session, status.as_str()),
                |r| r.get(0),
            )
            .map_err(IpcError::query)?;
        out.insert(status.as_str().to_string(), json!(n));
    }
    Ok(out)
}

fn collected(conn: &Connection, term: &str, session: &str) -> Result<f64, IpcError> {
    let sum: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM payments
             WHERE term = ? AND session = ? AND status = ?",
            (term, session, PaymentStatus::Completed.as_str()),
            |r| r.get(0),
        )
        .map_err(IpcError::query)?;
    Ok(fees::round_money(sum))
}

/// Outstanding balance and settlement counts across every enrolled student.
fn outstanding(conn: &Connection, term: &str, session: &str) -> Result<Value, IpcError> {
    let mut stmt = conn
        .prepare("SELECT id FROM students")
        .map_err(IpcError::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let (mut balance, mut paid, mut partial, mut unpaid) = (0.0, 0usize, 0usize, 0usize);
    for id in ids {
        let ledger = student_ledger(conn, &id, term, session)?;
        balance += ledger.balance;
        match ledger.status {
            FeeStatus::Paid => paid += 1,
            FeeStatus::Partial => partial += 1,
            FeeStatus::Unpaid => unpaid += 1,
        }
    }
    Ok(json!({
        "outstanding": fees::round_money(balance),
        "studentsPaid": paid,
        "studentsPartial": partial,
        "studentsUnpaid": unpaid,
    }))
}

fn admin_summary(conn: &Connection, term: &str, session: &str) -> Result<Value, IpcError> {
    let mut users = Map::new();
    for role in [Role::Admin, Role::Supervisor, Role::Accountant, Role::Parent] {
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE role = ?",
                [role.as_str()],
                |r| r.get(0),
            )
            .map_err(IpcError::query)?;
        users.insert(role.as_str().to_string(), json!(n));
    }
    Ok(json!({
        "students": count(conn, "SELECT COUNT(*) FROM students")?,
        "classes": count(conn, "SELECT COUNT(*) FROM classes")?,
        "subjects": count(conn, "SELECT COUNT(*) FROM subjects")?,
        "usersByRole": users,
        "results": results_by_status(conn, term, session)?,
        "collected": collected(conn, term, session)?,
    }))
}

fn supervisor_summary(conn: &Connection, term: &str, session: &str) -> Result<Value, IpcError> {
    Ok(json!({
        "students": count(conn, "SELECT COUNT(*) FROM students")?,
        "resultsRecorded": count_in_period(
            conn,
            "SELECT COUNT(*) FROM results WHERE term = ? AND session = ?",
            term,
            session,
        )?,
        "results": results_by_status(conn, term, session)?,
    }))
}

fn accountant_summary(conn: &Connection, term: &str, session: &str) -> Result<Value, IpcError> {
    let mut out = json!({
        "collected": collected(conn, term, session)?,
        "pendingPayments": count_in_period(
            conn,
            "SELECT COUNT(*) FROM payments WHERE term = ? AND session = ? AND status = 'pending'",
            term,
            session,
        )?,
        "blockedResults": count_in_period(
            conn,
            "SELECT COUNT(*) FROM results WHERE term = ? AND session = ? AND status = 'blocked'",
            term,
            session,
        )?,
    });
    if let (Some(obj), Value::Object(extra)) = (out.as_object_mut(), outstanding(conn, term, session)?) {
        obj.extend(extra);
    }
    Ok(out)
}

fn parent_summary(
    conn: &Connection,
    me: &Session,
    term: &str,
    session: &str,
) -> Result<Value, IpcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name || ' ' || s.last_name, c.name
             FROM students s JOIN classes c ON c.id = s.class_id
             WHERE s.parent_id = ?
             ORDER BY s.first_name",
        )
        .map_err(IpcError::query)?;
    let kids = stmt
        .query_map([&me.user_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let mut children = Vec::with_capacity(kids.len());
    let mut visible_total = 0i64;
    for (id, name, class_name) in kids {
        let ledger = student_ledger(conn, &id, term, session)?;
        let approved: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM results
                 WHERE student_id = ? AND term = ? AND session = ? AND status = 'approved'",
                (&id, term, session),
                |r| r.get(0),
            )
            .map_err(IpcError::query)?;
        let visible = if approval::visible_to_parent(ResultStatus::Approved, ledger.status) {
            approved
        } else {
            0
        };
        visible_total += visible;
        children.push(json!({
            "studentId": id,
            "name": name,
            "className": class_name,
            "visibleResults": visible,
            "ledger": ledger,
        }));
    }
    let unread: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
            [&me.user_id],
            |r| r.get(0),
        )
        .map_err(IpcError::query)?;
    Ok(json!({
        "children": children,
        "visibleResults": visible_total,
        "unreadNotifications": unread,
    }))
}

fn handle_dashboard_summary(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let (term, session) = resolve_period(conn, req)?;
    let summary = match me.role {
        Role::Admin => admin_summary(conn, &term, &session)?,
        Role::Supervisor => supervisor_summary(conn, &term, &session)?,
        Role::Accountant => accountant_summary(conn, &term, &session)?,
        Role::Parent => parent_summary(conn, &me, &term, &session)?,
    };
    Ok(json!({
        "role": me.role.as_str(),
        "term": term,
        "session": session,
        "summary": summary,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "dashboard.summary" => handle_dashboard_summary(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
