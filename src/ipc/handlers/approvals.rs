use crate::approval::{self, ResultStatus};
use crate::auth::Capability;
use crate::fees::{FeeLedger, FeeStatus};
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, exists, optional_str, parse_session, parse_term, require, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::fees::student_ledger;
use super::results::{apply_status, notify_status_change};
use super::setup;

struct ApprovalRow {
    result_id: String,
    student_id: String,
    student_name: String,
    class_name: String,
    subject_name: String,
    percentage: f64,
    grade: String,
    status: ResultStatus,
}

fn load_rows(
    conn: &Connection,
    class_id: Option<&str>,
    term: &str,
    session: &str,
) -> Result<Vec<ApprovalRow>, IpcError> {
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.student_id, s.first_name || ' ' || s.last_name, c.name, sub.name,
                    r.percentage, r.grade, r.status
             FROM results r
             JOIN students s ON s.id = r.student_id
             JOIN classes c ON c.id = s.class_id
             JOIN subjects sub ON sub.id = r.subject_id
             WHERE (?1 IS NULL OR s.class_id = ?1) AND r.term = ?2 AND r.session = ?3
             ORDER BY c.name, s.last_name, s.first_name, sub.name",
        )
        .map_err(IpcError::query)?;
    stmt.query_map((class_id, term, session), |r| {
        let status: String = r.get(7)?;
        Ok(ApprovalRow {
            result_id: r.get(0)?,
            student_id: r.get(1)?,
            student_name: r.get(2)?,
            class_name: r.get(3)?,
            subject_name: r.get(4)?,
            percentage: r.get(5)?,
            grade: r.get(6)?,
            status: ResultStatus::parse(&status).unwrap_or(ResultStatus::Pending),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(IpcError::query)
}

/// Ledgers looked up once per student for the period.
struct LedgerCache<'a> {
    conn: &'a Connection,
    term: &'a str,
    session: &'a str,
    seen: HashMap<String, FeeLedger>,
}

impl<'a> LedgerCache<'a> {
    fn new(conn: &'a Connection, term: &'a str, session: &'a str) -> Self {
        Self {
            conn,
            term,
            session,
            seen: HashMap::new(),
        }
    }

    fn get(&mut self, student_id: &str) -> Result<FeeLedger, IpcError> {
        if let Some(l) = self.seen.get(student_id) {
            return Ok(*l);
        }
        let l = student_ledger(self.conn, student_id, self.term, self.session)?;
        self.seen.insert(student_id.to_string(), l);
        Ok(l)
    }
}

fn scope(conn: &Connection, req: &Request) -> Result<(Option<String>, String, String), IpcError> {
    let class_id = optional_str(req, "classId")?;
    if let Some(cid) = &class_id {
        if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", cid)? {
            return Err(IpcError::NotFound("class"));
        }
    }
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;
    Ok((class_id, term, session))
}

fn handle_approvals_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ApproveResults)?;
    let (class_id, term, session) = scope(conn, req)?;

    let rows = load_rows(conn, class_id.as_deref(), &term, &session)?;
    let mut ledgers = LedgerCache::new(conn, &term, &session);
    let mut out = Vec::with_capacity(rows.len());
    let (mut pending, mut approved, mut blocked, mut review) = (0usize, 0usize, 0usize, 0usize);
    for row in rows {
        let ledger = ledgers.get(&row.student_id)?;
        let needs_review = approval::needs_review(row.status, ledger.status);
        match row.status {
            ResultStatus::Pending => pending += 1,
            ResultStatus::Approved => approved += 1,
            ResultStatus::Blocked => blocked += 1,
        }
        if needs_review {
            review += 1;
        }
        out.push(json!({
            "resultId": row.result_id,
            "studentId": row.student_id,
            "studentName": row.student_name,
            "className": row.class_name,
            "subjectName": row.subject_name,
            "percentage": row.percentage,
            "grade": row.grade,
            "status": row.status.as_str(),
            "feeStatus": ledger.status.as_str(),
            "balance": ledger.balance,
            "visibleToParent": approval::visible_to_parent(row.status, ledger.status),
            "needsReview": needs_review,
        }));
    }

    Ok(json!({
        "term": term,
        "session": session,
        "rows": out,
        "counts": {
            "pending": pending,
            "approved": approved,
            "blocked": blocked,
            "needsReview": review,
        },
    }))
}

fn handle_apply_fee_gate(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::ApproveResults)?;
    let (class_id, term, session) = scope(conn, req)?;
    let minimum: FeeStatus = match optional_str(req, "minimumFeeStatus")? {
        Some(raw) => approval::parse_minimum_fee_status(&raw)
            .ok_or_else(|| IpcError::bad("minimumFeeStatus must be one of: partial, paid"))?,
        None => setup::approval_settings(conn)?.minimum_fee_status,
    };

    let rows = load_rows(conn, class_id.as_deref(), &term, &session)?;
    let mut ledgers = LedgerCache::new(conn, &term, &session);
    let mut to_approve = Vec::new();
    let mut to_block = Vec::new();
    let mut untouched = 0usize;
    for row in rows {
        let fee = ledgers.get(&row.student_id)?.status;
        match approval::gate_decision(row.status, fee, minimum) {
            Some(ResultStatus::Approved) => to_approve.push(row.result_id),
            Some(ResultStatus::Blocked) => to_block.push(row.result_id),
            Some(ResultStatus::Pending) | None => untouched += 1,
        }
    }

    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    let approved_periods = apply_status(&tx, &to_approve, ResultStatus::Approved, &me.user_id)?;
    let blocked_periods = apply_status(&tx, &to_block, ResultStatus::Blocked, &me.user_id)?;
    let notified = notify_status_change(&tx, &approved_periods, ResultStatus::Approved)?
        + notify_status_change(&tx, &blocked_periods, ResultStatus::Blocked)?;
    tx.commit().map_err(IpcError::tx)?;

    tracing::info!(
        term = %term,
        session = %session,
        minimum = minimum.as_str(),
        approved = to_approve.len(),
        blocked = to_block.len(),
        untouched,
        "fee gate applied"
    );
    Ok(json!({
        "minimumFeeStatus": minimum.as_str(),
        "approved": to_approve.len(),
        "blocked": to_block.len(),
        "untouched": untouched,
        "parentsNotified": notified,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "approvals.list" => handle_approvals_list(state, req),
        "approvals.applyFeeGate" => handle_apply_fee_gate(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
