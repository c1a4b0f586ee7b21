use crate::approval::{self, ResultStatus};
use crate::auth::{Capability, Role};
use crate::calc::{self, Grade};
use crate::db;
use crate::fees::{self, PaymentStatus};
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{
    db_conn, ensure_can_see_student, parse_session, parse_term, require, required_str, session,
};
use crate::ipc::types::{AppState, Request};
use crate::printable::{self, Receipt, ReportCard, ReportCardRow};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};

use super::fees::{required_fee, student_ledger};
use super::results::class_standings;
use super::setup;

fn handle_report_card(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let student_id = required_str(req, "studentId")?;
    let parent_view = me.role == Role::Parent;
    if parent_view {
        ensure_can_see_student(conn, &me, &student_id)?;
    } else {
        require(state, Capability::ViewResults)?;
    }
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;

    let (student_name, admission_no, class_id, class_name): (String, String, String, String) =
        conn.query_row(
            "SELECT s.first_name || ' ' || s.last_name, s.admission_no, s.class_id, c.name
             FROM students s JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(IpcError::query)?
        .ok_or(IpcError::NotFound("student"))?;

    let mut stmt = conn
        .prepare(
            "SELECT sub.name, r.test1, r.test2, r.exam, r.total, r.percentage, r.grade, r.status
             FROM results r JOIN subjects sub ON sub.id = r.subject_id
             WHERE r.student_id = ? AND r.term = ? AND r.session = ?
             ORDER BY sub.name",
        )
        .map_err(IpcError::query)?;
    let recorded = stmt
        .query_map((&student_id, &term, &session), |r| {
            let grade: String = r.get(6)?;
            let status: String = r.get(7)?;
            Ok((
                ReportCardRow {
                    subject: r.get(0)?,
                    test1: r.get(1)?,
                    test2: r.get(2)?,
                    exam: r.get(3)?,
                    total: r.get(4)?,
                    percentage: r.get(5)?,
                    remark: Grade::parse(&grade)
                        .map(|g| g.remark().to_string())
                        .unwrap_or_default(),
                    grade,
                },
                ResultStatus::parse(&status).unwrap_or(ResultStatus::Pending),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let rows: Vec<ReportCardRow> = if parent_view {
        let fee = student_ledger(conn, &student_id, &term, &session)?.status;
        recorded
            .into_iter()
            .filter(|(_, status)| approval::visible_to_parent(*status, fee))
            .map(|(row, _)| row)
            .collect()
    } else {
        recorded.into_iter().map(|(row, _)| row).collect()
    };

    let average = calc::mean(&rows.iter().map(|r| r.percentage).collect::<Vec<_>>())
        .map(calc::round_off_1_decimal);
    let standings = class_standings(conn, &class_id, &term, &session)?;
    let position = if rows.is_empty() {
        None
    } else {
        standings
            .iter()
            .find(|s| s.student_id == student_id)
            .map(|s| calc::ordinal(s.position))
    };

    let card = ReportCard {
        school: setup::school_header(conn)?,
        student_name,
        admission_no,
        class_name,
        term,
        session,
        rows,
        overall_grade: average.map(|a| Grade::from_percentage(a).letter().to_string()),
        average,
        position,
        class_size: standings.len(),
        generated_at: db::now_rfc3339(),
    };
    let html = printable::render_report_card(&card);
    Ok(json!({ "model": card, "html": html }))
}

fn handle_receipt(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = session(state)?;
    let payment_id = required_str(req, "paymentId")?;

    type PaymentRow = (
        String,
        String,
        String,
        String,
        f64,
        String,
        Option<String>,
        String,
        String,
        String,
        String,
        String,
        String,
    );
    let row: Option<PaymentRow> = conn
        .query_row(
            "SELECT p.receipt_no, p.student_id, p.term, p.session, p.amount, p.method, p.reference,
                    p.status, p.created_at, s.first_name || ' ' || s.last_name, s.admission_no,
                    s.class_id, c.name
             FROM payments p
             JOIN students s ON s.id = p.student_id
             JOIN classes c ON c.id = s.class_id
             WHERE p.id = ?",
            [&payment_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                    r.get(12)?,
                ))
            },
        )
        .optional()
        .map_err(IpcError::query)?;
    let Some((
        receipt_no,
        student_id,
        term,
        session,
        amount,
        method,
        reference,
        status,
        created_at,
        student_name,
        admission_no,
        class_id,
        class_name,
    )) = row
    else {
        return Err(IpcError::NotFound("payment"));
    };

    if me.role == Role::Parent {
        ensure_can_see_student(conn, &me, &student_id)?;
    } else {
        require(state, Capability::ManageFees)?;
    }

    // Balance as it stood once this payment (and those before it) settled.
    let paid_through: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM payments
             WHERE student_id = ? AND term = ? AND session = ? AND status = ?
               AND created_at <= ?",
            (
                &student_id,
                &term,
                &session,
                PaymentStatus::Completed.as_str(),
                &created_at,
            ),
            |r| r.get(0),
        )
        .map_err(IpcError::query)?;
    let required = required_fee(conn, &class_id, &term, &session)?;
    let balance_after = fees::round_money((required - paid_through).max(0.0));
    let fee_status = fees::fee_status(paid_through, required);

    let receipt = Receipt {
        school: setup::school_header(conn)?,
        receipt_no,
        student_name,
        admission_no,
        class_name,
        term,
        session,
        amount,
        method,
        reference,
        status,
        paid_at: created_at,
        balance_after,
        fee_status: fee_status.as_str().to_string(),
    };
    let html = printable::render_receipt(&receipt);
    Ok(json!({ "model": receipt, "html": html }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "reports.reportCard" => handle_report_card(state, req),
        "reports.receipt" => handle_receipt(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
