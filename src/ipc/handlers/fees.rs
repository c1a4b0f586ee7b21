use crate::auth::{Capability, Role};
use crate::db;
use crate::fees::{self, FeeLedger, FeeStatus, PaymentMethod, PaymentStatus};
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{
    db_conn, ensure_can_see_student, exists, optional_session, optional_str, optional_term,
    parse_session, parse_term, require, required_f64, required_str, session,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::printable::format_money;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use super::notifications::{self, Draft, Kind};

/// Total a class owes for a period; no structure means nothing is owed.
pub fn required_fee(
    conn: &Connection,
    class_id: &str,
    term: &str,
    session: &str,
) -> Result<f64, IpcError> {
    let total: Option<f64> = conn
        .query_row(
            "SELECT total_fee FROM fee_structures WHERE class_id = ? AND term = ? AND session = ?",
            (class_id, term, session),
            |r| r.get(0),
        )
        .optional()
        .map_err(IpcError::query)?;
    Ok(total.unwrap_or(0.0))
}

fn student_class(conn: &Connection, student_id: &str) -> Result<String, IpcError> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(IpcError::query)?
    .ok_or(IpcError::NotFound("student"))
}

pub fn student_ledger(
    conn: &Connection,
    student_id: &str,
    term: &str,
    session: &str,
) -> Result<FeeLedger, IpcError> {
    let class_id = student_class(conn, student_id)?;
    let required = required_fee(conn, &class_id, term, session)?;

    let mut stmt = conn
        .prepare(
            "SELECT amount, status FROM payments
             WHERE student_id = ? AND term = ? AND session = ?",
        )
        .map_err(IpcError::query)?;
    let payments = stmt
        .query_map((student_id, term, session), |r| {
            let amount: f64 = r.get(0)?;
            let status: String = r.get(1)?;
            Ok((amount, status))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    Ok(fees::ledger(
        payments.into_iter().map(|(amount, status)| {
            (
                amount,
                PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Pending),
            )
        }),
        required,
    ))
}

/// Accountants and admins see every student; parents only their own.
fn require_fee_view(
    conn: &Connection,
    state: &AppState,
    student_id: &str,
) -> Result<Session, IpcError> {
    let me = session(state)?;
    if me.role == Role::Parent {
        ensure_can_see_student(conn, &me, student_id)?;
        return Ok(me);
    }
    require(state, Capability::ManageFees)
}

fn parse_items(req: &Request) -> Result<Value, IpcError> {
    let Some(raw) = req.params.get("items") else {
        return Ok(json!([]));
    };
    if raw.is_null() {
        return Ok(json!([]));
    }
    let Some(arr) = raw.as_array() else {
        return Err(IpcError::bad("items must be an array"));
    };
    let mut items = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IpcError::bad(format!("items[{}].name must be a non-empty string", i)))?;
        let amount = item
            .get("amount")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| IpcError::bad(format!("items[{}].amount must be a number", i)))?;
        let amount = fees::validate_fee_total(amount)?;
        items.push(json!({ "name": name, "amount": amount }));
    }
    Ok(Value::Array(items))
}

fn handle_structures_upsert(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageFees)?;
    let class_id = required_str(req, "classId")?;
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;
    let total_fee = fees::validate_fee_total(required_f64(req, "totalFee")?)?;
    let items = parse_items(req)?;

    if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(IpcError::NotFound("class"));
    }

    conn.execute(
        "INSERT INTO fee_structures(id, class_id, term, session, total_fee, items_json, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, term, session) DO UPDATE SET
           total_fee = excluded.total_fee,
           items_json = excluded.items_json,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &class_id,
            &term,
            &session,
            total_fee,
            items.to_string(),
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| IpcError::insert("fee_structures", e))?;

    tracing::info!(class = %class_id, term = %term, session = %session, total_fee, "fee structure saved");
    Ok(json!({
        "classId": class_id,
        "term": term,
        "session": session,
        "totalFee": total_fee,
        "items": items,
    }))
}

fn handle_structures_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageFees)?;
    let class_id = optional_str(req, "classId")?;
    let term = optional_term(req)?;
    let session = optional_session(req)?;

    let mut stmt = conn
        .prepare(
            "SELECT f.id, f.class_id, c.name, f.term, f.session, f.total_fee, f.items_json, f.updated_at
             FROM fee_structures f
             JOIN classes c ON c.id = f.class_id
             WHERE (?1 IS NULL OR f.class_id = ?1)
               AND (?2 IS NULL OR f.term = ?2)
               AND (?3 IS NULL OR f.session = ?3)
             ORDER BY f.session DESC, f.term, c.name",
        )
        .map_err(IpcError::query)?;
    let structures = stmt
        .query_map((&class_id, &term, &session), |r| {
            let items_json: String = r.get(6)?;
            let items = serde_json::from_str::<Value>(&items_json).unwrap_or_else(|_| json!([]));
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "term": r.get::<_, String>(3)?,
                "session": r.get::<_, String>(4)?,
                "totalFee": r.get::<_, f64>(5)?,
                "items": items,
                "updatedAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    Ok(json!({ "structures": structures }))
}

fn new_receipt_no() -> String {
    let day = chrono::Utc::now().format("%Y%m%d");
    let tail = Uuid::new_v4().simple().to_string();
    format!("RCP-{}-{}", day, tail[..8].to_ascii_uppercase())
}

fn notify_payment(
    conn: &Connection,
    student_id: &str,
    amount: f64,
    ledger: &FeeLedger,
) -> Result<bool, IpcError> {
    let message = format!(
        "A payment of {} has been received. Outstanding balance: {} ({}).",
        format_money(amount),
        format_money(ledger.balance),
        ledger.status.as_str()
    );
    notifications::push_to_parent_of(
        conn,
        student_id,
        &Draft {
            title: "Payment received",
            message: &message,
            kind: Kind::Success,
            link: None,
        },
    )
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::ManageFees)?;
    let student_id = required_str(req, "studentId")?;
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;
    let amount = fees::validate_payment_amount(required_f64(req, "amount")?)?;
    let method_raw = required_str(req, "method")?;
    let method = PaymentMethod::parse(&method_raw).ok_or_else(|| {
        IpcError::bad_with(
            "method must be one of: cash, transfer, card, online",
            json!({ "method": method_raw }),
        )
    })?;
    let status = match optional_str(req, "status")? {
        None => PaymentStatus::Completed,
        Some(s) => PaymentStatus::parse(&s)
            .ok_or_else(|| IpcError::bad("status must be one of: pending, completed, failed"))?,
    };
    let reference = optional_str(req, "reference")?;

    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(IpcError::NotFound("student"));
    }

    let payment_id = Uuid::new_v4().to_string();
    let receipt_no = new_receipt_no();
    let now = db::now_rfc3339();
    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    tx.execute(
        "INSERT INTO payments(id, receipt_no, student_id, term, session, amount, method, reference, status, recorded_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            &receipt_no,
            &student_id,
            &term,
            &session,
            amount,
            method.as_str(),
            &reference,
            status.as_str(),
            &me.user_id,
            &now,
            &now,
        ),
    )
    .map_err(|e| IpcError::insert("payments", e))?;

    let ledger = student_ledger(&tx, &student_id, &term, &session)?;
    let parent_notified = if status == PaymentStatus::Completed {
        notify_payment(&tx, &student_id, amount, &ledger)?
    } else {
        false
    };
    tx.commit().map_err(IpcError::tx)?;

    tracing::info!(
        payment = %payment_id,
        student = %student_id,
        amount,
        status = status.as_str(),
        "payment recorded"
    );
    Ok(json!({
        "paymentId": payment_id,
        "receiptNo": receipt_no,
        "status": status.as_str(),
        "ledger": ledger,
        "parentNotified": parent_notified,
    }))
}

fn handle_payments_update_status(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageFees)?;
    let payment_id = required_str(req, "paymentId")?;
    let status_raw = required_str(req, "status")?;
    let status = PaymentStatus::parse(&status_raw)
        .ok_or_else(|| IpcError::bad("status must be one of: pending, completed, failed"))?;

    let row: Option<(String, String, String, f64, String)> = conn
        .query_row(
            "SELECT student_id, term, session, amount, status FROM payments WHERE id = ?",
            [&payment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(IpcError::query)?;
    let Some((student_id, term, session, amount, previous)) = row else {
        return Err(IpcError::NotFound("payment"));
    };

    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    tx.execute(
        "UPDATE payments SET status = ?, updated_at = ? WHERE id = ?",
        (status.as_str(), db::now_rfc3339(), &payment_id),
    )
    .map_err(|e| IpcError::update("payments", e))?;

    let ledger = student_ledger(&tx, &student_id, &term, &session)?;
    let newly_completed =
        status == PaymentStatus::Completed && previous != PaymentStatus::Completed.as_str();
    let parent_notified = if newly_completed {
        notify_payment(&tx, &student_id, amount, &ledger)?
    } else {
        false
    };
    tx.commit().map_err(IpcError::tx)?;

    tracing::info!(payment = %payment_id, from = %previous, to = status.as_str(), "payment status changed");
    Ok(json!({
        "paymentId": payment_id,
        "status": status.as_str(),
        "ledger": ledger,
        "parentNotified": parent_notified,
    }))
}

fn handle_payments_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let student_id = optional_str(req, "studentId")?;
    match &student_id {
        Some(sid) => {
            require_fee_view(conn, state, sid)?;
        }
        None => {
            require(state, Capability::ManageFees)?;
        }
    }
    let term = optional_term(req)?;
    let session = optional_session(req)?;

    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.receipt_no, p.student_id, s.first_name || ' ' || s.last_name,
                    p.term, p.session, p.amount, p.method, p.reference, p.status, p.created_at
             FROM payments p
             JOIN students s ON s.id = p.student_id
             WHERE (?1 IS NULL OR p.student_id = ?1)
               AND (?2 IS NULL OR p.term = ?2)
               AND (?3 IS NULL OR p.session = ?3)
             ORDER BY p.created_at DESC",
        )
        .map_err(IpcError::query)?;
    let payments = stmt
        .query_map((&student_id, &term, &session), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "receiptNo": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "studentName": r.get::<_, String>(3)?,
                "term": r.get::<_, String>(4)?,
                "session": r.get::<_, String>(5)?,
                "amount": r.get::<_, f64>(6)?,
                "method": r.get::<_, String>(7)?,
                "reference": r.get::<_, Option<String>>(8)?,
                "status": r.get::<_, String>(9)?,
                "createdAt": r.get::<_, String>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    Ok(json!({ "payments": payments }))
}

fn handle_fees_status(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    require_fee_view(conn, state, &student_id)?;
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;

    let ledger = student_ledger(conn, &student_id, &term, &session)?;
    Ok(json!({
        "studentId": student_id,
        "term": term,
        "session": session,
        "ledger": ledger,
    }))
}

fn handle_class_overview(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageFees)?;
    let class_id = required_str(req, "classId")?;
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;
    if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(IpcError::NotFound("class"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, admission_no, first_name || ' ' || last_name
             FROM students WHERE class_id = ?
             ORDER BY last_name, first_name",
        )
        .map_err(IpcError::query)?;
    let students = stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let mut rows = Vec::with_capacity(students.len());
    let (mut expected, mut collected, mut outstanding) = (0.0, 0.0, 0.0);
    let (mut paid, mut partial, mut unpaid) = (0usize, 0usize, 0usize);
    for (id, admission_no, name) in students {
        let ledger = student_ledger(conn, &id, &term, &session)?;
        expected += ledger.required;
        collected += ledger.paid;
        outstanding += ledger.balance;
        match ledger.status {
            FeeStatus::Paid => paid += 1,
            FeeStatus::Partial => partial += 1,
            FeeStatus::Unpaid => unpaid += 1,
        }
        rows.push(json!({
            "studentId": id,
            "admissionNo": admission_no,
            "studentName": name,
            "ledger": ledger,
        }));
    }

    Ok(json!({
        "classId": class_id,
        "term": term,
        "session": session,
        "students": rows,
        "totals": {
            "expected": fees::round_money(expected),
            "collected": fees::round_money(collected),
            "outstanding": fees::round_money(outstanding),
        },
        "counts": { "paid": paid, "partial": partial, "unpaid": unpaid },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "fees.structures.upsert" => handle_structures_upsert(state, req),
        "fees.structures.list" => handle_structures_list(state, req),
        "fees.status" => handle_fees_status(state, req),
        "fees.classOverview" => handle_class_overview(state, req),
        "payments.record" => handle_payments_record(state, req),
        "payments.updateStatus" => handle_payments_update_status(state, req),
        "payments.list" => handle_payments_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
