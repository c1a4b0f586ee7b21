use crate::approval::{self, ResultStatus};
use crate::auth::{Capability, Role};
use crate::calc::{self, Grade, GradingPolicy, Scores};
use crate::db;
use crate::fees::FeeStatus;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{
    db_conn, ensure_can_see_student, exists, optional_session, optional_str, optional_term,
    parse_session, parse_term, require, required_f64, required_str, string_list,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::fees::student_ledger;
use super::notifications::{self, Draft, Kind};
use super::setup;

/// One student's place in their class for a period.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub student_id: String,
    pub student_name: String,
    pub admission_no: String,
    pub subjects: usize,
    pub total_score: f64,
    pub average: f64,
    pub grade: Grade,
    pub position: usize,
}

/// Ranks every student in the class who has at least one result in the
/// period. Ties on the average share a position.
pub fn class_standings(
    conn: &Connection,
    class_id: &str,
    term: &str,
    session: &str,
) -> Result<Vec<Standing>, IpcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name || ' ' || s.last_name, s.admission_no, r.total, r.percentage
             FROM results r
             JOIN students s ON s.id = r.student_id
             WHERE s.class_id = ? AND r.term = ? AND r.session = ?
             ORDER BY s.id",
        )
        .map_err(IpcError::query)?;
    let rows = stmt
        .query_map((class_id, term, session), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let mut per_student: BTreeMap<String, (String, String, f64, Vec<f64>)> = BTreeMap::new();
    for (id, name, admission_no, total, percentage) in rows {
        let entry = per_student
            .entry(id)
            .or_insert_with(|| (name, admission_no, 0.0, Vec::new()));
        entry.2 += total;
        entry.3.push(percentage);
    }

    let mut standings: Vec<Standing> = per_student
        .into_iter()
        .filter_map(|(student_id, (student_name, admission_no, total_score, pcts))| {
            let average = calc::round_off_1_decimal(calc::mean(&pcts)?);
            Some(Standing {
                student_id,
                student_name,
                admission_no,
                subjects: pcts.len(),
                total_score,
                average,
                grade: Grade::from_percentage(average),
                position: 0,
            })
        })
        .collect();

    let averages: Vec<f64> = standings.iter().map(|s| s.average).collect();
    for (standing, rank) in standings.iter_mut().zip(calc::competition_ranks(&averages)) {
        standing.position = rank;
    }
    standings.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    Ok(standings)
}

fn scores_from(req: &Request) -> Result<Scores, IpcError> {
    Ok(Scores {
        test1: required_f64(req, "test1")?,
        test2: required_f64(req, "test2")?,
        exam: required_f64(req, "exam")?,
    })
}

fn handle_results_record(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::RecordResults)?;
    let student_id = required_str(req, "studentId")?;
    let subject_id = required_str(req, "subjectId")?;
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;
    let scores = scores_from(req)?;
    let remark = optional_str(req, "remark")?;

    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(IpcError::NotFound("student"));
    }
    if !exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(IpcError::NotFound("subject"));
    }

    let config = setup::grading_config(conn)?;
    let computed = calc::compute_result(scores, &config)?;

    // Any edit sends the result back through approval.
    conn.execute(
        "INSERT INTO results(id, student_id, subject_id, term, session, test1, test2, exam,
                             total, percentage, grade, policy, status, remark, recorded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term, session) DO UPDATE SET
           test1 = excluded.test1,
           test2 = excluded.test2,
           exam = excluded.exam,
           total = excluded.total,
           percentage = excluded.percentage,
           grade = excluded.grade,
           policy = excluded.policy,
           status = 'pending',
           remark = excluded.remark,
           recorded_by = excluded.recorded_by,
           status_changed_by = NULL,
           status_changed_at = NULL,
           updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            &student_id,
            &subject_id,
            &term,
            &session,
            scores.test1,
            scores.test2,
            scores.exam,
            computed.total,
            computed.percentage,
            computed.grade.letter(),
            config.policy.as_str(),
            &remark,
            &me.user_id,
            db::now_rfc3339(),
        ],
    )
    .map_err(|e| IpcError::insert("results", e))?;

    let result_id: String = conn
        .query_row(
            "SELECT id FROM results
             WHERE student_id = ? AND subject_id = ? AND term = ? AND session = ?",
            (&student_id, &subject_id, &term, &session),
            |r| r.get(0),
        )
        .map_err(IpcError::query)?;

    tracing::info!(
        result = %result_id,
        student = %student_id,
        subject = %subject_id,
        percentage = computed.percentage,
        "result recorded"
    );
    Ok(json!({
        "resultId": result_id,
        "total": computed.total,
        "percentage": computed.percentage,
        "grade": computed.grade.letter(),
        "remark": computed.grade.remark(),
        "policy": config.policy.as_str(),
        "status": ResultStatus::Pending.as_str(),
    }))
}

const RESULT_COLUMNS: &str = "r.id, r.student_id, s.first_name || ' ' || s.last_name, s.class_id,
       r.subject_id, sub.name, r.term, r.session, r.test1, r.test2, r.exam, r.total,
       r.percentage, r.grade, r.status, r.remark, r.updated_at";

fn result_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "classId": r.get::<_, String>(3)?,
        "subjectId": r.get::<_, String>(4)?,
        "subjectName": r.get::<_, String>(5)?,
        "term": r.get::<_, String>(6)?,
        "session": r.get::<_, String>(7)?,
        "test1": r.get::<_, f64>(8)?,
        "test2": r.get::<_, f64>(9)?,
        "exam": r.get::<_, f64>(10)?,
        "total": r.get::<_, f64>(11)?,
        "percentage": r.get::<_, f64>(12)?,
        "grade": r.get::<_, String>(13)?,
        "status": r.get::<_, String>(14)?,
        "remark": r.get::<_, Option<String>>(15)?,
        "updatedAt": r.get::<_, String>(16)?,
    }))
}

fn handle_results_list(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ViewResults)?;
    let class_id = optional_str(req, "classId")?;
    let student_id = optional_str(req, "studentId")?;
    let subject_id = optional_str(req, "subjectId")?;
    let term = optional_term(req)?;
    let session = optional_session(req)?;
    let status = optional_str(req, "status")?
        .map(|s| {
            ResultStatus::parse(&s)
                .map(|st| st.as_str().to_string())
                .ok_or_else(|| IpcError::bad("status must be one of: pending, approved, blocked"))
        })
        .transpose()?;

    let sql = format!(
        "SELECT {}
         FROM results r
         JOIN students s ON s.id = r.student_id
         JOIN subjects sub ON sub.id = r.subject_id
         WHERE (?1 IS NULL OR s.class_id = ?1)
           AND (?2 IS NULL OR r.student_id = ?2)
           AND (?3 IS NULL OR r.subject_id = ?3)
           AND (?4 IS NULL OR r.term = ?4)
           AND (?5 IS NULL OR r.session = ?5)
           AND (?6 IS NULL OR r.status = ?6)
         ORDER BY r.session DESC, r.term, s.last_name, s.first_name, sub.name",
        RESULT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(IpcError::query)?;
    let results = stmt
        .query_map(
            (&class_id, &student_id, &subject_id, &term, &session, &status),
            result_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;
    tracing::debug!(count = results.len(), "results listed");
    Ok(json!({ "results": results }))
}

fn status_message(status: ResultStatus, term: &str, session: &str) -> (String, Kind) {
    match status {
        ResultStatus::Approved => (
            format!("Results for {} {} are now available.", term, session),
            Kind::Success,
        ),
        ResultStatus::Blocked => (
            format!(
                "Results for {} {} are on hold pending fee payment.",
                term, session
            ),
            Kind::Warning,
        ),
        ResultStatus::Pending => (
            format!("Results for {} {} are under review.", term, session),
            Kind::Info,
        ),
    }
}

/// Writes one status change per result and returns the distinct
/// (student, term, session) periods touched.
pub fn apply_status(
    conn: &Connection,
    result_ids: &[String],
    status: ResultStatus,
    changed_by: &str,
) -> Result<Vec<(String, String, String)>, IpcError> {
    let now = db::now_rfc3339();
    let mut touched: Vec<(String, String, String)> = Vec::new();
    for id in result_ids {
        let period: (String, String, String) = conn
            .query_row(
                "SELECT student_id, term, session FROM results WHERE id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .map_err(IpcError::query)?;
        conn.execute(
            "UPDATE results
             SET status = ?, status_changed_by = ?, status_changed_at = ?
             WHERE id = ?",
            (status.as_str(), changed_by, &now, id),
        )
        .map_err(|e| IpcError::update("results", e))?;
        if !touched.contains(&period) {
            touched.push(period);
        }
    }
    Ok(touched)
}

/// Tells parents about approve/block outcomes, once per student and period.
pub fn notify_status_change(
    conn: &Connection,
    touched: &[(String, String, String)],
    status: ResultStatus,
) -> Result<usize, IpcError> {
    if status == ResultStatus::Pending || !setup::approval_settings(conn)?.notify_parents {
        return Ok(0);
    }
    let title = match status {
        ResultStatus::Approved => "Results approved",
        _ => "Results withheld",
    };
    let mut sent = 0;
    for (student_id, term, session) in touched {
        let (message, kind) = status_message(status, term, session);
        let draft = Draft {
            title,
            message: &message,
            kind,
            link: None,
        };
        if notifications::push_to_parent_of(conn, student_id, &draft)? {
            sent += 1;
        }
    }
    Ok(sent)
}

fn handle_results_set_status(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::ApproveResults)?;
    let mut result_ids: Vec<String> = Vec::new();
    for id in string_list(req, "resultIds")? {
        if !result_ids.contains(&id) {
            result_ids.push(id);
        }
    }
    if result_ids.is_empty() {
        return Err(IpcError::bad("resultIds must not be empty"));
    }
    let status_raw = required_str(req, "status")?;
    let status = ResultStatus::parse(&status_raw)
        .ok_or_else(|| IpcError::bad("status must be one of: pending, approved, blocked"))?;

    let missing: Vec<&String> = result_ids
        .iter()
        .map(|id| exists(conn, "SELECT 1 FROM results WHERE id = ?", id).map(|found| (id, found)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, found)| !found)
        .map(|(id, _)| id)
        .collect();
    if !missing.is_empty() {
        return Err(IpcError::bad_with(
            "unknown result ids",
            json!({ "resultIds": missing }),
        ));
    }

    let tx = conn.unchecked_transaction().map_err(IpcError::tx)?;
    let touched = apply_status(&tx, &result_ids, status, &me.user_id)?;
    let notified = notify_status_change(&tx, &touched, status)?;
    tx.commit().map_err(IpcError::tx)?;

    tracing::info!(
        count = result_ids.len(),
        status = status.as_str(),
        notified,
        "result status changed"
    );
    Ok(json!({
        "updated": result_ids.len(),
        "status": status.as_str(),
        "parentsNotified": notified,
    }))
}

fn handle_class_summary(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ViewResults)?;
    let class_id = required_str(req, "classId")?;
    let term = parse_term(&required_str(req, "term")?)?;
    let session = parse_session(&required_str(req, "session")?)?;

    let class_name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(IpcError::query)?;
    let Some(class_name) = class_name else {
        return Err(IpcError::NotFound("class"));
    };

    let standings = class_standings(conn, &class_id, &term, &session)?;

    let mut stmt = conn
        .prepare(
            "SELECT sub.id, sub.name, r.percentage
             FROM results r
             JOIN students s ON s.id = r.student_id
             JOIN subjects sub ON sub.id = r.subject_id
             WHERE s.class_id = ? AND r.term = ? AND r.session = ?
             ORDER BY sub.name",
        )
        .map_err(IpcError::query)?;
    let rows = stmt
        .query_map((&class_id, &term, &session), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let mut by_subject: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for (id, name, pct) in rows {
        by_subject.entry((name, id)).or_default().push(pct);
    }
    let subjects: Vec<Value> = by_subject
        .into_iter()
        .filter_map(|((name, id), pcts)| {
            let stats = calc::spread(&pcts)?;
            Some(json!({
                "subjectId": id,
                "subjectName": name,
                "stats": stats,
            }))
        })
        .collect();

    let class_average = calc::mean(&standings.iter().map(|s| s.average).collect::<Vec<_>>())
        .map(calc::round_off_1_decimal);

    Ok(json!({
        "classId": class_id,
        "className": class_name,
        "term": term,
        "session": session,
        "classAverage": class_average,
        "students": standings,
        "subjects": subjects,
    }))
}

fn handle_results_for_parent(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    let me = require(state, Capability::ViewOwnChildren)?;
    let student_id = optional_str(req, "studentId")?;
    if let Some(sid) = &student_id {
        ensure_can_see_student(conn, &me, sid)?;
    }
    let term = optional_term(req)?;
    let session = optional_session(req)?;

    let sql = format!(
        "SELECT {}
         FROM results r
         JOIN students s ON s.id = r.student_id
         JOIN subjects sub ON sub.id = r.subject_id
         WHERE s.parent_id = ?1
           AND (?2 IS NULL OR r.student_id = ?2)
           AND (?3 IS NULL OR r.term = ?3)
           AND (?4 IS NULL OR r.session = ?4)
           AND r.status = 'approved'
         ORDER BY r.session DESC, r.term, s.first_name, sub.name",
        RESULT_COLUMNS
    );
    // Admins reach this too; they see what the linked parent would.
    let owner = if me.role == Role::Parent {
        Some(me.user_id.clone())
    } else {
        match &student_id {
            Some(sid) => crate::ipc::helpers::student_parent(conn, sid)?,
            None => None,
        }
    };
    let Some(owner) = owner else {
        return Ok(json!({ "results": [], "withheld": 0 }));
    };

    let mut stmt = conn.prepare(&sql).map_err(IpcError::query)?;
    let approved = stmt
        .query_map((&owner, &student_id, &term, &session), result_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(IpcError::query)?;

    let mut fee_cache: HashMap<(String, String, String), FeeStatus> = HashMap::new();
    let mut visible = Vec::with_capacity(approved.len());
    let mut withheld = 0usize;
    for row in approved {
        let key = (
            row["studentId"].as_str().unwrap_or_default().to_string(),
            row["term"].as_str().unwrap_or_default().to_string(),
            row["session"].as_str().unwrap_or_default().to_string(),
        );
        let fee = match fee_cache.get(&key) {
            Some(f) => *f,
            None => {
                let f = student_ledger(conn, &key.0, &key.1, &key.2)?.status;
                fee_cache.insert(key, f);
                f
            }
        };
        if approval::visible_to_parent(ResultStatus::Approved, fee) {
            visible.push(row);
        } else {
            withheld += 1;
        }
    }
    Ok(json!({ "results": visible, "withheld": withheld }))
}

fn handle_grading_preview(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let mut config = match state.db.as_ref() {
        Some(conn) => setup::grading_config(conn)?,
        None => Default::default(),
    };
    if let Some(raw) = optional_str(req, "policy")? {
        config.policy = GradingPolicy::parse(&raw)
            .ok_or_else(|| IpcError::bad("policy must be one of: raw_sum, weighted, direct"))?;
    }
    let computed = calc::compute_result(scores_from(req)?, &config)?;
    Ok(json!({
        "policy": config.policy.as_str(),
        "caps": calc::component_caps(&config),
        "total": computed.total,
        "percentage": computed.percentage,
        "grade": computed.grade.letter(),
        "remark": computed.grade.remark(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "results.record" => handle_results_record(state, req),
        "results.list" => handle_results_list(state, req),
        "results.setStatus" => handle_results_set_status(state, req),
        "results.classSummary" => handle_class_summary(state, req),
        "results.forParent" => handle_results_for_parent(state, req),
        "grading.preview" => handle_grading_preview(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
