use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_academyd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn academyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value.pointer("/error/code").and_then(|v| v.as_str())
}

fn str_at(value: &serde_json::Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, value))
        .to_string()
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    email: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "auth.login",
        json!({ "email": email, "password": "secret1" }),
    );
}

#[test]
fn results_record_rank_and_reset_on_edit() {
    let workspace = temp_dir("academy-results-workflow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (s, r) = (&mut stdin, &mut reader);

    let _ = request_ok(s, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let _ = request_ok(
        s,
        r,
        "2",
        "users.create",
        json!({ "name": "Admin", "email": "admin@school.test", "password": "secret1", "role": "admin" }),
    );
    login(s, r, "3", "admin@school.test");
    let _ = request_ok(
        s,
        r,
        "4",
        "users.create",
        json!({ "name": "Mrs Eze", "email": "eze@school.test", "password": "secret1", "role": "teacher" }),
    );

    let class_id = str_at(
        &request_ok(s, r, "5", "classes.create", json!({ "name": "JSS 1", "level": "Junior" })),
        "/classId",
    );
    let maths = str_at(
        &request_ok(s, r, "6", "subjects.create", json!({ "name": "Mathematics" })),
        "/subjectId",
    );
    let english = str_at(
        &request_ok(s, r, "7", "subjects.create", json!({ "name": "English" })),
        "/subjectId",
    );
    let mut students = Vec::new();
    for (i, (first, last)) in [("Ada", "Obi"), ("Bola", "Ade"), ("Chidi", "Nwosu")]
        .iter()
        .enumerate()
    {
        let created = request_ok(
            s,
            r,
            &format!("st-{}", i),
            "students.create",
            json!({
                "firstName": first,
                "lastName": last,
                "admissionNo": format!("GRA/{:03}", i + 1),
                "classId": class_id,
            }),
        );
        students.push(str_at(&created, "/studentId"));
    }

    let dup = request(
        s,
        r,
        "8",
        "students.create",
        json!({ "firstName": "Dup", "lastName": "Licate", "admissionNo": "gra/001", "classId": class_id }),
    );
    assert_eq!(error_code(&dup), Some("conflict"));

    // The "teacher" alias signs in as a supervisor.
    login(s, r, "9", "eze@school.test");
    let who = request_ok(s, r, "10", "auth.whoami", json!({}));
    assert_eq!(who.get("role").and_then(|v| v.as_str()), Some("supervisor"));

    let scores = [(80, 90, 70), (90, 80, 70), (60, 60, 60)];
    let mut result_ids = Vec::new();
    for (i, (student, (t1, t2, ex))) in students.iter().zip(scores).enumerate() {
        let rec = request_ok(
            s,
            r,
            &format!("rec-{}", i),
            "results.record",
            json!({
                "studentId": student,
                "subjectId": maths,
                "term": "first",
                "session": "2024/2025",
                "test1": t1,
                "test2": t2,
                "exam": ex,
            }),
        );
        assert_eq!(rec.get("status").and_then(|v| v.as_str()), Some("pending"));
        assert_eq!(rec.get("policy").and_then(|v| v.as_str()), Some("raw_sum"));
        result_ids.push(str_at(&rec, "/resultId"));
    }

    let first = request_ok(
        s,
        r,
        "11",
        "results.list",
        json!({ "studentId": students[0], "term": "First Term", "session": "2024/2025" }),
    );
    let rows = first.get("results").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("total").and_then(|v| v.as_f64()), Some(240.0));
    assert_eq!(rows[0].get("percentage").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(rows[0].get("grade").and_then(|v| v.as_str()), Some("A"));

    let summary = request_ok(
        s,
        r,
        "12",
        "results.classSummary",
        json!({ "classId": class_id, "term": "First Term", "session": "2024/2025" }),
    );
    let ranked = summary.get("students").and_then(|v| v.as_array()).expect("students");
    assert_eq!(ranked.len(), 3);
    let positions: Vec<i64> = ranked
        .iter()
        .map(|row| row.get("position").and_then(|v| v.as_i64()).expect("position"))
        .collect();
    assert_eq!(positions, vec![1, 1, 3]);
    assert_eq!(
        ranked[2].get("studentName").and_then(|v| v.as_str()),
        Some("Chidi Nwosu")
    );
    assert_eq!(ranked[2].get("grade").and_then(|v| v.as_str()), Some("C"));
    assert_eq!(
        summary.pointer("/subjects/0/stats/average").and_then(|v| v.as_f64()),
        Some(73.3)
    );
    assert_eq!(
        summary.pointer("/subjects/0/stats/highest").and_then(|v| v.as_f64()),
        Some(80.0)
    );
    assert_eq!(
        summary.pointer("/subjects/0/stats/lowest").and_then(|v| v.as_f64()),
        Some(60.0)
    );

    let too_high = request(
        s,
        r,
        "13",
        "results.record",
        json!({
            "studentId": students[0], "subjectId": english,
            "term": "First Term", "session": "2024/2025",
            "test1": 120, "test2": 10, "exam": 10
        }),
    );
    assert_eq!(error_code(&too_high), Some("bad_params"));

    let bad_term = request(
        s,
        r,
        "14",
        "results.record",
        json!({
            "studentId": students[0], "subjectId": english,
            "term": "Fourth Term", "session": "2024/2025",
            "test1": 10, "test2": 10, "exam": 10
        }),
    );
    assert_eq!(error_code(&bad_term), Some("bad_params"));

    let bad_session = request(
        s,
        r,
        "15",
        "results.record",
        json!({
            "studentId": students[0], "subjectId": english,
            "term": "First Term", "session": "2024/2026",
            "test1": 10, "test2": 10, "exam": 10
        }),
    );
    assert_eq!(error_code(&bad_session), Some("bad_params"));

    let signed_session = request(
        s,
        r,
        "15b",
        "results.record",
        json!({
            "studentId": students[0], "subjectId": english,
            "term": "First Term", "session": "-001/0000",
            "test1": 10, "test2": 10, "exam": 10
        }),
    );
    assert_eq!(error_code(&signed_session), Some("bad_params"));

    let denied = request(
        s,
        r,
        "16",
        "results.setStatus",
        json!({ "resultIds": [result_ids[0]], "status": "approved" }),
    );
    assert_eq!(error_code(&denied), Some("forbidden"));

    login(s, r, "17", "admin@school.test");
    let approved = request_ok(
        s,
        r,
        "18",
        "results.setStatus",
        json!({ "resultIds": [result_ids[0], result_ids[0]], "status": "approved" }),
    );
    // Repeated ids count once.
    assert_eq!(approved.get("updated").and_then(|v| v.as_i64()), Some(1));

    let unknown = request(
        s,
        r,
        "19",
        "results.setStatus",
        json!({ "resultIds": ["no-such-result"], "status": "approved" }),
    );
    assert_eq!(error_code(&unknown), Some("bad_params"));

    // Editing an approved result sends it back to pending.
    login(s, r, "20", "eze@school.test");
    let edited = request_ok(
        s,
        r,
        "21",
        "results.record",
        json!({
            "studentId": students[0], "subjectId": maths,
            "term": "First Term", "session": "2024/2025",
            "test1": 80, "test2": 90, "exam": 80
        }),
    );
    assert_eq!(edited.get("resultId").and_then(|v| v.as_str()), Some(result_ids[0].as_str()));
    assert_eq!(edited.get("status").and_then(|v| v.as_str()), Some("pending"));
    assert_eq!(edited.get("percentage").and_then(|v| v.as_f64()), Some(83.3));

    let pending = request_ok(
        s,
        r,
        "22",
        "results.list",
        json!({ "classId": class_id, "status": "pending" }),
    );
    assert_eq!(
        pending.get("results").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(3)
    );

    // Direct policy: components are capped at their weights.
    login(s, r, "23", "admin@school.test");
    let _ = request_ok(
        s,
        r,
        "24",
        "setup.update",
        json!({ "section": "grading", "patch": { "policy": "direct" } }),
    );
    let direct = request_ok(
        s,
        r,
        "25",
        "results.record",
        json!({
            "studentId": students[0], "subjectId": english,
            "term": "First Term", "session": "2024/2025",
            "test1": 15, "test2": 18, "exam": 45
        }),
    );
    assert_eq!(direct.get("total").and_then(|v| v.as_f64()), Some(78.0));
    assert_eq!(direct.get("percentage").and_then(|v| v.as_f64()), Some(78.0));
    assert_eq!(direct.get("grade").and_then(|v| v.as_str()), Some("B"));
    assert_eq!(direct.get("policy").and_then(|v| v.as_str()), Some("direct"));

    let over_cap = request(
        s,
        r,
        "26",
        "results.record",
        json!({
            "studentId": students[1], "subjectId": english,
            "term": "First Term", "session": "2024/2025",
            "test1": 25, "test2": 18, "exam": 45
        }),
    );
    assert_eq!(error_code(&over_cap), Some("bad_params"));

    let blocked_delete = request(s, r, "27", "subjects.delete", json!({ "subjectId": maths }));
    assert_eq!(error_code(&blocked_delete), Some("conflict"));
    let class_busy = request(s, r, "28", "classes.delete", json!({ "classId": class_id }));
    assert_eq!(error_code(&class_busy), Some("conflict"));

    let removed = request_ok(s, r, "29", "students.delete", json!({ "studentId": students[2] }));
    assert_eq!(removed.get("resultsRemoved").and_then(|v| v.as_i64()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}
