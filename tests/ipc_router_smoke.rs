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

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
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

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(value: &serde_json::Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, value))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("academy-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.pointer("/ok").and_then(|v| v.as_bool()), Some(true));
    assert!(health.pointer("/result/workspacePath").is_some_and(|v| v.is_null()));

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "name": "Head Admin", "email": "admin@school.test", "password": "secret1", "role": "admin" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "secret1" }),
    );
    let _ = request(&mut stdin, &mut reader, "5", "auth.whoami", json!({}));
    let _ = request(&mut stdin, &mut reader, "6", "setup.get", json!({}));

    let class = request(&mut stdin, &mut reader, "7", "classes.create", json!({ "name": "JSS 1" }));
    let class_id = result_str(&class, "/result/classId");
    let subject = request(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "mth" }),
    );
    let subject_id = result_str(&subject, "/result/subjectId");
    let student = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({ "firstName": "Ada", "lastName": "Obi", "admissionNo": "gra/001", "classId": class_id }),
    );
    let student_id = result_str(&student, "/result/studentId");
    let period = json!({ "term": "First Term", "session": "2024/2025" });

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("users.list", json!({})),
        ("classes.list", json!({})),
        ("subjects.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("students.mine", json!({})),
        (
            "students.update",
            json!({ "studentId": student_id, "patch": { "gender": "female" } }),
        ),
        (
            "results.record",
            json!({
                "studentId": student_id, "subjectId": subject_id,
                "term": "First Term", "session": "2024/2025",
                "test1": 70, "test2": 80, "exam": 90
            }),
        ),
        ("results.list", json!({})),
        ("results.classSummary", json!({ "classId": class_id, "term": "First Term", "session": "2024/2025" })),
        ("results.forParent", json!({})),
        ("grading.preview", json!({ "test1": 10, "test2": 10, "exam": 10 })),
        (
            "fees.structures.upsert",
            json!({ "classId": class_id, "term": "First Term", "session": "2024/2025", "totalFee": 50000 }),
        ),
        ("fees.structures.list", json!({})),
        (
            "payments.record",
            json!({ "studentId": student_id, "term": "First Term", "session": "2024/2025", "amount": 1000, "method": "cash" }),
        ),
        ("payments.list", json!({})),
        ("fees.status", json!({ "studentId": student_id, "term": "First Term", "session": "2024/2025" })),
        ("fees.classOverview", json!({ "classId": class_id, "term": "First Term", "session": "2024/2025" })),
        ("approvals.list", period.clone()),
        ("approvals.applyFeeGate", period.clone()),
        ("reports.reportCard", json!({ "studentId": student_id, "term": "First Term", "session": "2024/2025" })),
        ("dashboard.summary", period.clone()),
        ("notifications.list", json!({})),
        ("notifications.unreadCount", json!({})),
        ("notifications.markAllRead", json!({})),
        ("notifications.create", json!({ "title": "Hi", "message": "Welcome" })),
        ("notifications.clear", json!({})),
        ("results.setStatus", json!({ "resultIds": [], "status": "approved" })),
        ("payments.updateStatus", json!({ "paymentId": "missing", "status": "failed" })),
        ("reports.receipt", json!({ "paymentId": "missing" })),
        ("notifications.markRead", json!({ "notificationId": "missing" })),
        ("notifications.delete", json!({ "notificationId": "missing" })),
        ("auth.changePassword", json!({ "currentPassword": "secret1", "newPassword": "secret2" })),
        ("backup.exportWorkspaceBundle", json!({ "outPath": bundle_out.to_string_lossy() })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("smoke-{}", i);
        let _ = request(&mut stdin, &mut reader, &id, method, params);
    }

    let imported = request(
        &mut stdin,
        &mut reader,
        "90",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );
    assert_eq!(imported.pointer("/ok").and_then(|v| v.as_bool()), Some(true), "{}", imported);
    let _ = request(&mut stdin, &mut reader, "91", "auth.logout", json!({}));
    let _ = request(&mut stdin, &mut reader, "92", "subjects.delete", json!({ "subjectId": subject_id }));
    let _ = request(&mut stdin, &mut reader, "93", "students.delete", json!({ "studentId": student_id }));
    let _ = request(&mut stdin, &mut reader, "94", "classes.delete", json!({ "classId": class_id }));
    let _ = request(&mut stdin, &mut reader, "95", "users.delete", json!({ "userId": "missing" }));

    let unknown = request_raw(&mut stdin, &mut reader, "96", "nope.method");
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let garbage = read_response(&mut reader);
    assert_eq!(garbage.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        garbage.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_json")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
) -> serde_json::Value {
    writeln!(stdin, "{}", json!({ "id": id, "method": method })).expect("write request");
    stdin.flush().expect("flush request");
    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}
