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
    password: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "auth.login",
        json!({ "email": email, "password": password }),
    )
}

#[test]
fn bootstrap_and_credentials() {
    let workspace = temp_dir("academy-bootstrap");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (s, r) = (&mut stdin, &mut reader);

    let early = request(
        s,
        r,
        "1",
        "users.create",
        json!({ "name": "Admin", "email": "admin@school.test", "password": "secret1", "role": "admin" }),
    );
    assert_eq!(error_code(&early), Some("no_workspace"));

    let _ = request_ok(s, r, "2", "workspace.select", json!({ "path": workspace.to_string_lossy() }));

    let not_admin = request(
        s,
        r,
        "3",
        "users.create",
        json!({ "name": "Bursar", "email": "bursar@school.test", "password": "secret1", "role": "accountant" }),
    );
    assert_eq!(error_code(&not_admin), Some("bad_params"));
    let weak = request(
        s,
        r,
        "4",
        "users.create",
        json!({ "name": "Admin", "email": "admin@school.test", "password": "abc", "role": "admin" }),
    );
    assert_eq!(error_code(&weak), Some("bad_params"));

    let _ = request_ok(
        s,
        r,
        "5",
        "users.create",
        json!({ "name": "Admin", "email": " Admin@School.TEST ", "password": "secret1", "role": "admin" }),
    );

    // Once an account exists, creating another needs a signed-in admin.
    let second = request(
        s,
        r,
        "6",
        "users.create",
        json!({ "name": "Other", "email": "other@school.test", "password": "secret1", "role": "admin" }),
    );
    assert_eq!(error_code(&second), Some("unauthenticated"));

    let wrong = request(
        s,
        r,
        "7",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "nope-nope" }),
    );
    assert_eq!(error_code(&wrong), Some("invalid_credentials"));
    let unknown = request(
        s,
        r,
        "8",
        "auth.login",
        json!({ "email": "ghost@school.test", "password": "secret1" }),
    );
    assert_eq!(error_code(&unknown), Some("invalid_credentials"));

    let me = login(s, r, "9", "ADMIN@school.test", "secret1");
    assert_eq!(me.get("email").and_then(|v| v.as_str()), Some("admin@school.test"));
    assert_eq!(me.get("role").and_then(|v| v.as_str()), Some("admin"));
    let admin_id = str_at(&me, "/userId");

    let taken = request(
        s,
        r,
        "10",
        "users.create",
        json!({ "name": "Twin", "email": "admin@school.test", "password": "secret1", "role": "parent" }),
    );
    assert_eq!(error_code(&taken), Some("conflict"));

    let self_delete = request(s, r, "11", "users.delete", json!({ "userId": admin_id }));
    assert_eq!(error_code(&self_delete), Some("conflict"));

    let bad_current = request(
        s,
        r,
        "12",
        "auth.changePassword",
        json!({ "currentPassword": "wrong-one", "newPassword": "secret2" }),
    );
    assert_eq!(error_code(&bad_current), Some("invalid_credentials"));
    let _ = request_ok(
        s,
        r,
        "13",
        "auth.changePassword",
        json!({ "currentPassword": "secret1", "newPassword": "secret2" }),
    );

    let out = request_ok(s, r, "14", "auth.logout", json!({}));
    assert_eq!(out.get("signedOut").and_then(|v| v.as_bool()), Some(true));
    let anonymous = request(s, r, "15", "auth.whoami", json!({}));
    assert_eq!(error_code(&anonymous), Some("unauthenticated"));

    let stale = request(
        s,
        r,
        "16",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "secret1" }),
    );
    assert_eq!(error_code(&stale), Some("invalid_credentials"));
    let _ = login(s, r, "17", "admin@school.test", "secret2");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn capabilities_follow_roles() {
    let workspace = temp_dir("academy-roles");
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
    let _ = login(s, r, "3", "admin@school.test", "secret1");

    let accounts = [
        ("Supervisor", "sup@school.test", "supervisor"),
        ("Bursar", "bursar@school.test", "accountant"),
        ("Mrs Obi", "obi@home.test", "parent"),
        ("Mr Ade", "ade@home.test", "parent"),
    ];
    let mut ids = Vec::new();
    for (i, (name, email, role)) in accounts.iter().enumerate() {
        let created = request_ok(
            s,
            r,
            &format!("u-{}", i),
            "users.create",
            json!({ "name": name, "email": email, "password": "secret1", "role": role }),
        );
        ids.push(str_at(&created, "/userId"));
    }

    let parents = request_ok(s, r, "4", "users.list", json!({ "role": "parent" }));
    assert_eq!(
        parents.get("users").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let class_id = str_at(
        &request_ok(s, r, "5", "classes.create", json!({ "name": "SS 2" })),
        "/classId",
    );
    let not_parent = request(
        s,
        r,
        "6",
        "students.create",
        json!({
            "firstName": "Ife", "lastName": "Obi", "admissionNo": "GRA/SS2/01",
            "classId": class_id, "parentId": ids[1]
        }),
    );
    assert_eq!(error_code(&not_parent), Some("bad_params"));

    let ife = str_at(
        &request_ok(
            s,
            r,
            "7",
            "students.create",
            json!({
                "firstName": "Ife", "lastName": "Obi", "admissionNo": "GRA/SS2/01",
                "classId": class_id, "parentId": ids[2]
            }),
        ),
        "/studentId",
    );
    let seun = str_at(
        &request_ok(
            s,
            r,
            "8",
            "students.create",
            json!({
                "firstName": "Seun", "lastName": "Ade", "admissionNo": "GRA/SS2/02",
                "classId": class_id, "parentId": ids[3]
            }),
        ),
        "/studentId",
    );

    // Supervisor: results yes, money and setup no.
    let _ = login(s, r, "9", "sup@school.test", "secret1");
    let _ = request_ok(s, r, "10", "students.list", json!({ "classId": class_id }));
    let no_pay = request(
        s,
        r,
        "11",
        "payments.record",
        json!({ "studentId": ife, "term": "First Term", "session": "2024/2025", "amount": 5000, "method": "cash" }),
    );
    assert_eq!(error_code(&no_pay), Some("forbidden"));
    let no_users = request(s, r, "12", "users.list", json!({}));
    assert_eq!(error_code(&no_users), Some("forbidden"));
    let no_gate = request(
        s,
        r,
        "13",
        "approvals.applyFeeGate",
        json!({ "term": "First Term", "session": "2024/2025" }),
    );
    assert_eq!(error_code(&no_gate), Some("forbidden"));

    // Accountant: fees and approvals, but no result entry.
    let _ = login(s, r, "14", "bursar@school.test", "secret1");
    let _ = request_ok(
        s,
        r,
        "15",
        "payments.record",
        json!({ "studentId": ife, "term": "First Term", "session": "2024/2025", "amount": 5000, "method": "card" }),
    );
    let no_record = request(
        s,
        r,
        "16",
        "results.record",
        json!({
            "studentId": ife, "subjectId": "any",
            "term": "First Term", "session": "2024/2025",
            "test1": 1, "test2": 1, "exam": 1
        }),
    );
    assert_eq!(error_code(&no_record), Some("forbidden"));
    let no_backup = request(
        s,
        r,
        "17",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": workspace.join("x.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&no_backup), Some("forbidden"));

    // Parent: only their own child.
    let _ = login(s, r, "18", "obi@home.test", "secret1");
    let mine = request_ok(s, r, "19", "students.mine", json!({}));
    let kids = mine.get("students").and_then(|v| v.as_array()).expect("students");
    assert_eq!(kids.len(), 1);
    assert_eq!(kids[0].get("id").and_then(|v| v.as_str()), Some(ife.as_str()));

    let own = request_ok(
        s,
        r,
        "20",
        "fees.status",
        json!({ "studentId": ife, "term": "First Term", "session": "2024/2025" }),
    );
    assert_eq!(own.pointer("/ledger/paid").and_then(|v| v.as_f64()), Some(5000.0));
    let other = request(
        s,
        r,
        "21",
        "fees.status",
        json!({ "studentId": seun, "term": "First Term", "session": "2024/2025" }),
    );
    assert_eq!(error_code(&other), Some("forbidden"));
    let no_list = request(s, r, "22", "students.list", json!({}));
    assert_eq!(error_code(&no_list), Some("forbidden"));
    let no_results = request(s, r, "23", "results.list", json!({}));
    assert_eq!(error_code(&no_results), Some("forbidden"));

    let _ = std::fs::remove_dir_all(workspace);
}
