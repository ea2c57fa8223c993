use serde_json::{json, Value};
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
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

fn error_code(value: &Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    user_id: &str,
    password: &str,
    role: &str,
) -> String {
    let r = request_ok(
        stdin,
        reader,
        &format!("login-{}", user_id),
        "auth.login",
        json!({ "userId": user_id, "password": password, "role": role }),
    );
    r["token"].as_str().expect("token").to_string()
}

fn post(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
    audience: &str,
    dept: Option<&str>,
) -> String {
    let r = request_ok(
        stdin,
        reader,
        id,
        "circulars.create",
        json!({
            "token": token, "title": format!("Notice {}", id), "content": "Details inside.",
            "audience": audience, "deptCode": dept
        }),
    );
    r["circularId"].as_str().expect("circular id").to_string()
}

fn visible(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
) -> Vec<String> {
    let r = request_ok(stdin, reader, id, "circulars.list", json!({ "token": token }));
    let mut ids: Vec<String> = r["circulars"]
        .as_array()
        .expect("circulars")
        .iter()
        .filter_map(|c| c["circularId"].as_str().map(|s| s.to_string()))
        .collect();
    ids.sort();
    ids
}

fn sorted(ids: &[&String]) -> Vec<String> {
    let mut v: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    v.sort();
    v
}

#[test]
fn audiences_decide_who_sees_what() {
    let workspace = temp_dir("campusd-circulars");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.bootstrapAdmin",
        json!({ "userId": "admin", "password": "admin-pass" }),
    );
    let admin = login(&mut stdin, &mut reader, "admin", "admin-pass", "admin");
    let seed = vec![
        json!({ "token": admin, "code": "CSE", "name": "Computer Science" }),
        json!({ "token": admin, "code": "MECH", "name": "Mechanical" }),
    ];
    for (i, params) in seed.into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("dept-{}", i),
            "departments.upsert",
            params,
        );
    }
    let users = vec![
        json!({
            "token": admin, "userId": "F1", "password": "faculty-pass",
            "role": "faculty", "name": "Dr. Rao", "departmentCode": "CSE"
        }),
        json!({
            "token": admin, "userId": "F2", "password": "faculty-pass",
            "role": "faculty", "name": "Dr. Nair", "departmentCode": "MECH"
        }),
        json!({
            "token": admin, "userId": "1RV22CS001", "password": "student-pass",
            "role": "student", "name": "Asha", "departmentCode": "CSE",
            "semester": 5, "section": "A"
        }),
    ];
    for (i, params) in users.into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("user-{}", i),
            "users.create",
            params,
        );
    }

    let everyone = post(&mut stdin, &mut reader, "c1", &admin, "all", None);
    let students = post(&mut stdin, &mut reader, "c2", &admin, "students", None);
    let faculty = post(&mut stdin, &mut reader, "c3", &admin, "faculty", None);
    let cse = post(&mut stdin, &mut reader, "c4", &admin, "specific_dept", Some("CSE"));

    let f1 = login(&mut stdin, &mut reader, "F1", "faculty-pass", "faculty");
    let mech_by_f1 = post(&mut stdin, &mut reader, "c5", &f1, "specific_dept", Some("mech"));
    assert_eq!(
        visible(&mut stdin, &mut reader, "v-f1", &f1),
        sorted(&[&everyone, &faculty, &cse, &mech_by_f1])
    );

    let student = login(&mut stdin, &mut reader, "1RV22CS001", "student-pass", "student");
    assert_eq!(
        visible(&mut stdin, &mut reader, "v-student", &student),
        sorted(&[&everyone, &students, &cse])
    );
    let denied = request(
        &mut stdin,
        &mut reader,
        "s-post",
        "circulars.create",
        json!({ "token": student, "title": "Hi", "content": "x", "audience": "all" }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    let f2 = login(&mut stdin, &mut reader, "F2", "faculty-pass", "faculty");
    assert_eq!(
        visible(&mut stdin, &mut reader, "v-f2", &f2),
        sorted(&[&everyone, &faculty, &mech_by_f1])
    );
    let hidden = request(
        &mut stdin,
        &mut reader,
        "f2-get",
        "circulars.get",
        json!({ "token": f2, "circularId": students }),
    );
    assert_eq!(error_code(&hidden), "not_found");
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "f2-get-mech",
        "circulars.get",
        json!({ "token": f2, "circularId": mech_by_f1 }),
    );
    assert_eq!(got["deptCode"], "MECH");
    assert_eq!(got["authorUserId"], "F1");
    let not_author = request(
        &mut stdin,
        &mut reader,
        "f2-edit",
        "circulars.delete",
        json!({ "token": f2, "circularId": mech_by_f1 }),
    );
    assert_eq!(error_code(&not_author), "forbidden");

    let admin = login(&mut stdin, &mut reader, "admin", "admin-pass", "admin");
    assert_eq!(visible(&mut stdin, &mut reader, "v-admin", &admin).len(), 5);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "admin-delete",
        "circulars.delete",
        json!({ "token": admin, "circularId": mech_by_f1 }),
    );
    assert_eq!(visible(&mut stdin, &mut reader, "v-admin-2", &admin).len(), 4);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn audience_and_department_must_agree() {
    let workspace = temp_dir("campusd-circulars-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.bootstrapAdmin",
        json!({ "userId": "admin", "password": "admin-pass" }),
    );
    let admin = login(&mut stdin, &mut reader, "admin", "admin-pass", "admin");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departments.upsert",
        json!({ "token": admin, "code": "CSE", "name": "Computer Science" }),
    );

    let cases = vec![
        json!({ "audience": "specific_dept" }),
        json!({ "audience": "all", "deptCode": "CSE" }),
        json!({ "audience": "parents" }),
        json!({ "audience": "all", "title": "x".repeat(201) }),
    ];
    for (i, case) in cases.into_iter().enumerate() {
        let mut params = json!({ "token": admin, "title": "Exam schedule", "content": "Soon." });
        if let (Some(p), Some(c)) = (params.as_object_mut(), case.as_object()) {
            for (k, v) in c {
                p.insert(k.clone(), v.clone());
            }
        }
        let r = request(
            &mut stdin,
            &mut reader,
            &format!("bad-{}", i),
            "circulars.create",
            params,
        );
        assert_eq!(error_code(&r), "bad_params", "case {} accepted: {}", i, r);
    }

    let unknown_dept = request(
        &mut stdin,
        &mut reader,
        "4",
        "circulars.create",
        json!({
            "token": admin, "title": "Lab", "content": "Closed.",
            "audience": "specific_dept", "deptCode": "CIVIL"
        }),
    );
    assert_eq!(error_code(&unknown_dept), "not_found");

    let id = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "circulars.create",
        json!({ "token": admin, "title": "Lab", "content": "Closed.", "audience": "faculty" }),
    )["circularId"]
        .as_str()
        .expect("id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "circulars.update",
        json!({
            "token": admin, "circularId": id, "title": "Lab", "content": "Open again.",
            "audience": "all"
        }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "circulars.get",
        json!({ "token": admin, "circularId": id }),
    );
    assert_eq!(got["audience"], "all");
    assert_eq!(got["content"], "Open again.");
    assert!(got["updatedAt"].is_string());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
