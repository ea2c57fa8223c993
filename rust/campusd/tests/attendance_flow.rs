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

fn seed_cse_and_mech(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "seed-boot",
        "auth.bootstrapAdmin",
        json!({ "userId": "admin", "password": "admin-pass" }),
    );
    let login = request_ok(
        stdin,
        reader,
        "seed-login",
        "auth.login",
        json!({ "userId": "admin", "password": "admin-pass", "role": "admin" }),
    );
    let token = login["token"].as_str().expect("token").to_string();

    for (i, (code, name)) in [("CSE", "Computer Science"), ("MECH", "Mechanical")]
        .iter()
        .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-dept-{}", i),
            "departments.upsert",
            json!({ "token": token, "code": code, "name": name }),
        );
    }
    for (i, (code, name, dept, sem)) in [
        ("CS501", "Compilers", "CSE", 5),
        ("CS502", "Networks", "CSE", 5),
        ("ME301", "Thermodynamics", "MECH", 3),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-subject-{}", i),
            "subjects.upsert",
            json!({
                "token": token, "code": code, "name": name,
                "departmentCode": dept, "semester": sem
            }),
        );
    }
    let _ = request_ok(
        stdin,
        reader,
        "seed-faculty",
        "users.create",
        json!({
            "token": token, "userId": "FAC001", "password": "faculty-pass",
            "role": "faculty", "name": "Dr. Rao", "departmentCode": "CSE"
        }),
    );
    for (i, (usn, dept, sem, section)) in [
        ("1RV22CS001", "CSE", 5, Some("A")),
        ("1RV22CS002", "CSE", 5, Some("A")),
        ("1RV22CS003", "CSE", 5, Some("B")),
        ("1RV22ME001", "MECH", 3, Some("A")),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "users.create",
            json!({
                "token": token, "userId": usn, "password": "student-pass",
                "role": "student", "name": format!("Student {}", i),
                "departmentCode": dept, "semester": sem, "section": section
            }),
        );
    }
    for (i, (subject, dept, sem, section)) in [
        ("CS501", "CSE", 5, Some("A")),
        ("CS502", "CSE", 5, Some("A")),
        ("ME301", "MECH", 3, None),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-assign-{}", i),
            "faculty.assign",
            json!({
                "token": token, "facultyUserId": "FAC001", "subjectCode": subject,
                "departmentCode": dept, "semester": sem, "section": section
            }),
        );
    }
    token
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

#[test]
fn submitted_sessions_roll_up_to_mean_of_subject_percentages() {
    let workspace = temp_dir("campusd-attendance-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_cse_and_mech(&mut stdin, &mut reader);
    let fac = login(&mut stdin, &mut reader, "FAC001", "faculty-pass", "faculty");

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.roster",
        json!({
            "token": fac, "semester": 5, "departmentCode": "CSE",
            "section": "A", "subjectCode": "CS501"
        }),
    );
    let students = roster["students"].as_array().expect("students");
    assert_eq!(students.len(), 2);
    assert!(students.iter().all(|s| s["status"] == "present"));
    assert_eq!(roster["canSubmit"], true);
    let first_id = students[0]["studentId"].as_str().expect("id").to_string();
    let second_id = students[1]["studentId"].as_str().expect("id").to_string();

    // Compilers: 10 sessions, first student present in 8.
    for day in 1..=10 {
        let status = if day <= 8 { "present" } else { "absent" };
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("cs501-{}", day),
            "attendance.submit",
            json!({
                "token": fac, "date": format!("2024-01-{:02}", day), "period": 1,
                "semester": 5, "departmentCode": "CSE", "section": "A", "subjectCode": "CS501",
                "entries": [
                    { "studentId": first_id, "status": status },
                    { "studentId": second_id, "status": "present" }
                ]
            }),
        );
    }
    // Networks: 20 sessions, present in 10.
    for day in 1..=20 {
        let status = if day <= 10 { "present" } else { "absent" };
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("cs502-{}", day),
            "attendance.submit",
            json!({
                "token": fac, "date": format!("2024-02-{:02}", day), "period": 2,
                "semester": 5, "departmentCode": "CSE", "section": "A", "subjectCode": "CS502",
                "entries": [{ "studentId": first_id, "status": status }]
            }),
        );
    }

    // Re-submitting the same (date, period) overwrites instead of adding a session.
    let resubmit = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.submit",
        json!({
            "token": fac, "date": "2024-01-10", "period": 1,
            "semester": 5, "departmentCode": "CSE", "section": "A", "subjectCode": "CS501",
            "entries": [{ "studentId": first_id, "status": "absent" }]
        }),
    );
    assert_eq!(resubmit["saved"], 1);

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.history",
        json!({
            "token": fac, "semester": 5, "departmentCode": "CSE", "section": "A",
            "subjectCode": "CS501"
        }),
    );
    let sessions = history["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 10);
    assert_eq!(sessions[0]["date"], "2024-01-10");
    assert_eq!(sessions[9]["date"], "2024-01-01");

    let student = login(&mut stdin, &mut reader, "1RV22CS001", "student-pass", "student");
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.mySummary",
        json!({ "token": student }),
    );
    let overall = &summary["overall"];
    assert_eq!(overall["percentage"].as_f64(), Some(65.0));
    assert_eq!(overall["totalClasses"], 30);
    assert_eq!(overall["presentClasses"], 18);
    assert_eq!(overall["lowAttendance"], true);
    assert_eq!(overall["band"], "danger");

    let subjects = summary["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0]["subjectCode"], "CS501");
    assert_eq!(subjects[0]["percentage"].as_f64(), Some(80.0));
    assert_eq!(subjects[0]["band"], "warning");
    assert_eq!(subjects[1]["subjectCode"], "CS502");
    assert_eq!(subjects[1]["percentage"].as_f64(), Some(50.0));

    // Students only see their own row of a session.
    let session_id = sessions[0]["sessionId"].as_str().expect("session id");
    let details = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.sessionDetails",
        json!({ "token": student, "sessionId": session_id }),
    );
    assert_eq!(details["entries"].as_array().map(|a| a.len()), Some(1));

    let forbidden = request(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.submit",
        json!({
            "token": student, "date": "2024-03-01", "period": 1,
            "semester": 5, "departmentCode": "CSE", "section": "A", "subjectCode": "CS501",
            "entries": [{ "studentId": first_id, "status": "present" }]
        }),
    );
    assert_eq!(error_code(&forbidden), "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn submission_from_replaced_roster_is_rejected() {
    let workspace = temp_dir("campusd-attendance-stale");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_cse_and_mech(&mut stdin, &mut reader);
    let fac = login(&mut stdin, &mut reader, "FAC001", "faculty-pass", "faculty");

    let class = json!({
        "token": fac, "semester": 5, "departmentCode": "CSE",
        "section": "A", "subjectCode": "CS501"
    });
    let first = request_ok(&mut stdin, &mut reader, "2", "attendance.roster", class.clone());
    let second = request_ok(&mut stdin, &mut reader, "3", "attendance.roster", class.clone());
    let old_gen = first["generation"].as_u64().expect("generation");
    let new_gen = second["generation"].as_u64().expect("generation");
    assert!(new_gen > old_gen);
    let student_id = second["students"][0]["studentId"].clone();

    let mut submit = class.clone();
    submit["date"] = json!("2024-04-01");
    submit["period"] = json!(3);
    submit["entries"] = json!([{ "studentId": student_id, "status": "absent" }]);

    let mut stale = submit.clone();
    stale["generation"] = json!(old_gen);
    let resp = request(&mut stdin, &mut reader, "4", "attendance.submit", stale);
    assert_eq!(error_code(&resp), "stale_roster");
    assert_eq!(resp["error"]["details"]["latest"].as_u64(), Some(new_gen));

    let mut current = submit.clone();
    current["generation"] = json!(new_gen);
    let _ = request_ok(&mut stdin, &mut reader, "5", "attendance.submit", current);

    // No generation: last write wins.
    let _ = request_ok(&mut stdin, &mut reader, "6", "attendance.submit", submit);

    // The stored status shows up on the next roster for the same slot.
    let mut reopen = class.clone();
    reopen["date"] = json!("2024-04-01");
    reopen["period"] = json!(3);
    let roster = request_ok(&mut stdin, &mut reader, "7", "attendance.roster", reopen);
    assert_eq!(roster["students"][0]["status"], "absent");
    assert_eq!(roster["students"][1]["status"], "present");
    assert!(roster["sessionId"].is_string());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn marks_sheet_fetch_does_not_stale_attendance_roster() {
    let workspace = temp_dir("campusd-attendance-marks-gen");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_cse_and_mech(&mut stdin, &mut reader);
    let fac = login(&mut stdin, &mut reader, "FAC001", "faculty-pass", "faculty");

    let class = json!({
        "token": fac, "semester": 5, "departmentCode": "CSE",
        "section": "A", "subjectCode": "CS501"
    });
    let roster = request_ok(&mut stdin, &mut reader, "2", "attendance.roster", class.clone());
    let roster_gen = roster["generation"].as_u64().expect("generation");
    let sheet = request_ok(&mut stdin, &mut reader, "3", "marks.classScores", class.clone());
    assert!(sheet["generation"].is_u64());

    let mut submit = class.clone();
    submit["date"] = json!("2024-04-02");
    submit["period"] = json!(1);
    submit["generation"] = json!(roster_gen);
    submit["entries"] = json!([{ "studentId": roster["students"][0]["studentId"], "status": "present" }]);
    let _ = request_ok(&mut stdin, &mut reader, "4", "attendance.submit", submit);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn section_rules_follow_department() {
    let workspace = temp_dir("campusd-attendance-sections");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_cse_and_mech(&mut stdin, &mut reader);
    let fac = login(&mut stdin, &mut reader, "FAC001", "faculty-pass", "faculty");

    // MECH has no sections: a supplied section is ignored.
    for (id, section) in [("2", Value::Null), ("3", json!("A"))] {
        let roster = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "attendance.roster",
            json!({
                "token": fac, "semester": 3, "departmentCode": "MECH",
                "section": section, "subjectCode": "ME301"
            }),
        );
        assert_eq!(roster["students"].as_array().map(|a| a.len()), Some(1));
        assert_eq!(roster["canSubmit"], true);
    }

    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.roster",
        json!({ "token": fac, "semester": 5, "departmentCode": "CSE", "subjectCode": "CS501" }),
    );
    assert_eq!(error_code(&missing), "bad_params");

    let unknown_section = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.roster",
        json!({
            "token": fac, "semester": 5, "departmentCode": "CSE",
            "section": "Z", "subjectCode": "CS501"
        }),
    );
    assert_eq!(error_code(&unknown_section), "bad_params");

    // Section B exists but FAC001 does not teach it; its student is not on the A roster.
    let roster_b = request(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.submit",
        json!({
            "token": fac, "date": "2024-01-01", "period": 1, "semester": 5,
            "departmentCode": "CSE", "section": "B", "subjectCode": "CS501",
            "entries": [{ "studentId": "x", "status": "present" }]
        }),
    );
    assert_eq!(error_code(&roster_b), "forbidden");

    let roster_a = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.roster",
        json!({
            "token": fac, "semester": 5, "departmentCode": "CSE",
            "section": "A", "subjectCode": "CS501"
        }),
    );
    assert_eq!(roster_a["students"].as_array().map(|a| a.len()), Some(2));
    let outsider = request(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.submit",
        json!({
            "token": fac, "date": "2024-01-01", "period": 1, "semester": 5,
            "departmentCode": "CSE", "section": "A", "subjectCode": "CS501",
            "entries": [{ "studentId": "not-a-student", "status": "present" }]
        }),
    );
    assert_eq!(error_code(&outsider), "bad_params");

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.submit",
        json!({
            "token": fac, "date": "01/02/2024", "period": 1, "semester": 5,
            "departmentCode": "CSE", "section": "A", "subjectCode": "CS501",
            "entries": [{ "studentId": "x", "status": "present" }]
        }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn section_flag_is_locked_once_department_has_rows() {
    let workspace = temp_dir("campusd-attendance-section-lock");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = seed_cse_and_mech(&mut stdin, &mut reader);

    let flip = request(
        &mut stdin,
        &mut reader,
        "2",
        "departments.upsert",
        json!({ "token": admin, "code": "CSE", "name": "Computer Science", "hasSections": false }),
    );
    assert_eq!(error_code(&flip), "conflict");

    // Renaming without the flag keeps the stored value.
    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departments.upsert",
        json!({ "token": admin, "code": "CSE", "name": "Computer Science and Engg" }),
    );
    assert_eq!(renamed["hasSections"], true);

    // An empty department may still change.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "departments.upsert",
        json!({ "token": admin, "code": "CIVIL", "name": "Civil", "hasSections": false }),
    );
    let civil = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "departments.upsert",
        json!({ "token": admin, "code": "CIVIL", "name": "Civil", "hasSections": true }),
    );
    assert_eq!(civil["hasSections"], true);

    let fac = login(&mut stdin, &mut reader, "FAC001", "faculty-pass", "faculty");
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.roster",
        json!({
            "token": fac, "semester": 5, "departmentCode": "CSE",
            "section": "A", "subjectCode": "CS501"
        }),
    );
    assert_eq!(roster["students"].as_array().map(|a| a.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_import_commits_good_rows_and_reports_the_rest() {
    let workspace = temp_dir("campusd-attendance-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = seed_cse_and_mech(&mut stdin, &mut reader);

    let student = |user: &str, dept: &str, sem: i64, section: Value| {
        json!({
            "userId": user, "password": "student-pass", "name": user,
            "departmentCode": dept, "semester": sem, "section": section
        })
    };
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.importStudents",
        json!({
            "token": admin,
            "rows": [
                student("1RV22CS010", "CSE", 5, json!("a")),
                student("1RV22CS011", "CSE", 5, json!("Z")),
                student("1RV22CS001", "CSE", 5, json!("A")),
                student("1RV22XX001", "XXX", 5, Value::Null),
                student("1RV22CS010", "CSE", 5, json!("A")),
                { "userId": "1RV22ME010", "password": "abc", "name": "Short",
                  "departmentCode": "MECH", "semester": 3 },
                student("1RV22ME011", "MECH", 3, Value::Null)
            ]
        }),
    );
    assert_eq!(imported["created"], 2);
    assert_eq!(imported["skipped"], 5);
    let codes: Vec<&str> = imported["results"]
        .as_array()
        .expect("results")
        .iter()
        .map(|r| r["code"].as_str().unwrap_or(r["status"].as_str().unwrap_or("")))
        .collect();
    assert_eq!(
        codes,
        vec!["created", "bad_params", "conflict", "not_found", "conflict", "bad_params", "created"]
    );

    let empty = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.importStudents",
        json!({ "token": admin, "rows": [] }),
    );
    assert_eq!(error_code(&empty), "bad_params");

    // Skipped rows left nothing behind.
    let _ = login(&mut stdin, &mut reader, "1RV22ME011", "student-pass", "student");
    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "userId": "1RV22CS011", "password": "student-pass", "role": "student" }),
    );
    assert_eq!(missing["ok"], false);

    let fac = login(&mut stdin, &mut reader, "FAC001", "faculty-pass", "faculty");
    let denied = request(
        &mut stdin,
        &mut reader,
        "5",
        "users.importStudents",
        json!({ "token": fac, "rows": [student("1RV22CS020", "CSE", 5, json!("A"))] }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.roster",
        json!({
            "token": fac, "semester": 5, "departmentCode": "CSE",
            "section": "A", "subjectCode": "CS501"
        }),
    );
    assert_eq!(roster["students"].as_array().map(|a| a.len()), Some(3));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn summarize_aggregates_supplied_records() {
    let workspace = temp_dir("campusd-attendance-summarize");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let token = seed_cse_and_mech(&mut stdin, &mut reader);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.summarize",
        json!({
            "token": token,
            "records": [
                { "subjectCode": "A", "subjectName": "A", "semester": 1, "totalSessions": 0, "presentSessions": 0 },
                { "subjectCode": "B", "subjectName": "B", "semester": 1, "totalSessions": 3, "presentSessions": 1 },
                { "subjectCode": "C", "subjectName": "C", "semester": 1, "totalSessions": 3, "presentSessions": 1 }
            ]
        }),
    );
    assert!(summary["subjects"][0]["percentage"].is_null());
    assert_eq!(summary["overall"]["percentage"].as_f64(), Some(33.33));
    assert_eq!(summary["overall"]["activeSubjects"], 2);

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.summarize",
        json!({ "token": token, "records": [] }),
    );
    assert_eq!(empty["overall"]["percentage"].as_f64(), Some(0.0));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.studentSummary",
        json!({ "token": token, "usn": "1rv22me001" }),
    );
    assert_eq!(summary["student"]["deptCode"], "MECH");
    assert!(summary["student"]["section"].is_null());
    assert_eq!(summary["subjects"][0]["totalSessions"], 0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
