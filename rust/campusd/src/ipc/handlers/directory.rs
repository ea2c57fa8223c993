use crate::filters;
use crate::ipc::handlers::auth::insert_user;
use crate::ipc::helpers::{
    authorize, class_section, db_err, find_department, get_optional_str, get_required_str,
    get_semester, require, require_db, require_department, require_offering, require_subject, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

fn departments_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, params)?;
    let conn = require_db(state)?;
    let mut stmt = conn.prepare("SELECT code, name, has_sections FROM departments ORDER BY code")?;
    let departments = stmt
        .query_map([], |r| {
            Ok(json!({
                "code": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "hasSections": r.get::<_, i64>(2)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "departments": departments }))
}

fn departments_upsert(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ManageDirectory)?;
    let conn = require_db(state)?;

    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    if code.len() > 16 {
        return Err(HandlerErr::bad_params("code must be at most 16 characters"));
    }
    let name = get_required_str(params, "name")?;
    let requested = match params.get("hasSections") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_bool()
                .ok_or_else(|| HandlerErr::bad_params("hasSections must be boolean"))?,
        ),
    };

    let (id, has_sections) = match find_department(conn, &code)? {
        Some(existing) => {
            let has_sections = requested.unwrap_or(existing.has_sections);
            if has_sections != existing.has_sections {
                let in_use = department_rows_in_use(conn, &existing.id)?;
                if in_use > 0 {
                    return Err(HandlerErr::new(
                        "conflict",
                        "hasSections cannot change while students, assignments or timetable slots exist",
                    )
                    .with_details(json!({ "code": code, "rows": in_use })));
                }
            }
            conn.execute(
                "UPDATE departments SET name = ?, has_sections = ? WHERE id = ?",
                (&name, has_sections as i64, &existing.id),
            )
            .map_err(db_err("db_update_failed", "departments"))?;
            (existing.id, has_sections)
        }
        None => {
            let has_sections =
                requested.unwrap_or_else(|| filters::department_has_sections(&code));
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO departments(id, code, name, has_sections) VALUES(?, ?, ?, ?)",
                (&id, &code, &name, has_sections as i64),
            )
            .map_err(db_err("db_insert_failed", "departments"))?;
            (id, has_sections)
        }
    };
    info!(code = %code, has_sections, "department saved");
    Ok(json!({ "departmentId": id, "code": code, "name": name, "hasSections": has_sections }))
}

/// Rows whose stored section key depends on the department's section flag.
fn department_rows_in_use(conn: &Connection, dept_id: &str) -> Result<i64, HandlerErr> {
    let count: i64 = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM student_details WHERE dept_id = ?1)
          + (SELECT COUNT(*) FROM faculty_assignments fa
               JOIN subject_offerings o ON o.id = fa.offering_id
              WHERE o.dept_id = ?1)
          + (SELECT COUNT(*) FROM timetable_slots WHERE dept_id = ?1)",
        [dept_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Subjects offered for one (department, semester), the list a filter
/// refetch asks for.
fn subjects_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, params)?;
    let conn = require_db(state)?;
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;

    let mut stmt = conn.prepare(
        "SELECT s.code, s.name
         FROM subject_offerings o
         JOIN subjects s ON s.id = o.subject_id
         WHERE o.dept_id = ? AND o.semester = ?
         ORDER BY s.name",
    )?;
    let subjects = stmt
        .query_map((&dept.id, semester.get() as i64), |r| {
            Ok(json!({
                "code": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "departmentCode": dept.code,
        "semester": semester.get(),
        "subjects": subjects
    }))
}

fn subjects_upsert(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ManageDirectory)?;
    let conn = require_db(state)?;

    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    let name = get_required_str(params, "name")?;
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let subject_id: Option<String> = tx
        .query_row("SELECT id FROM subjects WHERE code = ?", [&code], |r| r.get(0))
        .optional()?;
    let subject_id = match subject_id {
        Some(id) => {
            tx.execute("UPDATE subjects SET name = ? WHERE id = ?", (&name, &id))
                .map_err(db_err("db_update_failed", "subjects"))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
                (&id, &code, &name),
            )
            .map_err(db_err("db_insert_failed", "subjects"))?;
            id
        }
    };
    tx.execute(
        "INSERT OR IGNORE INTO subject_offerings(id, subject_id, dept_id, semester)
         VALUES(?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &subject_id,
            &dept.id,
            semester.get() as i64,
        ),
    )
    .map_err(db_err("db_insert_failed", "subject_offerings"))?;
    let offering_id: String = tx.query_row(
        "SELECT id FROM subject_offerings WHERE subject_id = ? AND dept_id = ? AND semester = ?",
        (&subject_id, &dept.id, semester.get() as i64),
        |r| r.get(0),
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "subjectId": subject_id,
        "offeringId": offering_id,
        "code": code,
        "name": name
    }))
}

fn faculty_assign(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ManageDirectory)?;
    let conn = require_db(state)?;

    let faculty_user_id = get_required_str(params, "facultyUserId")?;
    let faculty_id: String = conn
        .query_row(
            "SELECT id FROM faculty_details WHERE user_id = ?",
            [&faculty_user_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found(format!("faculty {} not found", faculty_user_id)))?;
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;
    let subject = require_subject(conn, &get_required_str(params, "subjectCode")?)?;
    let offering_id = require_offering(conn, &subject, &dept, semester)?;
    let section = class_section(conn, &dept, get_optional_str(params, "section")?)?;

    conn.execute(
        "INSERT OR IGNORE INTO faculty_assignments(id, offering_id, faculty_id, section)
         VALUES(?, ?, ?, ?)",
        (Uuid::new_v4().to_string(), &offering_id, &faculty_id, &section),
    )
    .map_err(db_err("db_insert_failed", "faculty_assignments"))?;
    let assignment_id: String = conn.query_row(
        "SELECT id FROM faculty_assignments WHERE offering_id = ? AND faculty_id = ? AND section = ?",
        (&offering_id, &faculty_id, &section),
        |r| r.get(0),
    )?;
    info!(faculty = %faculty_user_id, subject = %subject.code, "faculty assigned");
    Ok(json!({ "assignmentId": assignment_id }))
}

const MAX_IMPORT_ROWS: usize = 1000;

struct NewStudent {
    name: String,
    usn: String,
    dept_id: String,
    semester: i64,
    section: String,
}

fn parse_student(conn: &Connection, params: &Value, user_id: &str) -> Result<NewStudent, HandlerErr> {
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    Ok(NewStudent {
        name: get_required_str(params, "name")?,
        usn: get_optional_str(params, "usn")?
            .unwrap_or_else(|| user_id.to_string())
            .to_ascii_uppercase(),
        semester: get_semester(params, "semester")?.get() as i64,
        section: class_section(conn, &dept, get_optional_str(params, "section")?)?,
        dept_id: dept.id,
    })
}

fn insert_student(conn: &Connection, user_id: &str, student: &NewStudent) -> Result<(), HandlerErr> {
    let taken = conn
        .query_row(
            "SELECT 1 FROM student_details WHERE usn = ?",
            [&student.usn],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if taken {
        return Err(HandlerErr::new(
            "conflict",
            format!("usn {} is already registered", student.usn),
        ));
    }
    conn.execute(
        "INSERT INTO student_details(id, user_id, name, usn, dept_id, semester, section)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            user_id,
            &student.name,
            &student.usn,
            &student.dept_id,
            student.semester,
            &student.section,
        ),
    )
    .map_err(db_err("db_insert_failed", "student_details"))?;
    Ok(())
}

fn users_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ManageDirectory)?;
    let conn = require_db(state)?;

    let user_id = get_required_str(params, "userId")?;
    let password = get_required_str(params, "password")?;
    let role = Role::parse(&get_required_str(params, "role")?)
        .ok_or_else(|| HandlerErr::bad_params("role must be one of: student, faculty, admin"))?;
    let email = get_optional_str(params, "email")?;

    // Resolve everything the details row needs before writing anything.
    enum Details {
        Student(NewStudent),
        Faculty {
            name: String,
            dept_id: Option<String>,
            designation: Option<String>,
        },
        None,
    }
    let details = match role {
        Role::Student => Details::Student(parse_student(conn, params, &user_id)?),
        Role::Faculty => {
            let dept_id = match get_optional_str(params, "departmentCode")? {
                Some(code) => Some(require_department(conn, &code)?.id),
                None => None,
            };
            Details::Faculty {
                name: get_required_str(params, "name")?,
                dept_id,
                designation: get_optional_str(params, "designation")?,
            }
        }
        Role::Admin => Details::None,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    insert_user(&tx, &user_id, role, &password, email.as_deref())?;
    match details {
        Details::Student(student) => insert_student(&tx, &user_id, &student)?,
        Details::Faculty {
            name,
            dept_id,
            designation,
        } => {
            tx.execute(
                "INSERT INTO faculty_details(id, user_id, name, dept_id, designation)
                 VALUES(?, ?, ?, ?, ?)",
                (Uuid::new_v4().to_string(), &user_id, &name, &dept_id, &designation),
            )
            .map_err(db_err("db_insert_failed", "faculty_details"))?;
        }
        Details::None => {}
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    info!(user_id = %user_id, role = role.as_str(), "user created");
    Ok(json!({ "userId": user_id, "role": role.as_str() }))
}

fn import_student_row(conn: &Connection, row: &Value) -> Result<String, HandlerErr> {
    if !row.is_object() {
        return Err(HandlerErr::bad_params("row must be an object"));
    }
    let user_id = get_required_str(row, "userId")?;
    let password = get_required_str(row, "password")?;
    let email = get_optional_str(row, "email")?;
    let student = parse_student(conn, row, &user_id)?;
    insert_user(conn, &user_id, Role::Student, &password, email.as_deref())?;
    insert_student(conn, &user_id, &student)?;
    Ok(user_id)
}

// Row-level rejections; anything else aborts the whole import.
fn is_row_error(code: &str) -> bool {
    matches!(code, "bad_params" | "conflict" | "not_found")
}

/// Bulk student creation. Each row is `users.create` params minus `role`.
/// Rows run inside one transaction with a savepoint each, so a rejected row
/// leaves nothing behind and the rest still commit.
fn users_import_students(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ManageDirectory)?;
    let conn = require_db(state)?;

    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing rows"));
    };
    if rows.is_empty() {
        return Err(HandlerErr::bad_params("rows must not be empty"));
    }
    if rows.len() > MAX_IMPORT_ROWS {
        return Err(HandlerErr::bad_params(format!(
            "at most {} rows per import",
            MAX_IMPORT_ROWS
        )));
    }

    let mut tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed", "student_details"))?;
    let mut results: Vec<Value> = Vec::with_capacity(rows.len());
    let mut created = 0usize;
    for (i, row) in rows.iter().enumerate() {
        let sp = tx
            .savepoint()
            .map_err(db_err("db_tx_failed", "student_details"))?;
        match import_student_row(&sp, row) {
            Ok(user_id) => {
                sp.commit()
                    .map_err(db_err("db_commit_failed", "student_details"))?;
                created += 1;
                results.push(json!({ "index": i, "userId": user_id, "status": "created" }));
            }
            // Dropping the savepoint rolls the row back.
            Err(e) if is_row_error(e.code) => {
                drop(sp);
                results.push(json!({
                    "index": i,
                    "userId": row.get("userId").cloned().unwrap_or(Value::Null),
                    "status": "skipped",
                    "code": e.code,
                    "message": e.message,
                }));
            }
            Err(e) => return Err(e),
        }
    }
    tx.commit()
        .map_err(db_err("db_commit_failed", "student_details"))?;

    let skipped = rows.len() - created;
    info!(created, skipped, "students imported");
    Ok(json!({ "created": created, "skipped": skipped, "results": results }))
}

/// Students of one class. Sectioned departments need `section`.
fn students_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewClassAttendance)?;
    let conn = require_db(state)?;
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;
    let section = class_section(conn, &dept, get_optional_str(params, "section")?)?;

    let mut stmt = conn.prepare(
        "SELECT id, user_id, usn, name FROM student_details
         WHERE dept_id = ? AND semester = ? AND section = ?
         ORDER BY usn",
    )?;
    let students = stmt
        .query_map((&dept.id, semester.get() as i64, &section), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "userId": r.get::<_, String>(1)?,
                "usn": r.get::<_, String>(2)?,
                "name": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "departments.list" => Some(respond(&req.id, departments_list(state, &req.params))),
        "departments.upsert" => Some(respond(&req.id, departments_upsert(state, &req.params))),
        "subjects.list" => Some(respond(&req.id, subjects_list(state, &req.params))),
        "subjects.upsert" => Some(respond(&req.id, subjects_upsert(state, &req.params))),
        "faculty.assign" => Some(respond(&req.id, faculty_assign(state, &req.params))),
        "users.create" => Some(respond(&req.id, users_create(state, &req.params))),
        "users.importStudents" => {
            Some(respond(&req.id, users_import_students(state, &req.params)))
        }
        "students.list" => Some(respond(&req.id, students_list(state, &req.params))),
        _ => None,
    }
}
