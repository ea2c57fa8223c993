use crate::filters::{FetchGeneration, FilterSelection};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    authorize, class_section, class_student_ids, db_err, get_optional_date, get_optional_str,
    get_period, get_required_str, get_semester, now_iso, parse_date, require, require_db,
    require_department, resolve_assignment, resolve_class, respond, section_policy, ClassRef,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Identity, SessionContext};
use crate::stats::{self, SessionRecord};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }
}

struct MarkEntry {
    student_id: String,
    status: AttendanceStatus,
}

fn parse_entries(params: &Value) -> Result<Vec<MarkEntry>, HandlerErr> {
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("entries must not be empty"));
    }
    let mut out = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}].studentId missing", i)))?;
        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(AttendanceStatus::parse)
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("entries[{}].status must be present or absent", i))
            })?;
        if !seen.insert(student_id.to_string()) {
            return Err(HandlerErr::bad_params(format!(
                "duplicate entry for student {}",
                student_id
            )));
        }
        out.push(MarkEntry {
            student_id: student_id.to_string(),
            status,
        });
    }
    Ok(out)
}

fn selection_of(class: &ClassRef) -> FilterSelection {
    FilterSelection {
        semester: Some(class.semester),
        department_code: Some(class.dept.code.clone()),
        section: (!class.section.is_empty()).then(|| class.section.clone()),
        subject_code: Some(class.subject.code.clone()),
    }
}

fn find_session(
    conn: &Connection,
    assignment_id: &str,
    date: NaiveDate,
    period: i64,
) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id FROM class_sessions
             WHERE assignment_id = ? AND session_date = ? AND period_number = ?",
            (assignment_id, date.format("%Y-%m-%d").to_string(), period),
            |r| r.get(0),
        )
        .optional()?)
}

/// Students of a class with a status each. Rows default to the configured
/// status unless the same (date, period) was already marked.
fn attendance_roster(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::MarkAttendance)?;
    let conn = require_db(state)?;

    let class = resolve_class(conn, params)?;
    let date = get_optional_date(params, "date")?;
    let period = match params.get("period") {
        None | Some(Value::Null) => None,
        Some(_) => Some(get_period(params, "period")?),
    };
    let default_status = setup::default_attendance_status(conn)?;

    let existing_session = match (date, period) {
        (Some(d), Some(p)) => {
            let assignment_id = resolve_assignment(conn, &ctx, &class)?;
            find_session(conn, &assignment_id, d, p)?
        }
        _ => None,
    };

    let students = {
        let mut stmt = conn.prepare(
            "SELECT sd.id, sd.usn, sd.name, a.status
             FROM student_details sd
             LEFT JOIN attendance a ON a.student_id = sd.id AND a.session_id = ?
             WHERE sd.dept_id = ? AND sd.semester = ? AND sd.section = ?
             ORDER BY sd.usn",
        )?;
        let rows = stmt
            .query_map(
                (
                    existing_session.as_deref(),
                    &class.dept.id,
                    class.semester.get() as i64,
                    &class.section,
                ),
                |r| {
                    let stored: Option<String> = r.get(3)?;
                    Ok(json!({
                        "studentId": r.get::<_, String>(0)?,
                        "usn": r.get::<_, String>(1)?,
                        "name": r.get::<_, String>(2)?,
                        "status": stored.unwrap_or_else(|| default_status.clone()),
                    }))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let can_submit = section_policy(conn)?.can_submit(&selection_of(&class), students.len());
    let generation = state.attendance_generation.issue();
    debug!(generation, students = students.len(), "roster issued");
    Ok(json!({
        "students": students,
        "sessionId": existing_session,
        "generation": generation,
        "canSubmit": can_submit,
    }))
}

/// Rejects a submission built from a view that a later fetch of the same
/// view replaced. Submissions without a generation are accepted as-is.
pub fn check_generation(counter: &FetchGeneration, params: &Value) -> Result<(), HandlerErr> {
    let Some(raw) = params.get("generation").filter(|v| !v.is_null()) else {
        return Ok(());
    };
    let ticket = raw
        .as_u64()
        .ok_or_else(|| HandlerErr::bad_params("generation must be a non-negative integer"))?;
    if counter.is_current(ticket) {
        return Ok(());
    }
    warn!(ticket, latest = counter.latest(), "rejected stale submission");
    Err(HandlerErr::new(
        "stale_roster",
        "the roster was replaced by a newer fetch; reload before submitting",
    )
    .with_details(json!({
        "generation": ticket,
        "latest": counter.latest()
    })))
}

fn attendance_submit(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::MarkAttendance)?;

    let date = parse_date(&get_required_str(params, "date")?, "date")?;
    let period = get_period(params, "period")?;
    let entries = parse_entries(params)?;
    check_generation(&state.attendance_generation, params)?;

    let conn = require_db(state)?;
    let class = resolve_class(conn, params)?;
    let assignment_id = resolve_assignment(conn, &ctx, &class)?;

    let enrolled: HashSet<String> = class_student_ids(conn, &class)?.into_iter().collect();
    let strangers: Vec<&str> = entries
        .iter()
        .filter(|e| !enrolled.contains(&e.student_id))
        .map(|e| e.student_id.as_str())
        .collect();
    if !strangers.is_empty() {
        return Err(
            HandlerErr::bad_params("entries contain students outside this class")
                .with_details(json!({ "studentIds": strangers })),
        );
    }

    let date_key = date.format("%Y-%m-%d").to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT OR IGNORE INTO class_sessions(id, assignment_id, session_date, day_of_week, period_number)
         VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &assignment_id,
            &date_key,
            date.format("%A").to_string(),
            period,
        ),
    )
    .map_err(db_err("db_insert_failed", "class_sessions"))?;
    let session_id: String = tx.query_row(
        "SELECT id FROM class_sessions
         WHERE assignment_id = ? AND session_date = ? AND period_number = ?",
        (&assignment_id, &date_key, period),
        |r| r.get(0),
    )?;
    let now = now_iso();
    for entry in &entries {
        tx.execute(
            "INSERT INTO attendance(id, session_id, student_id, status, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(session_id, student_id) DO UPDATE SET
               status = excluded.status,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &session_id,
                &entry.student_id,
                entry.status.as_str(),
                &now,
            ),
        )
        .map_err(db_err("db_update_failed", "attendance"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let present = entries
        .iter()
        .filter(|e| e.status == AttendanceStatus::Present)
        .count();
    info!(
        subject = %class.subject.code,
        date = %date_key,
        period,
        saved = entries.len(),
        "attendance submitted"
    );
    Ok(json!({
        "sessionId": session_id,
        "saved": entries.len(),
        "present": present,
        "absent": entries.len() - present,
    }))
}

/// Sessions of one class, newest first. Faculty see only sessions taught
/// through their own assignments.
fn attendance_history(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewClassAttendance)?;
    let conn = require_db(state)?;

    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;
    let section = class_section(conn, &dept, get_optional_str(params, "section")?)?;
    let subject_code = get_optional_str(params, "subjectCode")?.map(|s| s.to_ascii_uppercase());
    let from = get_optional_date(params, "from")?;
    let to = get_optional_date(params, "to")?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(HandlerErr::bad_params("from must not be after to"));
        }
    }
    let faculty_id = match &ctx.identity {
        Identity::Faculty { faculty_id, .. } => Some(faculty_id.clone()),
        _ => None,
    };

    let mut stmt = conn.prepare(
        "SELECT cs.id, cs.session_date, cs.day_of_week, cs.period_number,
                s.code, s.name, fd.name,
                SUM(CASE WHEN a.status = 'present' THEN 1 ELSE 0 END),
                SUM(CASE WHEN a.status = 'absent' THEN 1 ELSE 0 END)
         FROM class_sessions cs
         JOIN faculty_assignments fa ON fa.id = cs.assignment_id
         JOIN subject_offerings o ON o.id = fa.offering_id
         JOIN subjects s ON s.id = o.subject_id
         JOIN faculty_details fd ON fd.id = fa.faculty_id
         LEFT JOIN attendance a ON a.session_id = cs.id
         WHERE o.dept_id = ?1 AND o.semester = ?2 AND fa.section = ?3
           AND (?4 IS NULL OR s.code = ?4)
           AND (?5 IS NULL OR cs.session_date >= ?5)
           AND (?6 IS NULL OR cs.session_date <= ?6)
           AND (?7 IS NULL OR fa.faculty_id = ?7)
         GROUP BY cs.id
         ORDER BY cs.session_date DESC, cs.period_number ASC",
    )?;
    let sessions = stmt
        .query_map(
            (
                &dept.id,
                semester.get() as i64,
                &section,
                subject_code.as_deref(),
                from.map(|d| d.format("%Y-%m-%d").to_string()),
                to.map(|d| d.format("%Y-%m-%d").to_string()),
                faculty_id.as_deref(),
            ),
            |r| {
                Ok(json!({
                    "sessionId": r.get::<_, String>(0)?,
                    "date": r.get::<_, String>(1)?,
                    "dayOfWeek": r.get::<_, String>(2)?,
                    "period": r.get::<_, i64>(3)?,
                    "subjectCode": r.get::<_, String>(4)?,
                    "subjectName": r.get::<_, String>(5)?,
                    "facultyName": r.get::<_, String>(6)?,
                    "presentCount": r.get::<_, Option<i64>>(7)?.unwrap_or(0),
                    "absentCount": r.get::<_, Option<i64>>(8)?.unwrap_or(0),
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "sessions": sessions }))
}

struct SessionOwner {
    assignment_id: String,
    faculty_id: String,
}

fn session_owner(conn: &Connection, session_id: &str) -> Result<SessionOwner, HandlerErr> {
    conn.query_row(
        "SELECT fa.id, fa.faculty_id
         FROM class_sessions cs
         JOIN faculty_assignments fa ON fa.id = cs.assignment_id
         WHERE cs.id = ?",
        [session_id],
        |r| {
            Ok(SessionOwner {
                assignment_id: r.get(0)?,
                faculty_id: r.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("class session not found"))
}

fn attendance_session_details(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    let conn = require_db(state)?;
    let session_id = get_required_str(params, "sessionId")?;

    // Students only ever see their own row.
    let only_student = match &ctx.identity {
        Identity::Student { student_id, .. } => {
            require(&ctx, Capability::ViewOwnAttendance)?;
            Some(student_id.clone())
        }
        _ => {
            require(&ctx, Capability::ViewClassAttendance)?;
            None
        }
    };

    let session = conn
        .query_row(
            "SELECT cs.session_date, cs.day_of_week, cs.period_number, s.code, s.name, fa.section
             FROM class_sessions cs
             JOIN faculty_assignments fa ON fa.id = cs.assignment_id
             JOIN subject_offerings o ON o.id = fa.offering_id
             JOIN subjects s ON s.id = o.subject_id
             WHERE cs.id = ?",
            [&session_id],
            |r| {
                Ok(json!({
                    "sessionId": session_id,
                    "date": r.get::<_, String>(0)?,
                    "dayOfWeek": r.get::<_, String>(1)?,
                    "period": r.get::<_, i64>(2)?,
                    "subjectCode": r.get::<_, String>(3)?,
                    "subjectName": r.get::<_, String>(4)?,
                    "section": r.get::<_, String>(5)?,
                }))
            },
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("class session not found"))?;

    let mut stmt = conn.prepare(
        "SELECT sd.id, sd.usn, sd.name, a.status, a.updated_at
         FROM attendance a
         JOIN student_details sd ON sd.id = a.student_id
         WHERE a.session_id = ?1 AND (?2 IS NULL OR sd.id = ?2)
         ORDER BY sd.usn",
    )?;
    let entries = stmt
        .query_map((&session_id, only_student.as_deref()), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "usn": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "updatedAt": r.get::<_, Option<String>>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if only_student.is_some() && entries.is_empty() {
        return Err(HandlerErr::not_found("no attendance recorded for you in this session"));
    }
    Ok(json!({ "session": session, "entries": entries }))
}

fn attendance_update_entry(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::MarkAttendance)?;
    let conn = require_db(state)?;

    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = params
        .get("status")
        .and_then(|v| v.as_str())
        .and_then(AttendanceStatus::parse)
        .ok_or_else(|| HandlerErr::bad_params("status must be present or absent"))?;

    let owner = session_owner(conn, &session_id)?;
    if let Identity::Faculty { faculty_id, .. } = &ctx.identity {
        if faculty_id != &owner.faculty_id {
            return Err(HandlerErr::forbidden("session belongs to another faculty member"));
        }
    }
    let in_class: bool = conn
        .query_row(
            "SELECT 1
             FROM faculty_assignments fa
             JOIN subject_offerings o ON o.id = fa.offering_id
             JOIN student_details sd
               ON sd.dept_id = o.dept_id AND sd.semester = o.semester AND sd.section = fa.section
             WHERE fa.id = ? AND sd.id = ?",
            (&owner.assignment_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !in_class {
        return Err(HandlerErr::not_found("student is not part of this class"));
    }

    conn.execute(
        "INSERT INTO attendance(id, session_id, student_id, status, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(session_id, student_id) DO UPDATE SET
           status = excluded.status,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &session_id,
            &student_id,
            status.as_str(),
            now_iso(),
        ),
    )
    .map_err(db_err("db_update_failed", "attendance"))?;
    Ok(json!({ "sessionId": session_id, "studentId": student_id, "status": status.as_str() }))
}

fn summary_json(records: &[SessionRecord]) -> Value {
    let subjects = stats::compute_subject_stats(records);
    let overall = stats::compute_overall_stats(records);
    json!({
        "subjects": subjects.iter().map(stats::subject_stat_json).collect::<Vec<_>>(),
        "overall": stats::overall_stat_json(&overall),
    })
}

/// Aggregates caller-supplied records without touching the store.
fn attendance_summarize(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, params)?;
    let Some(raw) = params.get("records") else {
        return Err(HandlerErr::bad_params("missing records"));
    };
    let records: Vec<SessionRecord> = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid records: {}", e)))?;
    Ok(summary_json(&records))
}

/// Per-subject session counts for one student. Subjects offered to the
/// student's current class are listed even before their first session;
/// subjects from earlier semesters appear once the student has a row there.
pub fn student_records(
    conn: &Connection,
    student_id: &str,
    dept_id: &str,
    semester: i64,
) -> Result<Vec<SessionRecord>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.code, s.name, o.semester,
                COUNT(a.id),
                COALESCE(SUM(CASE WHEN a.status = 'present' THEN 1 ELSE 0 END), 0)
         FROM subject_offerings o
         JOIN subjects s ON s.id = o.subject_id
         LEFT JOIN faculty_assignments fa ON fa.offering_id = o.id
         LEFT JOIN class_sessions cs ON cs.assignment_id = fa.id
         LEFT JOIN attendance a ON a.session_id = cs.id AND a.student_id = ?1
         WHERE (o.dept_id = ?2 AND o.semester = ?3) OR a.id IS NOT NULL
         GROUP BY o.id
         ORDER BY o.semester, s.name",
    )?;
    let records = stmt
        .query_map((student_id, dept_id, semester), |r| {
            Ok(SessionRecord {
                subject_code: r.get(0)?,
                subject_name: r.get(1)?,
                semester: r.get(2)?,
                total_sessions: r.get(3)?,
                present_sessions: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn attendance_my_summary(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewOwnAttendance)?;
    let conn = require_db(state)?;
    let Identity::Student {
        student_id,
        dept_id,
        semester,
        ..
    } = &ctx.identity
    else {
        return Err(HandlerErr::forbidden("only students have an own attendance summary"));
    };
    let records = student_records(conn, student_id, dept_id, *semester)?;
    Ok(summary_json(&records))
}

fn attendance_student_summary(
    state: &mut AppState,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewClassAttendance)?;
    let conn = require_db(state)?;
    let usn = get_required_str(params, "usn")?.to_ascii_uppercase();

    let student = conn
        .query_row(
            "SELECT sd.id, sd.name, sd.dept_id, d.code, sd.semester, sd.section
             FROM student_details sd
             JOIN departments d ON d.id = sd.dept_id
             WHERE sd.usn = ?",
            [&usn],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found(format!("student {} not found", usn)))?;
    let (student_id, name, dept_id, dept_code, semester, section) = student;

    let records = student_records(conn, &student_id, &dept_id, semester)?;
    let mut out = summary_json(&records);
    out["student"] = json!({
        "studentId": student_id,
        "usn": usn,
        "name": name,
        "deptCode": dept_code,
        "semester": semester,
        "section": if section.is_empty() { Value::Null } else { json!(section) },
    });
    Ok(out)
}

fn student_context(ctx: &SessionContext) -> Option<&str> {
    match &ctx.identity {
        Identity::Student { student_id, .. } => Some(student_id),
        _ => None,
    }
}

/// Sessions the signed-in student was marked in, newest first.
fn attendance_my_history(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewOwnAttendance)?;
    let conn = require_db(state)?;
    let student_id = student_context(&ctx)
        .ok_or_else(|| HandlerErr::forbidden("only students have an own attendance history"))?;
    let subject_code = get_optional_str(params, "subjectCode")?.map(|s| s.to_ascii_uppercase());

    let mut stmt = conn.prepare(
        "SELECT cs.id, cs.session_date, cs.period_number, s.code, s.name, a.status
         FROM attendance a
         JOIN class_sessions cs ON cs.id = a.session_id
         JOIN faculty_assignments fa ON fa.id = cs.assignment_id
         JOIN subject_offerings o ON o.id = fa.offering_id
         JOIN subjects s ON s.id = o.subject_id
         WHERE a.student_id = ?1 AND (?2 IS NULL OR s.code = ?2)
         ORDER BY cs.session_date DESC, cs.period_number ASC",
    )?;
    let entries = stmt
        .query_map((student_id, subject_code.as_deref()), |r| {
            Ok(json!({
                "sessionId": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "period": r.get::<_, i64>(2)?,
                "subjectCode": r.get::<_, String>(3)?,
                "subjectName": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.roster" => attendance_roster(state, &req.params),
        "attendance.submit" => attendance_submit(state, &req.params),
        "attendance.history" => attendance_history(state, &req.params),
        "attendance.myHistory" => attendance_my_history(state, &req.params),
        "attendance.sessionDetails" => attendance_session_details(state, &req.params),
        "attendance.updateEntry" => attendance_update_entry(state, &req.params),
        "attendance.summarize" => attendance_summarize(state, &req.params),
        "attendance.mySummary" => attendance_my_summary(state, &req.params),
        "attendance.studentSummary" => attendance_student_summary(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
