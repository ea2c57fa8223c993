use crate::filters::Semester;
use crate::ipc::handlers::notifications::{notify_students_logged, ClassAudience};
use crate::ipc::helpers::{
    authorize, class_section, get_optional_str, get_required_str, get_semester, require,
    require_db, require_department, require_offering, require_subject, respond, DepartmentRow,
    HandlerErr, MAX_PERIOD,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Identity};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

const DAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

const DAY_ORDER_SQL: &str = "CASE t.day_of_week
    WHEN 'Monday' THEN 1 WHEN 'Tuesday' THEN 2 WHEN 'Wednesday' THEN 3
    WHEN 'Thursday' THEN 4 WHEN 'Friday' THEN 5 WHEN 'Saturday' THEN 6
    ELSE 7 END";

fn normalize_day(raw: &str) -> Option<&'static str> {
    let t = raw.trim();
    DAYS.iter().copied().find(|d| d.eq_ignore_ascii_case(t))
}

fn slot_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let section: String = r.get(6)?;
    Ok(json!({
        "day": r.get::<_, String>(0)?,
        "period": r.get::<_, i64>(1)?,
        "subjectCode": r.get::<_, String>(2)?,
        "subjectName": r.get::<_, String>(3)?,
        "facultyName": r.get::<_, String>(4)?,
        "departmentCode": r.get::<_, String>(5)?,
        "section": if section.is_empty() { Value::Null } else { json!(section) },
        "semester": r.get::<_, i64>(7)?,
    }))
}

fn slots_where(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Value>, HandlerErr> {
    let sql = format!(
        "SELECT t.day_of_week, t.period_number, s.code, s.name, fd.name, d.code, t.section, t.semester
         FROM timetable_slots t
         JOIN faculty_assignments fa ON fa.id = t.assignment_id
         JOIN subject_offerings o ON o.id = fa.offering_id
         JOIN subjects s ON s.id = o.subject_id
         JOIN faculty_details fd ON fd.id = fa.faculty_id
         JOIN departments d ON d.id = t.dept_id
         WHERE {}
         ORDER BY {}, t.period_number",
        filter, DAY_ORDER_SQL
    );
    let mut stmt = conn.prepare(&sql)?;
    let slots = stmt
        .query_map(args, slot_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(slots)
}

fn class_slots(
    conn: &Connection,
    dept: &DepartmentRow,
    semester: i64,
    section: &str,
) -> Result<Vec<Value>, HandlerErr> {
    slots_where(
        conn,
        "t.dept_id = ? AND t.semester = ? AND t.section = ?",
        &[&dept.id, &semester, &section],
    )
}

fn save_entry(
    conn: &Connection,
    dept: &DepartmentRow,
    semester: Semester,
    section: &str,
    entry: &Value,
) -> Result<(), String> {
    let day = entry
        .get("day")
        .and_then(|v| v.as_str())
        .and_then(normalize_day)
        .ok_or_else(|| "day must be a weekday name".to_string())?;
    let period = entry
        .get("period")
        .and_then(|v| v.as_i64())
        .filter(|p| (1..=MAX_PERIOD).contains(p))
        .ok_or_else(|| format!("period must be in 1..={}", MAX_PERIOD))?;
    let subject_code = entry
        .get("subjectCode")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| "missing subjectCode".to_string())?;
    let faculty_user_id = entry
        .get("facultyUserId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| "missing facultyUserId".to_string())?;

    let subject = require_subject(conn, subject_code).map_err(|e| e.message)?;
    let offering_id = require_offering(conn, &subject, dept, semester).map_err(|e| e.message)?;
    let faculty_id: String = conn
        .query_row(
            "SELECT id FROM faculty_details WHERE user_id = ?",
            [faculty_user_id.trim()],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("faculty {} not found", faculty_user_id.trim()))?;

    conn.execute(
        "INSERT OR IGNORE INTO faculty_assignments(id, offering_id, faculty_id, section)
         VALUES(?, ?, ?, ?)",
        (Uuid::new_v4().to_string(), &offering_id, &faculty_id, section),
    )
    .map_err(|e| e.to_string())?;
    let assignment_id: String = conn
        .query_row(
            "SELECT id FROM faculty_assignments WHERE offering_id = ? AND faculty_id = ? AND section = ?",
            (&offering_id, &faculty_id, section),
            |r| r.get(0),
        )
        .map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO timetable_slots(id, dept_id, semester, section, day_of_week, period_number, assignment_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(dept_id, semester, section, day_of_week, period_number) DO UPDATE SET
           assignment_id = excluded.assignment_id",
        (
            Uuid::new_v4().to_string(),
            &dept.id,
            semester.get() as i64,
            section,
            day,
            period,
            &assignment_id,
        ),
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

/// Saves each entry on its own; bad entries are reported while the rest
/// are kept. Fails only when nothing could be saved.
fn timetable_save(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::EditTimetable)?;
    let conn = require_db(state)?;

    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;
    let section = class_section(conn, &dept, get_optional_str(params, "section")?)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    if entries.is_empty() {
        return Err(HandlerErr::bad_params("entries must not be empty"));
    }

    let mut saved = 0usize;
    let mut errors: Vec<Value> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        match save_entry(conn, &dept, semester, &section, entry) {
            Ok(()) => saved += 1,
            Err(message) => errors.push(json!({ "index": i, "message": message })),
        }
    }

    if saved == 0 {
        warn!(department = %dept.code, errors = errors.len(), "timetable save rejected");
        return Err(HandlerErr::bad_params("no timetable entries could be saved")
            .with_details(json!({ "errors": errors })));
    }
    let sections = [section.clone()];
    let notified = notify_students_logged(
        conn,
        &ClassAudience {
            dept_id: &dept.id,
            semester: semester.get() as i64,
            sections: Some(sections.as_slice()),
        },
        "timetable",
        "Timetable updated",
        &format!("The semester {} timetable for {} changed.", semester.get(), dept.code),
    );
    info!(department = %dept.code, semester = semester.get(), saved, notified, "timetable saved");
    Ok(json!({ "saved": saved, "errors": errors, "notified": notified }))
}

fn timetable_for_class(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewTimetable)?;
    let conn = require_db(state)?;
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;
    let section = class_section(conn, &dept, get_optional_str(params, "section")?)?;
    let slots = class_slots(conn, &dept, semester.get() as i64, &section)?;
    Ok(json!({ "entries": slots }))
}

/// A student's own class timetable, or the slots a faculty member teaches.
fn timetable_mine(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewTimetable)?;
    let conn = require_db(state)?;
    let slots = match &ctx.identity {
        Identity::Student {
            dept_id,
            semester,
            section,
            ..
        } => slots_where(
            conn,
            "t.dept_id = ? AND t.semester = ? AND t.section = ?",
            &[dept_id, semester, section],
        )?,
        Identity::Faculty { faculty_id, .. } => {
            slots_where(conn, "fa.faculty_id = ?", &[faculty_id])?
        }
        Identity::Admin { .. } => {
            return Err(HandlerErr::bad_params(
                "admins have no own timetable; use timetable.forClass",
            ))
        }
    };
    Ok(json!({ "entries": slots }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "timetable.save" => timetable_save(state, &req.params),
        "timetable.forClass" => timetable_for_class(state, &req.params),
        "timetable.mine" => timetable_mine(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
