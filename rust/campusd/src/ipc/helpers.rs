use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use crate::filters::{SectionPolicy, Semester};
pub use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::handlers::setup;
use crate::ipc::types::AppState;
use crate::session::{Capability, Identity, SessionContext};

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Validates `params.token` against the active session. A rejected token
/// signs the session out.
pub fn authorize(state: &mut AppState, params: &Value) -> Result<SessionContext, HandlerErr> {
    let token = params.get("token").and_then(|v| v.as_str());
    state.session.authorize(token, Utc::now()).map_err(|e| {
        warn!(error = %e, "rejected session token");
        HandlerErr::new("unauthorized", e.to_string())
    })
}

pub fn require(ctx: &SessionContext, capability: Capability) -> Result<(), HandlerErr> {
    if ctx.identity.can(capability) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden(format!(
            "{} may not perform this action",
            ctx.identity.role().as_str()
        )))
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok((!t.is_empty()).then(|| t.to_string()))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be string or null", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key)))
}

pub fn get_semester(params: &Value, key: &str) -> Result<Semester, HandlerErr> {
    let n = get_required_i64(params, key)?;
    Semester::new(n).ok_or_else(|| HandlerErr::bad_params(format!("{} must be in 1..=8", key)))
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        HandlerErr::bad_params(format!("invalid {} format, expected YYYY-MM-DD", key))
    })
}

pub fn get_optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_optional_str(params, key)? {
        Some(s) => parse_date(&s, key).map(Some),
        None => Ok(None),
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone)]
pub struct DepartmentRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub has_sections: bool,
}

pub fn find_department(conn: &Connection, code: &str) -> Result<Option<DepartmentRow>, HandlerErr> {
    let code = code.trim().to_ascii_uppercase();
    Ok(conn
        .query_row(
            "SELECT id, code, name, has_sections FROM departments WHERE code = ?",
            [&code],
            |r| {
                Ok(DepartmentRow {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    name: r.get(2)?,
                    has_sections: r.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()?)
}

pub fn require_department(conn: &Connection, code: &str) -> Result<DepartmentRow, HandlerErr> {
    find_department(conn, code)?
        .ok_or_else(|| HandlerErr::not_found(format!("department {} not found", code)))
}

/// The department table decides which departments are sectioned; the fixed
/// default applies only to a workspace with no departments yet.
pub fn section_policy(conn: &Connection) -> Result<SectionPolicy, HandlerErr> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM departments", [], |r| r.get(0))?;
    if total == 0 {
        return Ok(SectionPolicy::default());
    }
    let mut stmt = conn.prepare("SELECT code FROM departments WHERE has_sections = 1")?;
    let codes = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SectionPolicy::from_codes(codes))
}

/// Store key for a class section: the validated section for sectioned
/// departments, `''` otherwise.
pub fn class_section(
    conn: &Connection,
    dept: &DepartmentRow,
    section: Option<String>,
) -> Result<String, HandlerErr> {
    if !dept.has_sections {
        return Ok(String::new());
    }
    let Some(section) = section.map(|s| s.trim().to_ascii_uppercase()) else {
        return Err(HandlerErr::bad_params(format!(
            "section is required for {}",
            dept.code
        )));
    };
    let allowed = setup::allowed_sections(conn)?;
    if !allowed.iter().any(|s| s == &section) {
        return Err(HandlerErr::bad_params(format!(
            "section must be one of: {}",
            allowed.join(", ")
        )));
    }
    Ok(section)
}

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub code: String,
    pub name: String,
}

pub fn require_subject(conn: &Connection, code: &str) -> Result<SubjectRow, HandlerErr> {
    let code = code.trim().to_ascii_uppercase();
    conn.query_row(
        "SELECT id, code, name FROM subjects WHERE code = ?",
        [&code],
        |r| {
            Ok(SubjectRow {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found(format!("subject {} not found", code)))
}

pub fn require_offering(
    conn: &Connection,
    subject: &SubjectRow,
    dept: &DepartmentRow,
    semester: Semester,
) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT id FROM subject_offerings WHERE subject_id = ? AND dept_id = ? AND semester = ?",
        (&subject.id, &dept.id, semester.get() as i64),
        |r| r.get::<_, String>(0),
    )
    .optional()?
    .ok_or_else(|| {
        HandlerErr::not_found(format!(
            "{} is not offered by {} in semester {}",
            subject.code,
            dept.code,
            semester.get()
        ))
    })
}

pub const MAX_PERIOD: i64 = 8;

pub fn get_period(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    let n = get_required_i64(params, key)?;
    if !(1..=MAX_PERIOD).contains(&n) {
        return Err(HandlerErr::bad_params(format!("{} must be in 1..={}", key, MAX_PERIOD)));
    }
    Ok(n)
}

/// A fully resolved class: one subject offering taught to one section.
#[derive(Debug, Clone)]
pub struct ClassRef {
    pub dept: DepartmentRow,
    pub semester: Semester,
    pub section: String,
    pub subject: SubjectRow,
    pub offering_id: String,
}

/// Resolves `departmentCode`, `semester`, `section` and `subjectCode` from
/// request params.
pub fn resolve_class(conn: &Connection, params: &Value) -> Result<ClassRef, HandlerErr> {
    let dept_code = get_required_str(params, "departmentCode")?;
    let semester = get_semester(params, "semester")?;
    let subject_code = get_required_str(params, "subjectCode")?;
    let section = get_optional_str(params, "section")?;

    let dept = require_department(conn, &dept_code)?;
    let section = class_section(conn, &dept, section)?;
    let subject = require_subject(conn, &subject_code)?;
    let offering_id = require_offering(conn, &subject, &dept, semester)?;
    Ok(ClassRef {
        dept,
        semester,
        section,
        subject,
        offering_id,
    })
}

/// The faculty assignment a signed-in user acts through for `class`.
/// Faculty must hold the assignment themselves; an admin may act through
/// any assignment of the class.
pub fn resolve_assignment(
    conn: &Connection,
    ctx: &SessionContext,
    class: &ClassRef,
) -> Result<String, HandlerErr> {
    let found: Option<String> = match &ctx.identity {
        Identity::Faculty { faculty_id, .. } => conn
            .query_row(
                "SELECT id FROM faculty_assignments
                 WHERE offering_id = ? AND section = ? AND faculty_id = ?",
                (&class.offering_id, &class.section, faculty_id),
                |r| r.get(0),
            )
            .optional()?,
        Identity::Admin { .. } => conn
            .query_row(
                "SELECT id FROM faculty_assignments
                 WHERE offering_id = ? AND section = ?
                 ORDER BY id LIMIT 1",
                (&class.offering_id, &class.section),
                |r| r.get(0),
            )
            .optional()?,
        Identity::Student { .. } => None,
    };
    found.ok_or_else(|| match ctx.identity {
        Identity::Admin { .. } => HandlerErr::not_found(format!(
            "no faculty is assigned to {} for this class",
            class.subject.code
        )),
        _ => HandlerErr::forbidden(format!("not assigned to {} for this class", class.subject.code)),
    })
}

/// Student row ids of the class, in roster order.
pub fn class_student_ids(conn: &Connection, class: &ClassRef) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id FROM student_details
         WHERE dept_id = ? AND semester = ? AND section = ?
         ORDER BY usn",
    )?;
    let ids = stmt
        .query_map(
            (&class.dept.id, class.semester.get() as i64, &class.section),
            |r| r.get::<_, String>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
