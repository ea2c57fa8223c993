use crate::ipc::handlers::auth::{identity_json, resolve_identity};
use crate::ipc::helpers::{
    authorize, class_section, db_err, get_optional_str, require, require_db, respond,
    DepartmentRow, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Identity};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

fn load_email(conn: &Connection, user_id: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn.query_row("SELECT email FROM users WHERE id = ?", [user_id], |r| r.get(0))?)
}

fn profile_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::EditOwnProfile)?;
    let conn = require_db(state)?;

    let mut out = identity_json(&ctx.identity);
    out["email"] = json!(load_email(conn, ctx.identity.user_id())?);
    match &ctx.identity {
        Identity::Student { student_id, .. } => {
            let (usn, dept_name): (String, String) = conn.query_row(
                "SELECT sd.usn, d.name FROM student_details sd
                 JOIN departments d ON d.id = sd.dept_id
                 WHERE sd.id = ?",
                [student_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            out["usn"] = json!(usn);
            out["deptName"] = json!(dept_name);
        }
        Identity::Faculty { faculty_id, .. } => {
            let (designation, dept_code): (Option<String>, Option<String>) = conn.query_row(
                "SELECT fd.designation, d.code FROM faculty_details fd
                 LEFT JOIN departments d ON d.id = fd.dept_id
                 WHERE fd.id = ?",
                [faculty_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            out["designation"] = json!(designation);
            out["deptCode"] = json!(dept_code);
        }
        Identity::Admin { .. } => {}
    }
    Ok(out)
}

/// Students may change their name and section, faculty their name and
/// designation. Everyone may change their email.
fn profile_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::EditOwnProfile)?;
    let conn = require_db(state)?;

    let name = get_optional_str(params, "name")?;
    let email = get_optional_str(params, "email")?;
    let section = get_optional_str(params, "section")?;
    let designation = get_optional_str(params, "designation")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut changed: Vec<&str> = Vec::new();
    match &ctx.identity {
        Identity::Student {
            student_id,
            dept_id,
            dept_code,
            ..
        } => {
            if designation.is_some() {
                return Err(HandlerErr::bad_params("students have no designation"));
            }
            if let Some(name) = &name {
                tx.execute(
                    "UPDATE student_details SET name = ? WHERE id = ?",
                    (name, student_id),
                )
                .map_err(db_err("db_update_failed", "student_details"))?;
                changed.push("name");
            }
            if section.is_some() {
                let has_sections: i64 = tx.query_row(
                    "SELECT has_sections FROM departments WHERE id = ?",
                    [dept_id],
                    |r| r.get(0),
                )?;
                let dept = DepartmentRow {
                    id: dept_id.clone(),
                    code: dept_code.clone(),
                    name: String::new(),
                    has_sections: has_sections != 0,
                };
                if !dept.has_sections {
                    return Err(HandlerErr::bad_params(format!(
                        "{} has no sections",
                        dept.code
                    )));
                }
                let section = class_section(&tx, &dept, section.clone())?;
                tx.execute(
                    "UPDATE student_details SET section = ? WHERE id = ?",
                    (&section, student_id),
                )
                .map_err(db_err("db_update_failed", "student_details"))?;
                changed.push("section");
            }
        }
        Identity::Faculty { faculty_id, .. } => {
            if section.is_some() {
                return Err(HandlerErr::bad_params("faculty have no section"));
            }
            if let Some(name) = &name {
                tx.execute(
                    "UPDATE faculty_details SET name = ? WHERE id = ?",
                    (name, faculty_id),
                )
                .map_err(db_err("db_update_failed", "faculty_details"))?;
                changed.push("name");
            }
            if let Some(designation) = &designation {
                tx.execute(
                    "UPDATE faculty_details SET designation = ? WHERE id = ?",
                    (designation, faculty_id),
                )
                .map_err(db_err("db_update_failed", "faculty_details"))?;
                changed.push("designation");
            }
        }
        Identity::Admin { .. } => {
            if name.is_some() || section.is_some() || designation.is_some() {
                return Err(HandlerErr::bad_params("admins may only change their email"));
            }
        }
    }
    if let Some(email) = &email {
        tx.execute(
            "UPDATE users SET email = ? WHERE id = ?",
            (email, ctx.identity.user_id()),
        )
        .map_err(db_err("db_update_failed", "users"))?;
        changed.push("email");
    }
    if changed.is_empty() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let identity = resolve_identity(conn, ctx.identity.user_id(), ctx.identity.role())?;
    let body = identity_json(&identity);
    state.session.replace_identity(identity);
    info!(user_id = %ctx.identity.user_id(), fields = ?changed, "profile updated");
    Ok(json!({ "identity": body, "updated": changed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "profile.get" => profile_get(state, &req.params),
        "profile.update" => profile_update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
