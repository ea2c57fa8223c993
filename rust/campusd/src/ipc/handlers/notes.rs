use crate::ipc::handlers::notifications::{notify_students_logged, ClassAudience};
use crate::ipc::helpers::{
    authorize, db_err, get_optional_str, get_required_str, get_semester, now_iso, require,
    require_db, require_department, require_offering, require_subject, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Identity};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

fn notes_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::UploadNotes)?;
    let conn = require_db(state)?;

    let title = get_required_str(params, "title")?;
    let file_url = get_required_str(params, "fileUrl")?;
    let description = get_optional_str(params, "description")?;
    let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
    let semester = get_semester(params, "semester")?;
    let subject = require_subject(conn, &get_required_str(params, "subjectCode")?)?;
    let offering_id = require_offering(conn, &subject, &dept, semester)?;

    // Faculty reach the sections they teach; admins reach the whole semester.
    let sections: Option<Vec<String>> = match &ctx.identity {
        Identity::Faculty { faculty_id, .. } => {
            let mut stmt = conn.prepare(
                "SELECT section FROM faculty_assignments WHERE offering_id = ? AND faculty_id = ?",
            )?;
            let taught = stmt
                .query_map((&offering_id, faculty_id), |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            if taught.is_empty() {
                return Err(HandlerErr::forbidden(format!("not assigned to {}", subject.code)));
            }
            Some(taught)
        }
        _ => None,
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notes(id, offering_id, author_user_id, title, description, file_url, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &offering_id,
            ctx.identity.user_id(),
            &title,
            &description,
            &file_url,
            now_iso(),
        ),
    )
    .map_err(db_err("db_insert_failed", "notes"))?;
    let notified = notify_students_logged(
        conn,
        &ClassAudience {
            dept_id: &dept.id,
            semester: semester.get() as i64,
            sections: sections.as_deref(),
        },
        "note",
        &format!("New notes for {}", subject.code),
        &title,
    );
    info!(note = %id, subject = %subject.code, notified, "note added");
    Ok(json!({ "noteId": id, "notified": notified }))
}

/// Students list the notes of their own class; everyone else names the
/// department and semester.
fn notes_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewNotes)?;
    let conn = require_db(state)?;

    let (dept_id, semester) = match &ctx.identity {
        Identity::Student {
            dept_id, semester, ..
        } => (dept_id.clone(), *semester),
        _ => {
            let dept = require_department(conn, &get_required_str(params, "departmentCode")?)?;
            (dept.id, get_semester(params, "semester")?.get() as i64)
        }
    };
    let subject_code = get_optional_str(params, "subjectCode")?.map(|s| s.to_ascii_uppercase());

    let mut stmt = conn.prepare(
        "SELECT n.id, n.title, n.description, n.file_url, n.uploaded_at, n.author_user_id,
                s.code, s.name
         FROM notes n
         JOIN subject_offerings o ON o.id = n.offering_id
         JOIN subjects s ON s.id = o.subject_id
         WHERE o.dept_id = ?1 AND o.semester = ?2 AND (?3 IS NULL OR s.code = ?3)
         ORDER BY n.uploaded_at DESC",
    )?;
    let notes = stmt
        .query_map((&dept_id, semester, subject_code.as_deref()), |r| {
            Ok(json!({
                "noteId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "fileUrl": r.get::<_, String>(3)?,
                "uploadedAt": r.get::<_, String>(4)?,
                "authorUserId": r.get::<_, String>(5)?,
                "subjectCode": r.get::<_, String>(6)?,
                "subjectName": r.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notes": notes }))
}

fn notes_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::UploadNotes)?;
    let conn = require_db(state)?;
    let note_id = get_required_str(params, "noteId")?;

    let author: String = conn
        .query_row(
            "SELECT author_user_id FROM notes WHERE id = ?",
            [&note_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("note not found"))?;
    if author != ctx.identity.user_id() && !ctx.identity.can(Capability::ManageDirectory) {
        return Err(HandlerErr::forbidden("only the author may delete this note"));
    }
    conn.execute("DELETE FROM notes WHERE id = ?", [&note_id])
        .map_err(db_err("db_delete_failed", "notes"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notes.create" => notes_create(state, &req.params),
        "notes.list" => notes_list(state, &req.params),
        "notes.delete" => notes_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
