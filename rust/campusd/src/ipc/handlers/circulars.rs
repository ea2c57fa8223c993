use crate::ipc::helpers::{
    authorize, db_err, get_optional_str, get_required_str, now_iso, require, require_db,
    require_department, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Identity, SessionContext};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    All,
    Students,
    Faculty,
    SpecificDept,
}

impl Audience {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "all" => Some(Self::All),
            "students" => Some(Self::Students),
            "faculty" => Some(Self::Faculty),
            "specific_dept" => Some(Self::SpecificDept),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Students => "students",
            Self::Faculty => "faculty",
            Self::SpecificDept => "specific_dept",
        }
    }
}

struct CircularInput {
    title: String,
    content: String,
    audience: Audience,
    dept_id: Option<String>,
    attachment_url: Option<String>,
}

fn parse_input(conn: &Connection, params: &Value) -> Result<CircularInput, HandlerErr> {
    let title = get_required_str(params, "title")?;
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(HandlerErr::bad_params(format!(
            "title must be at most {} characters",
            MAX_TITLE_LEN
        )));
    }
    let content = get_required_str(params, "content")?;
    let audience_raw = get_required_str(params, "audience")?;
    let audience = Audience::parse(&audience_raw).ok_or_else(|| {
        HandlerErr::bad_params("audience must be one of: all, students, faculty, specific_dept")
    })?;
    let dept_code = get_optional_str(params, "deptCode")?;
    let dept_id = match (audience, dept_code) {
        (Audience::SpecificDept, Some(code)) => Some(require_department(conn, &code)?.id),
        (Audience::SpecificDept, None) => {
            return Err(HandlerErr::bad_params(
                "deptCode is required for the specific_dept audience",
            ))
        }
        (_, Some(_)) => {
            return Err(HandlerErr::bad_params(
                "deptCode is only valid for the specific_dept audience",
            ))
        }
        (_, None) => None,
    };
    Ok(CircularInput {
        title,
        content,
        audience,
        dept_id,
        attachment_url: get_optional_str(params, "attachmentUrl")?,
    })
}

fn viewer_dept(ctx: &SessionContext) -> Option<&str> {
    match &ctx.identity {
        Identity::Student { dept_id, .. } => Some(dept_id),
        Identity::Faculty { dept_id, .. } => dept_id.as_deref(),
        Identity::Admin { .. } => None,
    }
}

/// Admins see everything. Everyone else sees `all`, their role's audience,
/// their own department's circulars and whatever they wrote themselves.
const VISIBLE_TO_VIEWER: &str = "(?1 = 'admin'
    OR c.audience = 'all'
    OR c.author_user_id = ?3
    OR (?1 = 'student' AND c.audience = 'students')
    OR (?1 = 'faculty' AND c.audience = 'faculty')
    OR (c.audience = 'specific_dept' AND c.dept_id = ?2))";

fn circular_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "circularId": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "content": r.get::<_, String>(2)?,
        "audience": r.get::<_, String>(3)?,
        "deptCode": r.get::<_, Option<String>>(4)?,
        "attachmentUrl": r.get::<_, Option<String>>(5)?,
        "postedAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, Option<String>>(7)?,
        "authorUserId": r.get::<_, String>(8)?,
    }))
}

const CIRCULAR_COLUMNS: &str = "c.id, c.title, c.content, c.audience, d.code, c.attachment_url,
    c.posted_at, c.updated_at, c.author_user_id
    FROM circulars c
    LEFT JOIN departments d ON d.id = c.dept_id";

fn circulars_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::PostCirculars)?;
    let conn = require_db(state)?;
    let input = parse_input(conn, params)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO circulars(id, author_user_id, title, content, audience, dept_id, attachment_url, posted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            ctx.identity.user_id(),
            &input.title,
            &input.content,
            input.audience.as_str(),
            &input.dept_id,
            &input.attachment_url,
            now_iso(),
        ),
    )
    .map_err(db_err("db_insert_failed", "circulars"))?;
    info!(circular = %id, audience = input.audience.as_str(), "circular posted");
    Ok(json!({ "circularId": id }))
}

fn circulars_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewCirculars)?;
    let conn = require_db(state)?;

    let sql = format!(
        "SELECT {} WHERE {} ORDER BY c.posted_at DESC",
        CIRCULAR_COLUMNS, VISIBLE_TO_VIEWER
    );
    let mut stmt = conn.prepare(&sql)?;
    let circulars = stmt
        .query_map(
            (
                ctx.identity.role().as_str(),
                viewer_dept(&ctx),
                ctx.identity.user_id(),
            ),
            circular_json,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "circulars": circulars }))
}

fn circulars_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewCirculars)?;
    let conn = require_db(state)?;
    let circular_id = get_required_str(params, "circularId")?;

    let sql = format!(
        "SELECT {} WHERE c.id = ?4 AND {}",
        CIRCULAR_COLUMNS, VISIBLE_TO_VIEWER
    );
    // Hidden circulars look the same as missing ones.
    conn.query_row(
        &sql,
        (
            ctx.identity.role().as_str(),
            viewer_dept(&ctx),
            ctx.identity.user_id(),
            &circular_id,
        ),
        circular_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("circular not found"))
}

/// Authors manage their own circulars; `ManageAnyCircular` covers the rest.
fn require_editable(
    conn: &Connection,
    ctx: &SessionContext,
    circular_id: &str,
) -> Result<(), HandlerErr> {
    let author: String = conn
        .query_row(
            "SELECT author_user_id FROM circulars WHERE id = ?",
            [circular_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("circular not found"))?;
    if author == ctx.identity.user_id() || ctx.identity.can(Capability::ManageAnyCircular) {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("only the author may change this circular"))
    }
}

fn circulars_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::PostCirculars)?;
    let conn = require_db(state)?;
    let circular_id = get_required_str(params, "circularId")?;
    let input = parse_input(conn, params)?;
    require_editable(conn, &ctx, &circular_id)?;

    conn.execute(
        "UPDATE circulars
         SET title = ?, content = ?, audience = ?, dept_id = ?, attachment_url = ?, updated_at = ?
         WHERE id = ?",
        (
            &input.title,
            &input.content,
            input.audience.as_str(),
            &input.dept_id,
            &input.attachment_url,
            now_iso(),
            &circular_id,
        ),
    )
    .map_err(db_err("db_update_failed", "circulars"))?;
    Ok(json!({ "circularId": circular_id }))
}

fn circulars_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::PostCirculars)?;
    let conn = require_db(state)?;
    let circular_id = get_required_str(params, "circularId")?;
    require_editable(conn, &ctx, &circular_id)?;

    conn.execute("DELETE FROM circulars WHERE id = ?", [&circular_id])
        .map_err(db_err("db_delete_failed", "circulars"))?;
    info!(circular = %circular_id, "circular deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "circulars.create" => circulars_create(state, &req.params),
        "circulars.list" => circulars_list(state, &req.params),
        "circulars.get" => circulars_get(state, &req.params),
        "circulars.update" => circulars_update(state, &req.params),
        "circulars.delete" => circulars_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
