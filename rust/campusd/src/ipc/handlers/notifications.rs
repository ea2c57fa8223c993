use crate::ipc::helpers::{
    authorize, db_err, get_required_str, now_iso, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

/// Who a class-level notification goes to. `sections: None` reaches every
/// section of the (department, semester).
pub struct ClassAudience<'a> {
    pub dept_id: &'a str,
    pub semester: i64,
    pub sections: Option<&'a [String]>,
}

/// Inserts one unread row per enrolled student of the audience and returns
/// how many were written.
pub fn notify_students(
    conn: &Connection,
    audience: &ClassAudience<'_>,
    kind: &str,
    title: &str,
    message: &str,
) -> Result<usize, HandlerErr> {
    let recipients: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT user_id, section FROM student_details
             WHERE dept_id = ? AND semester = ?",
        )?;
        let rows = stmt
            .query_map((audience.dept_id, audience.semester), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .filter(|(_, section)| match audience.sections {
                Some(wanted) => wanted.iter().any(|s| s == section),
                None => true,
            })
            .map(|(user_id, _)| user_id)
            .collect()
    };
    if recipients.is_empty() {
        return Ok(0);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed", "notifications"))?;
    let created_at = now_iso();
    {
        let mut insert = tx.prepare(
            "INSERT INTO notifications(id, user_id, kind, title, message, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
        )?;
        for user_id in &recipients {
            insert
                .execute((
                    Uuid::new_v4().to_string(),
                    user_id,
                    kind,
                    title,
                    message,
                    &created_at,
                ))
                .map_err(db_err("db_insert_failed", "notifications"))?;
        }
    }
    tx.commit()
        .map_err(db_err("db_commit_failed", "notifications"))?;
    debug!(kind, recipients = recipients.len(), "notifications queued");
    Ok(recipients.len())
}

/// Fan-out that never fails the write it follows: the source row is
/// already stored, so a failed notification is logged and counted as zero.
pub fn notify_students_logged(
    conn: &Connection,
    audience: &ClassAudience<'_>,
    kind: &str,
    title: &str,
    message: &str,
) -> usize {
    match notify_students(conn, audience, kind, title, message) {
        Ok(n) => n,
        Err(e) => {
            warn!(kind, code = e.code, error = %e.message, "notification fan-out failed");
            0
        }
    }
}

fn unread_count(conn: &Connection, user_id: &str) -> Result<i64, HandlerErr> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read_at IS NULL",
        [user_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

fn notifications_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    let conn = require_db(state)?;
    let user_id = ctx.identity.user_id();

    let unread_only = match params.get("unreadOnly") {
        None | Some(Value::Null) => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("unreadOnly must be boolean"))?,
    };
    let limit = match params.get("limit") {
        None | Some(Value::Null) => DEFAULT_LIMIT,
        Some(v) => v
            .as_i64()
            .filter(|n| (1..=MAX_LIMIT).contains(n))
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("limit must be between 1 and {}", MAX_LIMIT))
            })?,
    };

    let mut stmt = conn.prepare(
        "SELECT id, kind, title, message, created_at, read_at
         FROM notifications
         WHERE user_id = ?1 AND (?2 = 0 OR read_at IS NULL)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3",
    )?;
    let notifications = stmt
        .query_map((user_id, unread_only as i64, limit), |r| {
            let read_at: Option<String> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "message": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "read": read_at.is_some(),
                "readAt": read_at,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "notifications": notifications,
        "unread": unread_count(conn, user_id)?,
    }))
}

fn notifications_mark_read(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    let conn = require_db(state)?;
    let notification_id = get_required_str(params, "notificationId")?;

    // Rows of other users look the same as missing ones.
    let updated = conn
        .execute(
            "UPDATE notifications SET read_at = COALESCE(read_at, ?)
             WHERE id = ? AND user_id = ?",
            (now_iso(), &notification_id, ctx.identity.user_id()),
        )
        .map_err(db_err("db_update_failed", "notifications"))?;
    if updated == 0 {
        return Err(HandlerErr::not_found("notification not found"));
    }
    Ok(json!({ "unread": unread_count(conn, ctx.identity.user_id())? }))
}

fn notifications_mark_all_read(
    state: &mut AppState,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    let conn = require_db(state)?;
    let updated = conn
        .execute(
            "UPDATE notifications SET read_at = ? WHERE user_id = ? AND read_at IS NULL",
            (now_iso(), ctx.identity.user_id()),
        )
        .map_err(db_err("db_update_failed", "notifications"))?;
    Ok(json!({ "updated": updated, "unread": 0 }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => notifications_list(state, &req.params),
        "notifications.markRead" => notifications_mark_read(state, &req.params),
        "notifications.markAllRead" => notifications_mark_all_read(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
