use crate::db;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    authorize, db_err, get_required_str, now_iso, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, Identity, Role};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};

pub const MIN_PASSWORD_LEN: usize = 6;

pub fn identity_json(identity: &Identity) -> Value {
    match identity {
        Identity::Student {
            user_id,
            student_id,
            name,
            dept_code,
            semester,
            section,
            ..
        } => json!({
            "role": "student",
            "userId": user_id,
            "studentId": student_id,
            "name": name,
            "deptCode": dept_code,
            "semester": semester,
            "section": if section.is_empty() { Value::Null } else { json!(section) },
        }),
        Identity::Faculty {
            user_id,
            faculty_id,
            name,
            ..
        } => json!({
            "role": "faculty",
            "userId": user_id,
            "facultyId": faculty_id,
            "name": name,
        }),
        Identity::Admin { user_id } => json!({
            "role": "admin",
            "userId": user_id,
        }),
    }
}

/// Builds the identity for a signed-in user from its role-specific details.
pub fn resolve_identity(conn: &Connection, user_id: &str, role: Role) -> Result<Identity, HandlerErr> {
    match role {
        Role::Admin => Ok(Identity::Admin {
            user_id: user_id.to_string(),
        }),
        Role::Student => conn
            .query_row(
                "SELECT sd.id, sd.name, d.id, d.code, sd.semester, sd.section
                 FROM student_details sd
                 JOIN departments d ON d.id = sd.dept_id
                 WHERE sd.user_id = ?",
                [user_id],
                |r| {
                    Ok(Identity::Student {
                        user_id: user_id.to_string(),
                        student_id: r.get(0)?,
                        name: r.get(1)?,
                        dept_id: r.get(2)?,
                        dept_code: r.get(3)?,
                        semester: r.get(4)?,
                        section: r.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| HandlerErr::forbidden("student record not found for this user")),
        Role::Faculty => conn
            .query_row(
                "SELECT id, name, dept_id FROM faculty_details WHERE user_id = ?",
                [user_id],
                |r| {
                    Ok(Identity::Faculty {
                        user_id: user_id.to_string(),
                        faculty_id: r.get(0)?,
                        name: r.get(1)?,
                        dept_id: r.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| HandlerErr::forbidden("faculty record not found for this user")),
    }
}

fn validate_new_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

pub fn insert_user(
    conn: &Connection,
    user_id: &str,
    role: Role,
    password: &str,
    email: Option<&str>,
) -> Result<(), HandlerErr> {
    validate_new_password(password)?;
    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some();
    if exists {
        return Err(HandlerErr::new("conflict", format!("user {} already exists", user_id)));
    }
    let salt = session::new_salt();
    conn.execute(
        "INSERT INTO users(id, role, password_salt, password_hash, email, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            user_id,
            role.as_str(),
            &salt,
            session::hash_password(&salt, password),
            email,
            now_iso(),
        ),
    )
    .map_err(db_err("db_insert_failed", "users"))?;
    Ok(())
}

fn bootstrap_admin(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let user_id = get_required_str(params, "userId")?;
    let password = get_required_str(params, "password")?;
    let count = db::user_count(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if count > 0 {
        return Err(HandlerErr::new(
            "conflict",
            "workspace already has users; sign in as an admin instead",
        ));
    }
    insert_user(conn, &user_id, Role::Admin, &password, None)?;
    info!(user_id = %user_id, "bootstrap admin created");
    Ok(json!({ "userId": user_id, "role": "admin" }))
}

struct StoredCredentials {
    salt: String,
    hash: String,
}

fn load_credentials(
    conn: &Connection,
    user_id: &str,
    role: Role,
) -> Result<Option<StoredCredentials>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT password_salt, password_hash FROM users WHERE id = ? AND role = ?",
            (user_id, role.as_str()),
            |r| {
                Ok(StoredCredentials {
                    salt: r.get(0)?,
                    hash: r.get(1)?,
                })
            },
        )
        .optional()?)
}

fn login(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let password = get_required_str(params, "password")?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be one of: student, faculty, admin"))?;

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    state.session.begin(&user_id);

    let resolved = (|| {
        let creds = load_credentials(conn, &user_id, role)?;
        match creds {
            Some(c) if session::verify_password(&c.salt, &password, &c.hash) => {}
            _ => return Err(HandlerErr::new("invalid_credentials", "invalid user id or password")),
        }
        let identity = resolve_identity(conn, &user_id, role)?;
        let ttl = setup::session_ttl_minutes(conn)?;
        Ok((identity, ttl))
    })();

    let (identity, ttl) = match resolved {
        Ok(v) => v,
        Err(e) => {
            warn!(user_id = %user_id, role = role.as_str(), code = e.code, "sign-in failed");
            state.session.sign_out();
            return Err(e);
        }
    };

    let ctx = state.session.establish(identity, ttl, Utc::now());
    info!(user_id = %user_id, role = role.as_str(), "signed in");
    Ok(json!({
        "token": ctx.token,
        "role": role.as_str(),
        "expiresAt": ctx.expires_at.to_rfc3339(),
        "identity": identity_json(&ctx.identity),
    }))
}

fn logout(state: &mut AppState) -> Result<Value, HandlerErr> {
    if let Some(ctx) = state.session.current() {
        info!(user_id = %ctx.identity.user_id(), "signed out");
    }
    state.session.sign_out();
    Ok(json!({ "ok": true }))
}

fn whoami(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    Ok(json!({
        "identity": identity_json(&ctx.identity),
        "expiresAt": ctx.expires_at.to_rfc3339(),
    }))
}

fn change_password(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let current = get_required_str(params, "currentPassword")?;
    let new_password = get_required_str(params, "newPassword")?;
    let confirm = get_required_str(params, "confirmPassword")?;
    if new_password != confirm {
        return Err(HandlerErr::bad_params("new password and confirmation do not match"));
    }
    validate_new_password(&new_password)?;

    let ctx = authorize(state, params)?;
    let conn = require_db(state)?;
    let user_id = ctx.identity.user_id();
    let creds = load_credentials(conn, user_id, ctx.identity.role())?
        .ok_or_else(|| HandlerErr::not_found("user not found"))?;
    if !session::verify_password(&creds.salt, &current, &creds.hash) {
        return Err(HandlerErr::new("invalid_credentials", "current password is incorrect"));
    }
    let salt = session::new_salt();
    conn.execute(
        "UPDATE users SET password_salt = ?, password_hash = ? WHERE id = ?",
        (&salt, session::hash_password(&salt, &new_password), user_id),
    )
    .map_err(db_err("db_update_failed", "users"))?;
    info!(user_id = %user_id, "password changed");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.bootstrapAdmin" => Some(respond(&req.id, bootstrap_admin(state, &req.params))),
        "auth.login" => Some(respond(&req.id, login(state, &req.params))),
        "auth.logout" => Some(respond(&req.id, logout(state))),
        "auth.whoami" => Some(respond(&req.id, whoami(state, &req.params))),
        "auth.changePassword" => Some(respond(&req.id, change_password(state, &req.params))),
        _ => None,
    }
}
