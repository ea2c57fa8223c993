use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedIn": state.session.is_authenticated()
        }),
    )
}

/// Opens (creating if needed) the workspace database. Switching workspace
/// ends the current session: its identity belongs to the previous store.
pub fn select_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    let user_count = db::user_count(&conn)?;
    info!(workspace = %path.display(), user_count, "workspace opened");
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.session.sign_out();
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match select_workspace(state, &path) {
        Ok(()) => {
            let needs_bootstrap = state
                .db
                .as_ref()
                .and_then(|c| db::user_count(c).ok())
                .map(|n| n == 0)
                .unwrap_or(false);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "needsBootstrap": needs_bootstrap
                }),
            )
        }
        Err(e) => {
            warn!(workspace = %path.display(), error = %e, "failed to open workspace");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
