use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::filters::FetchGeneration;
use crate::session::Session;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Session,
    /// Attendance rosters and marks sheets are stale-checked independently.
    pub attendance_generation: FetchGeneration,
    pub marks_generation: FetchGeneration,
}
