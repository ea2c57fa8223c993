use crate::assessment;
use crate::db;
use crate::ipc::helpers::{authorize, require, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, Capability};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Session,
    Attendance,
    Marks,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "attendance" => Some(Self::Attendance),
            "marks" => Some(Self::Marks),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Session => "setup.session",
            Self::Attendance => "setup.attendance",
            Self::Marks => "setup.marks",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Session => json!({
            "ttlMinutes": session::DEFAULT_TTL_MINUTES
        }),
        SetupSection::Attendance => json!({
            "sections": ["A", "B", "C"],
            "defaultStatus": "present"
        }),
        SetupSection::Marks => json!({
            "maxScore": assessment::MAX_SCORE as i64,
            "assessments": assessment::default_assessment_names()
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_code_list(v: &Value, key: &str, max_items: usize) -> Result<Vec<String>, String> {
    let items = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    if items.is_empty() || items.len() > max_items {
        return Err(format!("{} must hold 1..={} entries", key, max_items));
    }
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let s = item
            .as_str()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty() && s.len() <= 16)
            .ok_or_else(|| format!("{} entries must be short non-empty strings", key))?;
        if !out.contains(&s) {
            out.push(s);
        }
    }
    Ok(out)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Session => match k.as_str() {
                "ttlMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 24 * 60)?));
                }
                _ => return Err(format!("unknown session field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "sections" => {
                    obj.insert(k.clone(), json!(parse_code_list(v, k, 26)?));
                }
                "defaultStatus" => {
                    let s = v
                        .as_str()
                        .map(|s| s.trim().to_ascii_lowercase())
                        .ok_or_else(|| format!("{} must be string", k))?;
                    if s != "present" && s != "absent" {
                        return Err("defaultStatus must be one of: present, absent".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Marks => match k.as_str() {
                "maxScore" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 1000)?));
                }
                "assessments" => {
                    obj.insert(k.clone(), json!(parse_code_list(v, k, 12)?));
                }
                _ => return Err(format!("unknown marks field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort: a malformed saved value must not block setup.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn load_or_fail(conn: &rusqlite::Connection, section: SetupSection) -> Result<Value, HandlerErr> {
    load_section(conn, section).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn string_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn session_ttl_minutes(conn: &rusqlite::Connection) -> Result<i64, HandlerErr> {
    let s = load_or_fail(conn, SetupSection::Session)?;
    Ok(s["ttlMinutes"]
        .as_i64()
        .unwrap_or(session::DEFAULT_TTL_MINUTES))
}

pub fn allowed_sections(conn: &rusqlite::Connection) -> Result<Vec<String>, HandlerErr> {
    let s = load_or_fail(conn, SetupSection::Attendance)?;
    Ok(string_list(&s["sections"]))
}

pub fn default_attendance_status(conn: &rusqlite::Connection) -> Result<String, HandlerErr> {
    let s = load_or_fail(conn, SetupSection::Attendance)?;
    Ok(s["defaultStatus"].as_str().unwrap_or("present").to_string())
}

pub struct MarksSetup {
    pub max_score: f64,
    pub assessments: Vec<String>,
}

pub fn marks_setup(conn: &rusqlite::Connection) -> Result<MarksSetup, HandlerErr> {
    let s = load_or_fail(conn, SetupSection::Marks)?;
    Ok(MarksSetup {
        max_score: s["maxScore"].as_f64().unwrap_or(assessment::MAX_SCORE),
        assessments: string_list(&s["assessments"]),
    })
}

fn setup_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    authorize(state, params)?;
    let conn = require_db(state)?;
    Ok(json!({
        "session": load_or_fail(conn, SetupSection::Session)?,
        "attendance": load_or_fail(conn, SetupSection::Attendance)?,
        "marks": load_or_fail(conn, SetupSection::Marks)?,
    }))
}

fn setup_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::EditSetup)?;
    let conn = require_db(state)?;

    let Some(section_raw) = params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_or_fail(conn, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "section": section_raw, "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(respond(&req.id, setup_get(state, &req.params))),
        "setup.update" => Some(respond(&req.id, setup_update(state, &req.params))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_are_validated_per_field() {
        let mut cur = default_section(SetupSection::Attendance);
        let patch = json!({ "sections": ["a", "b", "a"], "defaultStatus": "Absent" });
        merge_section_patch(SetupSection::Attendance, &mut cur, patch.as_object().expect("obj"))
            .expect("merge");
        assert_eq!(cur["sections"], json!(["A", "B"]));
        assert_eq!(cur["defaultStatus"], "absent");

        let bad = json!({ "ttlMinutes": 1 });
        assert!(merge_section_patch(
            SetupSection::Session,
            &mut default_section(SetupSection::Session),
            bad.as_object().expect("obj")
        )
        .is_err());

        let unknown = json!({ "colour": "red" });
        assert!(merge_section_patch(
            SetupSection::Marks,
            &mut default_section(SetupSection::Marks),
            unknown.as_object().expect("obj")
        )
        .is_err());
    }

    #[test]
    fn defaults_match_crate_constants() {
        let marks = default_section(SetupSection::Marks);
        assert_eq!(string_list(&marks["assessments"]), vec!["IA1", "IA2", "IA3"]);
        assert_eq!(
            default_section(SetupSection::Session)["ttlMinutes"],
            session::DEFAULT_TTL_MINUTES
        );
    }
}
