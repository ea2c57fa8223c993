use crate::filters::{Change, Field, FilterSelection, Semester};
use crate::ipc::helpers::{
    authorize, get_required_str, require, require_db, respond, section_policy, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::Capability;
use serde_json::{json, Value};

fn parse_selection(params: &Value) -> Result<FilterSelection, HandlerErr> {
    match params.get("selection") {
        None | Some(Value::Null) => Ok(FilterSelection::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid selection: {}", e))),
    }
}

fn parse_change(field: Field, value: Option<&Value>) -> Result<Change, HandlerErr> {
    let value = value.filter(|v| !v.is_null());
    let text = |v: &Value| {
        v.as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr::bad_params("value must be string or null"))
    };
    Ok(match field {
        Field::Semester => Change::Semester(match value {
            None => None,
            Some(v) => Some(
                v.as_i64()
                    .and_then(Semester::new)
                    .ok_or_else(|| HandlerErr::bad_params("semester must be in 1..=8"))?,
            ),
        }),
        Field::Department => Change::Department(value.map(text).transpose()?),
        Field::Section => Change::Section(value.map(text).transpose()?),
        Field::Subject => Change::Subject(value.map(text).transpose()?),
    })
}

fn filters_apply(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::UseFilters)?;
    let policy = section_policy(require_db(state)?)?;

    let current = parse_selection(params)?;
    let field_raw = get_required_str(params, "field")?;
    let field = Field::parse(&field_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown field: {}", field_raw)))?;
    let change = parse_change(field, params.get("value"))?;

    let resolution = policy.apply(&current, change);
    Ok(json!({
        "selection": resolution.selection,
        "needsSubjectRefetch": resolution.needs_subject_refetch,
        "state": policy.state(&resolution.selection),
        "sectionRequired": policy.requires_section(&resolution.selection),
    }))
}

fn filters_can_submit(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::UseFilters)?;
    let policy = section_policy(require_db(state)?)?;

    let selection = parse_selection(params)?;
    let roster_len = params
        .get("rosterLen")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("rosterLen must be a non-negative integer"))?;
    Ok(json!({
        "canSubmit": policy.can_submit(&selection, roster_len as usize),
        "state": policy.state(&selection),
    }))
}

fn filters_department_has_sections(
    state: &mut AppState,
    params: &Value,
) -> Result<Value, HandlerErr> {
    authorize(state, params)?;
    let policy = section_policy(require_db(state)?)?;
    let code = get_required_str(params, "departmentCode")?;
    Ok(json!({
        "departmentCode": code.to_ascii_uppercase(),
        "hasSections": policy.has_sections(&code),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "filters.apply" => Some(respond(&req.id, filters_apply(state, &req.params))),
        "filters.canSubmit" => Some(respond(&req.id, filters_can_submit(state, &req.params))),
        "filters.departmentHasSections" => Some(respond(
            &req.id,
            filters_department_has_sections(state, &req.params),
        )),
        _ => None,
    }
}
