use crate::assessment::{self, IaScores};
use crate::ipc::handlers::attendance::check_generation;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    authorize, class_student_ids, db_err, get_required_str, now_iso, require, require_db,
    resolve_assignment, resolve_class, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{Capability, Identity};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

fn scores_by_student(
    conn: &Connection,
    offering_id: &str,
) -> Result<HashMap<String, IaScores>, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT student_id, assessment, score FROM marks WHERE offering_id = ?")?;
    let mut rows = stmt.query([offering_id])?;
    let mut out: HashMap<String, IaScores> = HashMap::new();
    while let Some(row) = rows.next()? {
        let student_id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let score: f64 = row.get(2)?;
        out.entry(student_id).or_default().insert(name, score);
    }
    Ok(out)
}

fn scores_json(scores: &IaScores, names: &[String]) -> Value {
    let mut obj = serde_json::Map::new();
    for n in names {
        obj.insert(n.clone(), json!(scores.get(n)));
    }
    Value::Object(obj)
}

/// Every student of a class with the configured assessments and the IA
/// average per student.
fn marks_class_scores(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::EnterMarks)?;
    let conn = require_db(state)?;

    let class = resolve_class(conn, params)?;
    resolve_assignment(conn, &ctx, &class)?;
    let marks_setup = setup::marks_setup(conn)?;
    let scores = scores_by_student(conn, &class.offering_id)?;

    let students = {
        let mut stmt = conn.prepare(
            "SELECT id, usn, name FROM student_details
             WHERE dept_id = ? AND semester = ? AND section = ?
             ORDER BY usn",
        )?;
        let rows = stmt
            .query_map(
                (&class.dept.id, class.semester.get() as i64, &class.section),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let empty = IaScores::new();
    let rows: Vec<Value> = students
        .into_iter()
        .map(|(id, usn, name)| {
            let s = scores.get(&id).unwrap_or(&empty);
            json!({
                "studentId": id,
                "usn": usn,
                "name": name,
                "scores": scores_json(s, &marks_setup.assessments),
                "iaAverage": assessment::ia_average(s, &marks_setup.assessments),
            })
        })
        .collect();

    let generation = state.marks_generation.issue();
    Ok(json!({
        "assessments": marks_setup.assessments,
        "maxScore": marks_setup.max_score,
        "students": rows,
        "generation": generation,
    }))
}

/// Upserts one assessment for many students. Entries with an out-of-range
/// score or a student outside the class are skipped and reported.
fn marks_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::EnterMarks)?;
    check_generation(&state.marks_generation, params)?;
    let conn = require_db(state)?;

    let marks_setup = setup::marks_setup(conn)?;
    let assessment_name = assessment::normalize_assessment_name(&get_required_str(
        params,
        "assessment",
    )?)
    .filter(|n| marks_setup.assessments.contains(n))
    .ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "assessment must be one of: {}",
            marks_setup.assessments.join(", ")
        ))
    })?;
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("entries must not be empty"));
    }

    let class = resolve_class(conn, params)?;
    resolve_assignment(conn, &ctx, &class)?;
    let enrolled: HashSet<String> = class_student_ids(conn, &class)?.into_iter().collect();

    let mut accepted: Vec<(String, f64)> = Vec::new();
    let mut skipped: Vec<Value> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let student_id = item.get("studentId").and_then(|v| v.as_str()).map(str::trim);
        let score = item.get("score").and_then(|v| v.as_f64());
        let reason = match (student_id, score) {
            (None, _) | (Some(""), _) => Some("missing studentId"),
            (_, None) => Some("score must be a number"),
            (Some(_), Some(s)) if !assessment::score_in_range(s, marks_setup.max_score) => {
                Some("score out of range")
            }
            (Some(id), _) if !enrolled.contains(id) => Some("student not in this class"),
            _ => None,
        };
        match (reason, student_id, score) {
            (None, Some(id), Some(s)) => accepted.push((id.to_string(), s)),
            (reason, _, _) => skipped.push(json!({
                "index": i,
                "reason": reason.unwrap_or("invalid entry"),
            })),
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = now_iso();
    for (student_id, score) in &accepted {
        tx.execute(
            "INSERT INTO marks(id, offering_id, student_id, assessment, score, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(offering_id, student_id, assessment) DO UPDATE SET
               score = excluded.score,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &class.offering_id,
                student_id,
                &assessment_name,
                score,
                &now,
            ),
        )
        .map_err(db_err("db_update_failed", "marks"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    info!(
        subject = %class.subject.code,
        assessment = %assessment_name,
        saved = accepted.len(),
        skipped = skipped.len(),
        "marks saved"
    );
    Ok(json!({
        "assessment": assessment_name,
        "saved": accepted.len(),
        "skipped": skipped.len(),
        "skippedEntries": skipped,
    }))
}

/// The signed-in student's scores, one block per subject.
fn marks_my_scores(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = authorize(state, params)?;
    require(&ctx, Capability::ViewOwnMarks)?;
    let conn = require_db(state)?;
    let Identity::Student {
        student_id,
        dept_id,
        semester,
        ..
    } = &ctx.identity
    else {
        return Err(HandlerErr::forbidden("only students have own marks"));
    };
    let names = setup::marks_setup(conn)?.assessments;

    let mut stmt = conn.prepare(
        "SELECT o.id, s.code, s.name, o.semester, m.assessment, m.score
         FROM subject_offerings o
         JOIN subjects s ON s.id = o.subject_id
         LEFT JOIN marks m ON m.offering_id = o.id AND m.student_id = ?1
         WHERE (o.dept_id = ?2 AND o.semester = ?3) OR m.id IS NOT NULL
         ORDER BY o.semester, s.name",
    )?;
    let mut rows = stmt.query((student_id, dept_id, semester))?;

    struct SubjectScores {
        code: String,
        name: String,
        semester: i64,
        scores: IaScores,
    }
    let mut order: Vec<String> = Vec::new();
    let mut by_offering: HashMap<String, SubjectScores> = HashMap::new();
    while let Some(row) = rows.next()? {
        let offering_id: String = row.get(0)?;
        let entry = by_offering.entry(offering_id.clone()).or_insert_with(|| {
            order.push(offering_id);
            SubjectScores {
                code: String::new(),
                name: String::new(),
                semester: 0,
                scores: IaScores::new(),
            }
        });
        entry.code = row.get(1)?;
        entry.name = row.get(2)?;
        entry.semester = row.get(3)?;
        if let (Some(a), Some(s)) = (row.get::<_, Option<String>>(4)?, row.get::<_, Option<f64>>(5)?) {
            entry.scores.insert(a, s);
        }
    }

    let subjects: Vec<Value> = order
        .iter()
        .filter_map(|id| by_offering.get(id))
        .map(|s| {
            json!({
                "subjectCode": s.code,
                "subjectName": s.name,
                "semester": s.semester,
                "scores": scores_json(&s.scores, &names),
                "iaAverage": assessment::ia_average(&s.scores, &names),
            })
        })
        .collect();
    Ok(json!({ "assessments": names, "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "marks.classScores" => marks_class_scores(state, &req.params),
        "marks.update" => marks_update(state, &req.params),
        "marks.myScores" => marks_my_scores(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
