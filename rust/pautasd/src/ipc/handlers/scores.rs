use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_trimester, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

const MIN_SCORE: f64 = 0.0;
const MAX_SCORE: f64 = 20.0;

/// `null` clears; numbers must be finite and within the grading scale.
fn parse_score_value(v: Option<&Value>) -> Result<Option<f64>, String> {
    match v {
        None => Err("missing value".into()),
        Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if (MIN_SCORE..=MAX_SCORE).contains(&n) => Ok(Some(n)),
            Some(n) => Err(format!(
                "value {} is outside {}..={}",
                n, MIN_SCORE, MAX_SCORE
            )),
            None => Err("value must be a number or null".into()),
        },
    }
}

/// Component must exist and be raw; student must belong to the subject's class.
fn check_score_target(
    conn: &Connection,
    component_id: &str,
    student_id: &str,
) -> Result<(), (String, String)> {
    let component: Option<(i64, String)> = conn
        .query_row(
            "SELECT c.is_calculated, s.class_id
             FROM components c
             JOIN subjects s ON s.id = c.subject_id
             WHERE c.id = ?",
            [component_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| ("db_query_failed".to_string(), e.to_string()))?;
    let Some((is_calculated, class_id)) = component else {
        return Err(("not_found".into(), "component not found".into()));
    };
    if is_calculated != 0 {
        return Err((
            "bad_params".into(),
            "scores cannot be recorded for calculated components".into(),
        ));
    }

    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| ("db_query_failed".to_string(), e.to_string()))?;
    match student_class {
        None => Err(("not_found".into(), "student not found".into())),
        Some(c) if c != class_id => Err((
            "bad_params".into(),
            "student is not in the subject's class".into(),
        )),
        Some(_) => Ok(()),
    }
}

fn upsert_score(
    conn: &Connection,
    component_id: &str,
    student_id: &str,
    value: Option<f64>,
    updated_at: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO scores(id, component_id, student_id, value, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(component_id, student_id) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            component_id,
            student_id,
            value,
            updated_at,
        ),
    )
}

fn handle_scores_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let trimester = match parse_trimester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut stmt = match conn.prepare(
        "SELECT sc.student_id, sc.component_id, c.code, sc.value, sc.updated_at
         FROM scores sc
         JOIN components c ON c.id = sc.component_id
         WHERE c.subject_id = ?1 AND c.trimester = ?2
           AND (?3 IS NULL OR sc.student_id = ?3)
         ORDER BY sc.student_id, c.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&subject_id, trimester, student_id.as_deref()), |r| {
            let student_id: String = r.get(0)?;
            let component_id: String = r.get(1)?;
            let code: String = r.get(2)?;
            let value: Option<f64> = r.get(3)?;
            let updated_at: Option<String> = r.get(4)?;
            Ok(json!({
                "studentId": student_id,
                "componentId": component_id,
                "code": code,
                "value": value,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_scores_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = match parse_score_value(req.params.get("value")) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if let Err((code, msg)) = check_score_target(conn, &component_id, &student_id) {
        return err(
            &req.id,
            &code,
            msg,
            Some(json!({ "componentId": component_id, "studentId": student_id })),
        );
    }

    let updated_at = Utc::now().to_rfc3339();
    if let Err(e) = upsert_score(conn, &component_id, &student_id, value, &updated_at) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "scores" })),
        );
    }
    ok(
        &req.id,
        json!({ "ok": true, "value": value, "updatedAt": updated_at }),
    )
}

fn handle_scores_bulk_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "entries must be an array", None);
    };

    // Validate everything up front so the write is all-or-nothing.
    let mut parsed: Vec<(String, String, Option<f64>)> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let component_id = entry
            .get("componentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let student_id = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let (Some(component_id), Some(student_id)) = (component_id, student_id) else {
            return err(
                &req.id,
                "bad_params",
                "each entry needs componentId and studentId",
                Some(json!({ "index": index })),
            );
        };
        let value = match parse_score_value(entry.get("value")) {
            Ok(v) => v,
            Err(msg) => return err(&req.id, "bad_params", msg, Some(json!({ "index": index }))),
        };
        if let Err((code, msg)) = check_score_target(conn, &component_id, &student_id) {
            return err(&req.id, &code, msg, Some(json!({ "index": index })));
        }
        parsed.push((component_id, student_id, value));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let updated_at = Utc::now().to_rfc3339();
    for (index, (component_id, student_id, value)) in parsed.iter().enumerate() {
        if let Err(e) = upsert_score(&tx, component_id, student_id, *value, &updated_at) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "scores", "index": index })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    debug!(count = parsed.len(), "scores bulk set");
    ok(&req.id, json!({ "ok": true, "updated": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.get" => Some(handle_scores_get(state, req)),
        "scores.set" => Some(handle_scores_set(state, req)),
        "scores.bulkSet" => Some(handle_scores_bulk_set(state, req)),
        _ => None,
    }
}
