use crate::calc::summary::{compute_annual_summary, compute_trimester_summary, CalcContext};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{
    load_reports_setup, request_grading_policy, request_student_filter,
};
use crate::ipc::helpers::{calc_err, db_conn, parse_trimester, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

/// Adds the report envelope fields the renderer expects on every model.
fn finish_model(
    conn: &Connection,
    req: &Request,
    kind: &str,
    mut payload: serde_json::Value,
) -> serde_json::Value {
    let setup = match load_reports_setup(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("kind".to_string(), json!(kind));
        let generated_at = if setup.show_generated_at {
            json!(Utc::now().to_rfc3339())
        } else {
            serde_json::Value::Null
        };
        obj.insert("generatedAt".to_string(), generated_at);
    }
    ok(&req.id, payload)
}

fn handle_reports_mini_pauta_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
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
    let filter = match request_student_filter(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match request_grading_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        subject_id: &subject_id,
        trimester,
    };
    let summary = match compute_trimester_summary(&ctx, filter, &policy) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    // Column header in display order; rows carry values keyed by the same codes.
    let columns: Vec<serde_json::Value> = summary
        .components
        .iter()
        .map(|d| {
            json!({
                "code": d.component.code,
                "name": d.name,
                "weightPercent": d.component.weight_percent,
                "isCalculated": d.component.is_calculated
            })
        })
        .collect();
    let mut payload = json!(summary);
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("columns".to_string(), json!(columns));
    }
    finish_model(conn, req, "miniPauta", payload)
}

fn handle_reports_annual_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filter = match request_student_filter(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match request_grading_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match compute_annual_summary(conn, &class_id, filter, &policy) {
        Ok(summary) => finish_model(conn, req, "annual", json!(summary)),
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.miniPautaModel" => Some(handle_reports_mini_pauta_model(state, req)),
        "reports.annualModel" => Some(handle_reports_annual_model(state, req)),
        _ => None,
    }
}
