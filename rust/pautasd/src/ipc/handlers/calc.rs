use crate::calc::formula::ArithmeticEvaluator;
use crate::calc::grades::final_grade;
use crate::calc::resolver::resolve_components;
use crate::calc::summary::{
    compute_annual_summary, compute_student_row, compute_trimester_summary, CalcContext,
};
use crate::calc::{EvaluationComponent, RecordedScore};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::{
    inline_grading_policy, request_grading_policy, request_student_filter,
};
use crate::ipc::helpers::{calc_err, db_conn, parse_trimester, required_str};
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;

struct ScopeParams {
    class_id: String,
    subject_id: String,
    trimester: i64,
}

fn parse_scope(req: &Request) -> Result<ScopeParams, serde_json::Value> {
    Ok(ScopeParams {
        class_id: required_str(req, "classId")?,
        subject_id: required_str(req, "subjectId")?,
        trimester: parse_trimester(req)?,
    })
}

fn handle_calc_resolve_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match request_grading_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ctx = CalcContext {
        conn,
        class_id: &scope.class_id,
        subject_id: &scope.subject_id,
        trimester: scope.trimester,
    };
    match compute_student_row(&ctx, &student_id, &policy) {
        Ok((components, row)) => ok(
            &req.id,
            json!({
                "policy": policy,
                "components": components,
                "student": row
            }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_calc_final_grades(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
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
        class_id: &scope.class_id,
        subject_id: &scope.subject_id,
        trimester: scope.trimester,
    };
    match compute_trimester_summary(&ctx, filter, &policy) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "policy": summary.policy,
                "studentStatus": summary.student_status,
                "components": summary.components,
                "perStudent": summary.per_student,
                "notAvailableCount": summary.not_available_count
            }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_calc_class_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
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
        class_id: &scope.class_id,
        subject_id: &scope.subject_id,
        trimester: scope.trimester,
    };
    match compute_trimester_summary(&ctx, filter, &policy) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "studentStatus": summary.student_status,
                "statistics": summary.statistics,
                "notAvailableCount": summary.not_available_count
            }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_calc_annual_outcome(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => calc_err(req, e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineScore {
    component_id: String,
    value: Option<f64>,
}

/// Engine preview over request-supplied components; no workspace involved.
fn handle_calc_evaluate_inline(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let components: Vec<EvaluationComponent> = match req.params.get("components") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(c) => c,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("invalid components: {}", e),
                    None,
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing components", None),
    };
    let inline_scores: Vec<InlineScore> = match req.params.get("scores") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(s) => s,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("invalid scores: {}", e),
                    None,
                )
            }
        },
    };
    let policy = match inline_grading_policy(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let scores: Vec<RecordedScore> = inline_scores
        .into_iter()
        .map(|s| RecordedScore {
            student_id: String::new(),
            component_id: s.component_id,
            value: s.value,
        })
        .collect();
    let resolution = match resolve_components(&components, &scores, &ArithmeticEvaluator) {
        Ok(r) => r,
        Err(e) => return calc_err(req, e),
    };
    let grade = final_grade(&components, &resolution, &policy);

    ok(
        &req.id,
        json!({
            "policy": policy,
            "values": resolution.values,
            "recordedCount": resolution.recorded.len(),
            "grade": grade
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.resolveStudent" => Some(handle_calc_resolve_student(state, req)),
        "calc.finalGrades" => Some(handle_calc_final_grades(state, req)),
        "calc.classStats" => Some(handle_calc_class_stats(state, req)),
        "calc.annualOutcome" => Some(handle_calc_annual_outcome(state, req)),
        "calc.evaluateInline" => Some(handle_calc_evaluate_inline(state, req)),
        _ => None,
    }
}
