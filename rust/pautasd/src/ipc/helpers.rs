use crate::calc;
use crate::calc::summary::StudentStatusFilter;
use crate::ipc::error::{err, from_calc};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .conn()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    from_calc(&req.id, e)
}

pub fn parse_trimester(req: &Request) -> Result<i64, serde_json::Value> {
    match req.params.get("trimester").and_then(|v| v.as_i64()) {
        Some(t) if calc::summary::TRIMESTERS.contains(&t) => Ok(t),
        Some(t) => Err(err(
            &req.id,
            "bad_params",
            "trimester must be 1, 2 or 3",
            Some(json!({ "trimester": t })),
        )),
        None => Err(err(&req.id, "bad_params", "missing trimester", None)),
    }
}

/// `params.studentStatus`, falling back to `default` when absent or null.
pub fn parse_student_filter(
    req: &Request,
    default: StudentStatusFilter,
) -> Result<StudentStatusFilter, serde_json::Value> {
    match req.params.get("studentStatus") {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_str()
            .and_then(StudentStatusFilter::parse)
            .ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    "studentStatus must be one of: active, inactive, blocked, all",
                    Some(json!({ "studentStatus": v })),
                )
            }),
    }
}
