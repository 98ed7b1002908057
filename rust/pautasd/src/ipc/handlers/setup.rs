use crate::calc::formula::is_identifier;
use crate::calc::grades::{DEFAULT_FINAL_COMPONENT_CODE, DEFAULT_PASS_MARK};
use crate::calc::summary::StudentStatusFilter;
use crate::calc::{GradingPolicy, MissingComponentPolicy};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_student_filter};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Reports,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "passMark": DEFAULT_PASS_MARK,
            "finalComponentCode": DEFAULT_FINAL_COMPONENT_CODE,
            "missingComponentPolicy": MissingComponentPolicy::Zero.as_str()
        }),
        SetupSection::Reports => json!({
            "defaultStudentStatus": StudentStatusFilter::default().as_str(),
            "showGeneratedAt": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "passMark" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 20.0)?));
                }
                "finalComponentCode" => {
                    // null or "" disables the final-component shortcut.
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                        continue;
                    }
                    let s = parse_string_max(v, k, 32)?;
                    if s.is_empty() {
                        obj.insert(k.clone(), Value::Null);
                    } else if is_identifier(&s) {
                        obj.insert(k.clone(), Value::String(s));
                    } else {
                        return Err(format!("{} must be a component code", k));
                    }
                }
                "missingComponentPolicy" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(policy) = MissingComponentPolicy::parse(&s) else {
                        return Err(
                            "missingComponentPolicy must be one of: zero, renormalize".into(),
                        );
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "defaultStudentStatus" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(filter) = StudentStatusFilter::parse(&s) else {
                        return Err(
                            "defaultStudentStatus must be one of: active, inactive, blocked, all"
                                .into(),
                        );
                    };
                    obj.insert(k.clone(), Value::String(filter.as_str().to_string()));
                }
                "showGeneratedAt" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Saved values were validated on write; a stale field is skipped, not fatal.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn grading_policy_from(section: Value) -> anyhow::Result<GradingPolicy> {
    Ok(serde_json::from_value(section)?)
}

#[derive(Debug, Clone, Copy)]
pub struct ReportsSetup {
    pub default_student_status: StudentStatusFilter,
    pub show_generated_at: bool,
}

pub fn load_reports_setup(conn: &rusqlite::Connection) -> anyhow::Result<ReportsSetup> {
    let section = load_section(conn, SetupSection::Reports)?;
    Ok(ReportsSetup {
        default_student_status: section
            .get("defaultStudentStatus")
            .and_then(|v| v.as_str())
            .and_then(StudentStatusFilter::parse)
            .unwrap_or_default(),
        show_generated_at: section
            .get("showGeneratedAt")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    })
}

/// `params.studentStatus`, defaulting to the workspace reports setup.
pub fn request_student_filter(
    conn: &rusqlite::Connection,
    req: &Request,
) -> Result<StudentStatusFilter, Value> {
    let default_filter = load_reports_setup(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
        .default_student_status;
    parse_student_filter(req, default_filter)
}

/// Workspace grading policy with `params.policyOverride` applied on top.
/// The override is validated like a `setup.update` patch but never saved.
pub fn request_grading_policy(
    conn: &rusqlite::Connection,
    req: &Request,
) -> Result<GradingPolicy, Value> {
    let mut current = load_section(conn, SetupSection::Grading)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match req.params.get("policyOverride") {
        None | Some(Value::Null) => {}
        Some(Value::Object(patch)) => {
            merge_section_patch(SetupSection::Grading, &mut current, patch)
                .map_err(|msg| err(&req.id, "bad_params", msg, None))?;
        }
        Some(_) => {
            return Err(err(
                &req.id,
                "bad_params",
                "policyOverride must be an object",
                None,
            ))
        }
    }
    grading_policy_from(current).map_err(|e| err(&req.id, "bad_params", e.to_string(), None))
}

/// Like [`request_grading_policy`] but without a workspace: defaults plus override.
pub fn inline_grading_policy(req: &Request) -> Result<GradingPolicy, Value> {
    let mut current = default_section(SetupSection::Grading);
    if let Some(v) = req.params.get("policyOverride").filter(|v| !v.is_null()) {
        let Some(patch) = v.as_object() else {
            return Err(err(
                &req.id,
                "bad_params",
                "policyOverride must be an object",
                None,
            ));
        };
        merge_section_patch(SetupSection::Grading, &mut current, patch)
            .map_err(|msg| err(&req.id, "bad_params", msg, None))?;
    }
    grading_policy_from(current).map_err(|e| err(&req.id, "bad_params", e.to_string(), None))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "grading": grading, "reports": reports }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "section": section_raw })),
        );
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.key(), "setup updated");
    ok(
        &req.id,
        json!({ "ok": true, "section": section_raw, "values": current }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
