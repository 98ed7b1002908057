use crate::calc::CalcError;
use serde_json::json;

fn error_body(code: &str, message: String, details: Option<serde_json::Value>) -> serde_json::Value {
    match details {
        Some(d) => json!({ "code": code, "message": message, "details": d }),
        None => json!({ "code": code, "message": message }),
    }
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    json!({ "id": id, "ok": false, "error": error_body(code, message.into(), details) })
}

/// Engine and loader failures carry their own code; it maps 1:1 onto the envelope.
pub fn from_calc(id: &str, e: CalcError) -> serde_json::Value {
    err(id, &e.code, e.message, e.details)
}

/// Reply to a line that did not parse; there is no id to echo.
pub fn bad_json(message: impl Into<String>) -> serde_json::Value {
    json!({ "ok": false, "error": error_body("bad_json", message.into(), None) })
}
