pub mod formula;
pub mod grades;
pub mod resolver;
pub mod stats;
pub mod summary;

use serde::Serialize;

pub use grades::{GradingPolicy, MissingComponentPolicy, ResolvedGrade};
pub use resolver::{EvaluationComponent, RecordedScore};

/// Half-up rounding to 2 decimals used for every computed grade:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for CalcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CalcError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Config,
    Evaluation,
}

/// Non-fatal annotation attached to a resolution or grade.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub kind: WarningKind,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_code: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn config(code: &str, component_code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Config,
            code: code.to_string(),
            component_code: component_code.map(|c| c.to_string()),
            message: message.into(),
        }
    }

    pub fn evaluation(code: &str, component_code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Evaluation,
            code: code.to_string(),
            component_code: Some(component_code.to_string()),
            message: message.into(),
        }
    }
}
