use super::resolver::{EvaluationComponent, Resolution};
use super::{round_off_2_decimals, Warning};
use serde::{Deserialize, Serialize};

pub const PASS_LABEL: &str = "Aprovado";
pub const FAIL_LABEL: &str = "Reprovado";
pub const NOT_AVAILABLE_LABEL: &str = "N/A";

pub const DEFAULT_PASS_MARK: f64 = 10.0;
pub const DEFAULT_FINAL_COMPONENT_CODE: &str = "MT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingComponentPolicy {
    /// Unrecorded components count as 0 against the full weight base.
    Zero,
    /// Unrecorded components are dropped and the remaining weights rescaled.
    Renormalize,
}

impl MissingComponentPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Some(Self::Zero),
            "renormalize" => Some(Self::Renormalize),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Renormalize => "renormalize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingPolicy {
    pub pass_mark: f64,
    pub final_component_code: Option<String>,
    pub missing_component_policy: MissingComponentPolicy,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            pass_mark: DEFAULT_PASS_MARK,
            final_component_code: Some(DEFAULT_FINAL_COMPONENT_CODE.to_string()),
            missing_component_policy: MissingComponentPolicy::Zero,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GradeSource {
    Weighted,
    FinalComponent,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedGrade {
    pub final_value: Option<f64>,
    pub classification: &'static str,
    pub passed: bool,
    pub source: GradeSource,
    pub warnings: Vec<Warning>,
}

/// `(passed, label)` for a final value against the pass mark.
pub fn classify(final_value: Option<f64>, pass_mark: f64) -> (bool, &'static str) {
    match final_value {
        None => (false, NOT_AVAILABLE_LABEL),
        Some(v) if v >= pass_mark => (true, PASS_LABEL),
        Some(_) => (false, FAIL_LABEL),
    }
}

fn graded(
    final_value: Option<f64>,
    source: GradeSource,
    warnings: Vec<Warning>,
    policy: &GradingPolicy,
) -> ResolvedGrade {
    let final_value = final_value.map(round_off_2_decimals);
    let (passed, classification) = classify(final_value, policy.pass_mark);
    ResolvedGrade {
        final_value,
        classification,
        passed,
        source,
        warnings,
    }
}

/// Final grade for one student in one subject/trimester.
///
/// The configured final component, when present in scope as a calculated
/// component, is taken as-is. Otherwise plain components are weighted by
/// `weightPercent`. A scope with no recorded plain score is "N/A", never 0.
pub fn final_grade(
    components: &[EvaluationComponent],
    resolution: &Resolution,
    policy: &GradingPolicy,
) -> ResolvedGrade {
    let mut warnings = resolution.warnings.clone();

    if !resolution.has_data() {
        return graded(None, GradeSource::None, warnings, policy);
    }

    let final_component = policy.final_component_code.as_deref().and_then(|code| {
        components
            .iter()
            .find(|c| c.is_calculated && c.code == code)
    });
    if let Some(fc) = final_component {
        let v = resolution.values.get(&fc.code).copied().unwrap_or(0.0);
        return graded(Some(v), GradeSource::FinalComponent, warnings, policy);
    }

    let weighted: Vec<&EvaluationComponent> = components
        .iter()
        .filter(|c| !c.is_calculated && c.weight_percent > 0.0)
        .collect();
    let weight_total: f64 = weighted.iter().map(|c| c.weight_percent).sum();
    if weight_total <= 0.0 {
        warnings.push(Warning::config(
            "missing_weights",
            None,
            "no component in scope carries a positive weight",
        ));
        return graded(None, GradeSource::None, warnings, policy);
    }
    if (weight_total - 100.0).abs() > 1e-6 {
        warnings.push(Warning::config(
            "weights_not_100",
            None,
            format!("component weights sum to {}", weight_total),
        ));
    }

    let value_of = |c: &EvaluationComponent| resolution.values.get(&c.code).copied().unwrap_or(0.0);

    let final_value = match policy.missing_component_policy {
        MissingComponentPolicy::Zero => Some(
            weighted
                .iter()
                .map(|c| value_of(*c) * c.weight_percent / 100.0)
                .sum::<f64>(),
        ),
        MissingComponentPolicy::Renormalize => {
            let mut sum = 0.0_f64;
            let mut denom = 0.0_f64;
            for c in weighted.iter().filter(|c| resolution.recorded.contains(&c.code)) {
                sum += value_of(*c) * c.weight_percent;
                denom += c.weight_percent;
            }
            if denom > 0.0 {
                Some(sum / denom)
            } else {
                None
            }
        }
    };

    graded(final_value, GradeSource::Weighted, warnings, policy)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAnnual {
    pub subject_id: String,
    pub trimester_finals: Vec<Option<f64>>,
    pub annual_average: Option<f64>,
    pub transita: bool,
}

/// Average of the defined trimester finals; the subject transits at or
/// above the pass mark.
pub fn subject_annual(
    subject_id: &str,
    trimester_finals: &[Option<f64>],
    pass_mark: f64,
) -> SubjectAnnual {
    let defined: Vec<f64> = trimester_finals.iter().filter_map(|v| *v).collect();
    let annual_average = if defined.is_empty() {
        None
    } else {
        Some(round_off_2_decimals(
            defined.iter().sum::<f64>() / (defined.len() as f64),
        ))
    };
    SubjectAnnual {
        subject_id: subject_id.to_string(),
        trimester_finals: trimester_finals.to_vec(),
        annual_average,
        transita: annual_average.map(|v| v >= pass_mark).unwrap_or(false),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAnnual {
    pub subjects: Vec<SubjectAnnual>,
    pub overall_mean: Option<f64>,
    pub promoted: bool,
    pub classification: &'static str,
    pub failing_subjects: Vec<String>,
}

/// Overall promotion needs every subject to transit and the mean of the
/// subject averages to reach the pass mark.
pub fn student_annual(subjects: Vec<SubjectAnnual>, pass_mark: f64) -> StudentAnnual {
    let averages: Vec<f64> = subjects.iter().filter_map(|s| s.annual_average).collect();
    let overall_mean = if averages.is_empty() {
        None
    } else {
        Some(round_off_2_decimals(
            averages.iter().sum::<f64>() / (averages.len() as f64),
        ))
    };
    let failing_subjects: Vec<String> = subjects
        .iter()
        .filter(|s| !s.transita)
        .map(|s| s.subject_id.clone())
        .collect();
    let promoted = !subjects.is_empty()
        && failing_subjects.is_empty()
        && overall_mean.map(|m| m >= pass_mark).unwrap_or(false);
    let classification = match overall_mean {
        None => NOT_AVAILABLE_LABEL,
        Some(_) if promoted => PASS_LABEL,
        Some(_) => FAIL_LABEL,
    };
    StudentAnnual {
        subjects,
        overall_mean,
        promoted,
        classification,
        failing_subjects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::formula::ArithmeticEvaluator;
    use crate::calc::resolver::{resolve_components, RecordedScore};

    fn comp(id: &str, code: &str, weight: f64) -> EvaluationComponent {
        EvaluationComponent {
            id: id.to_string(),
            code: code.to_string(),
            weight_percent: weight,
            is_calculated: false,
            formula_expression: None,
            depends_on: Vec::new(),
        }
    }

    fn scores(pairs: &[(&str, Option<f64>)]) -> Vec<RecordedScore> {
        pairs
            .iter()
            .map(|(id, v)| RecordedScore {
                student_id: "s1".to_string(),
                component_id: id.to_string(),
                value: *v,
            })
            .collect()
    }

    fn mac_npp_npt() -> Vec<EvaluationComponent> {
        vec![
            comp("c1", "MAC", 40.0),
            comp("c2", "NPP", 30.0),
            comp("c3", "NPT", 30.0),
        ]
    }

    fn grade(
        comps: &[EvaluationComponent],
        recorded: &[(&str, Option<f64>)],
        policy: &GradingPolicy,
    ) -> ResolvedGrade {
        let res = resolve_components(comps, &scores(recorded), &ArithmeticEvaluator)
            .expect("resolve");
        final_grade(comps, &res, policy)
    }

    #[test]
    fn weighted_average_matches_hand_computation() {
        let g = grade(
            &mac_npp_npt(),
            &[("c1", Some(14.0)), ("c2", Some(12.0)), ("c3", Some(16.0))],
            &GradingPolicy::default(),
        );
        assert_eq!(g.final_value, Some(14.0));
        assert_eq!(g.classification, PASS_LABEL);
        assert!(g.passed);
        assert_eq!(g.source, GradeSource::Weighted);
        assert!(g.warnings.is_empty());
    }

    #[test]
    fn weighted_average_fixtures() {
        let fixtures: &[([f64; 3], f64)] = &[
            ([10.0, 10.0, 10.0], 10.0),
            ([0.0, 20.0, 20.0], 12.0),
            ([20.0, 0.0, 0.0], 8.0),
            ([7.5, 11.0, 13.0], 10.2),
        ];
        for (vals, expected) in fixtures {
            let g = grade(
                &mac_npp_npt(),
                &[
                    ("c1", Some(vals[0])),
                    ("c2", Some(vals[1])),
                    ("c3", Some(vals[2])),
                ],
                &GradingPolicy::default(),
            );
            let got = g.final_value.expect("defined");
            assert!((got - expected).abs() < 1e-9, "{:?}: {} != {}", vals, got, expected);
        }
    }

    #[test]
    fn no_recorded_scores_is_not_available() {
        let g = grade(
            &mac_npp_npt(),
            &[("c1", None), ("c2", None)],
            &GradingPolicy::default(),
        );
        assert_eq!(g.final_value, None);
        assert_eq!(g.classification, NOT_AVAILABLE_LABEL);
        assert!(!g.passed);
        assert_eq!(g.source, GradeSource::None);
    }

    #[test]
    fn pass_mark_boundary_is_inclusive() {
        assert_eq!(classify(Some(10.0), 10.0), (true, PASS_LABEL));
        assert_eq!(classify(Some(9.99), 10.0), (false, FAIL_LABEL));
        assert_eq!(classify(None, 10.0), (false, NOT_AVAILABLE_LABEL));
    }

    #[test]
    fn missing_component_counts_as_zero_by_default() {
        let g = grade(
            &mac_npp_npt(),
            &[("c1", Some(15.0)), ("c2", Some(15.0))],
            &GradingPolicy::default(),
        );
        assert_eq!(g.final_value, Some(10.5));
        assert!(g.passed);
    }

    #[test]
    fn renormalize_policy_rescales_over_recorded_components() {
        let policy = GradingPolicy {
            missing_component_policy: MissingComponentPolicy::Renormalize,
            ..GradingPolicy::default()
        };
        let g = grade(
            &mac_npp_npt(),
            &[("c1", Some(15.0)), ("c2", Some(8.0))],
            &policy,
        );
        // (15*40 + 8*30) / 70
        assert_eq!(g.final_value, Some(12.0));
    }

    #[test]
    fn final_component_is_used_directly() {
        let mut comps = vec![
            comp("c1", "NF1", 0.0),
            comp("c2", "NF2", 0.0),
            comp("c3", "NF3", 0.0),
        ];
        comps.push(EvaluationComponent {
            id: "c4".to_string(),
            code: "MT".to_string(),
            weight_percent: 0.0,
            is_calculated: true,
            formula_expression: Some("(NF1+NF2+NF3)/3".to_string()),
            depends_on: vec!["c1".into(), "c2".into(), "c3".into()],
        });
        let g = grade(
            &comps,
            &[("c1", Some(12.0)), ("c2", Some(9.0)), ("c3", Some(15.0))],
            &GradingPolicy::default(),
        );
        assert_eq!(g.final_value, Some(12.0));
        assert!(g.passed);
        assert_eq!(g.source, GradeSource::FinalComponent);
    }

    #[test]
    fn zero_weights_without_final_component_warn() {
        let comps = vec![comp("c1", "NF1", 0.0)];
        let g = grade(&comps, &[("c1", Some(12.0))], &GradingPolicy::default());
        assert_eq!(g.final_value, None);
        assert!(g.warnings.iter().any(|w| w.code == "missing_weights"));
    }

    #[test]
    fn weights_not_summing_to_100_warn_but_compute() {
        let comps = vec![comp("c1", "MAC", 40.0), comp("c2", "NPP", 40.0)];
        let g = grade(
            &comps,
            &[("c1", Some(10.0)), ("c2", Some(10.0))],
            &GradingPolicy::default(),
        );
        assert_eq!(g.final_value, Some(8.0));
        assert!(g.warnings.iter().any(|w| w.code == "weights_not_100"));
    }

    #[test]
    fn subject_transits_on_rounded_annual_average() {
        let s = subject_annual("MAT", &[Some(9.5), Some(10.0), Some(11.0)], 10.0);
        assert_eq!(s.annual_average, Some(10.17));
        assert!(s.transita);

        let partial = subject_annual("FIS", &[Some(12.0), None, Some(8.0)], 10.0);
        assert_eq!(partial.annual_average, Some(10.0));
        assert!(partial.transita);

        let none = subject_annual("QUI", &[None, None, None], 10.0);
        assert_eq!(none.annual_average, None);
        assert!(!none.transita);
    }

    #[test]
    fn single_failing_subject_blocks_promotion() {
        let subjects = vec![
            subject_annual("MAT", &[Some(18.0), Some(19.0), Some(20.0)], 10.0),
            subject_annual("POR", &[Some(17.0), Some(18.0), Some(16.0)], 10.0),
            subject_annual("FIS", &[Some(8.0), Some(8.0), Some(8.0)], 10.0),
        ];
        let outcome = student_annual(subjects, 10.0);
        assert!(outcome.overall_mean.expect("mean") >= 10.0);
        assert!(!outcome.promoted);
        assert_eq!(outcome.failing_subjects, vec!["FIS".to_string()]);
        assert_eq!(outcome.classification, FAIL_LABEL);
    }

    #[test]
    fn all_subjects_transiting_promotes() {
        let subjects = vec![
            subject_annual("MAT", &[Some(9.5), Some(10.0), Some(11.0)], 10.0),
            subject_annual("POR", &[Some(12.0), Some(13.0), Some(14.0)], 10.0),
        ];
        let outcome = student_annual(subjects, 10.0);
        assert!(outcome.promoted);
        let mean = outcome.overall_mean.expect("mean");
        assert!((mean - 11.585).abs() < 0.01, "mean {}", mean);
        assert_eq!(outcome.classification, PASS_LABEL);
    }

    #[test]
    fn no_subjects_is_not_available() {
        let outcome = student_annual(Vec::new(), 10.0);
        assert_eq!(outcome.overall_mean, None);
        assert!(!outcome.promoted);
        assert_eq!(outcome.classification, NOT_AVAILABLE_LABEL);
    }
}
