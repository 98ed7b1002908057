use super::formula::FormulaEvaluator;
use super::{round_off_2_decimals, CalcError, Warning};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationComponent {
    pub id: String,
    pub code: String,
    pub weight_percent: f64,
    #[serde(default)]
    pub is_calculated: bool,
    #[serde(default)]
    pub formula_expression: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedScore {
    pub student_id: String,
    pub component_id: String,
    pub value: Option<f64>,
}

/// Effective component values for one student in one (subject, trimester) scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub values: BTreeMap<String, f64>,
    /// Codes of non-calculated components that had a recorded value.
    pub recorded: BTreeSet<String>,
    pub warnings: Vec<Warning>,
}

impl Resolution {
    pub fn has_data(&self) -> bool {
        !self.recorded.is_empty()
    }
}

/// Tarjan's strongly connected components over calculated components, walked
/// with an explicit stack. Components are emitted dependencies first.
struct SccWalk<'a> {
    edges: HashMap<&'a str, Vec<&'a str>>,
    index: HashMap<&'a str, usize>,
    low: HashMap<&'a str, usize>,
    on_stack: HashSet<&'a str>,
    stack: Vec<&'a str>,
    next_index: usize,
    order: Vec<&'a str>,
    cyclic: HashSet<&'a str>,
}

impl<'a> SccWalk<'a> {
    // Plain components are leaves and never get an edge.
    fn new(
        components: &'a [EvaluationComponent],
        by_id: &HashMap<&'a str, &'a EvaluationComponent>,
    ) -> Self {
        let mut edges: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        for c in components.iter().filter(|c| c.is_calculated) {
            let deps = c
                .depends_on
                .iter()
                .filter_map(|d| by_id.get(d.as_str()).copied())
                .filter(|d| d.is_calculated)
                .map(|d| d.id.as_str())
                .collect();
            edges.insert(c.id.as_str(), deps);
        }
        Self {
            edges,
            index: HashMap::new(),
            low: HashMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            next_index: 0,
            order: Vec::new(),
            cyclic: HashSet::new(),
        }
    }

    fn low_of(&self, id: &str) -> usize {
        self.low.get(id).copied().unwrap_or(0)
    }

    fn lower(&mut self, id: &'a str, candidate: usize) {
        if candidate < self.low_of(id) {
            self.low.insert(id, candidate);
        }
    }

    fn open(&mut self, id: &'a str) {
        self.index.insert(id, self.next_index);
        self.low.insert(id, self.next_index);
        self.next_index += 1;
        self.stack.push(id);
        self.on_stack.insert(id);
    }

    fn close_component(&mut self, root: &'a str) {
        let mut members: Vec<&'a str> = Vec::new();
        while let Some(m) = self.stack.pop() {
            self.on_stack.remove(m);
            members.push(m);
            if m == root {
                break;
            }
        }
        let self_loop = self.edges.get(root).is_some_and(|deps| deps.contains(&root));
        if members.len() > 1 || self_loop {
            self.cyclic.extend(members.iter().copied());
        }
        self.order.extend(members);
    }

    fn walk(&mut self, start: &'a str) {
        if self.index.contains_key(start) {
            return;
        }
        self.open(start);
        let mut work: Vec<(&'a str, usize)> = vec![(start, 0)];
        while let Some(frame) = work.last_mut() {
            let (id, pos) = *frame;
            let next = self.edges.get(id).and_then(|deps| deps.get(pos)).copied();
            match next {
                Some(dep) => {
                    frame.1 += 1;
                    match self.index.get(dep).copied() {
                        None => {
                            self.open(dep);
                            work.push((dep, 0));
                        }
                        Some(dep_index) if self.on_stack.contains(dep) => self.lower(id, dep_index),
                        Some(_) => {}
                    }
                }
                None => {
                    work.pop();
                    let low = self.low_of(id);
                    if let Some(&(parent, _)) = work.last() {
                        self.lower(parent, low);
                    }
                    if self.index.get(id).copied() == Some(low) {
                        self.close_component(id);
                    }
                }
            }
        }
    }
}

/// Resolves every component in scope to a number.
///
/// Plain components take their recorded value (0 when absent). Calculated
/// components are evaluated in dependency order with their `dependsOn`
/// values bound by code. Configuration and evaluation problems fall back to
/// 0 for the affected component and are returned as warnings; only a
/// malformed scope (duplicate ids or codes) is a hard error.
pub fn resolve_components(
    components: &[EvaluationComponent],
    scores: &[RecordedScore],
    evaluator: &dyn FormulaEvaluator,
) -> Result<Resolution, CalcError> {
    let mut by_id: HashMap<&str, &EvaluationComponent> = HashMap::new();
    let mut codes: HashSet<&str> = HashSet::new();
    for c in components {
        if by_id.insert(c.id.as_str(), c).is_some() {
            return Err(CalcError::new("bad_params", "duplicate component id in scope")
                .with_details(json!({ "componentId": c.id })));
        }
        if !codes.insert(c.code.as_str()) {
            return Err(CalcError::new("bad_params", "duplicate component code in scope")
                .with_details(json!({ "code": c.code })));
        }
    }

    let mut recorded_by_id: HashMap<&str, f64> = HashMap::new();
    for s in scores {
        if !by_id.contains_key(s.component_id.as_str()) {
            continue;
        }
        if let Some(v) = s.value {
            recorded_by_id.insert(s.component_id.as_str(), v);
        }
    }

    let mut warnings: Vec<Warning> = Vec::new();
    let mut value_by_id: HashMap<&str, f64> = HashMap::new();
    let mut recorded: BTreeSet<String> = BTreeSet::new();

    for c in components.iter().filter(|c| !c.is_calculated) {
        match recorded_by_id.get(c.id.as_str()) {
            Some(v) => {
                recorded.insert(c.code.clone());
                value_by_id.insert(c.id.as_str(), *v);
            }
            None => {
                value_by_id.insert(c.id.as_str(), 0.0);
            }
        }
    }

    for c in components.iter().filter(|c| c.is_calculated) {
        for dep in &c.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                warnings.push(Warning::config(
                    "unknown_dependency",
                    Some(c.code.as_str()),
                    format!("dependency {} is not a component of this scope", dep),
                ));
            }
        }
    }

    let mut graph = SccWalk::new(components, &by_id);
    for c in components.iter().filter(|c| c.is_calculated) {
        graph.walk(c.id.as_str());
    }

    for &id in &graph.order {
        let Some(c) = by_id.get(id).copied() else {
            continue;
        };
        if graph.cyclic.contains(id) {
            warnings.push(Warning::config(
                "dependency_cycle",
                Some(c.code.as_str()),
                "component is part of a dependency cycle",
            ));
            value_by_id.insert(id, 0.0);
            continue;
        }
        let Some(formula) = c
            .formula_expression
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
        else {
            warnings.push(Warning::config(
                "missing_formula",
                Some(c.code.as_str()),
                "calculated component has no formula",
            ));
            value_by_id.insert(id, 0.0);
            continue;
        };

        let mut vars: HashMap<String, f64> = HashMap::new();
        for dep in &c.depends_on {
            if let Some(dep_comp) = by_id.get(dep.as_str()) {
                let v = value_by_id.get(dep.as_str()).copied().unwrap_or(0.0);
                vars.insert(dep_comp.code.clone(), v);
            }
        }

        let value = match evaluator.evaluate(formula, &vars) {
            Ok(v) => round_off_2_decimals(v),
            Err(e) => {
                warn!(component = %c.code, formula, error = %e, "formula evaluation failed; using 0");
                warnings.push(Warning::evaluation(
                    "formula_failed",
                    &c.code,
                    e.to_string(),
                ));
                0.0
            }
        };
        value_by_id.insert(id, value);
    }

    let values: BTreeMap<String, f64> = components
        .iter()
        .map(|c| {
            (
                c.code.clone(),
                value_by_id.get(c.id.as_str()).copied().unwrap_or(0.0),
            )
        })
        .collect();

    Ok(Resolution {
        values,
        recorded,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::formula::ArithmeticEvaluator;
    use crate::calc::WarningKind;

    fn plain(id: &str, code: &str, weight: f64) -> EvaluationComponent {
        EvaluationComponent {
            id: id.to_string(),
            code: code.to_string(),
            weight_percent: weight,
            is_calculated: false,
            formula_expression: None,
            depends_on: Vec::new(),
        }
    }

    fn calculated(id: &str, code: &str, formula: &str, deps: &[&str]) -> EvaluationComponent {
        EvaluationComponent {
            id: id.to_string(),
            code: code.to_string(),
            weight_percent: 0.0,
            is_calculated: true,
            formula_expression: Some(formula.to_string()),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn score(component_id: &str, value: Option<f64>) -> RecordedScore {
        RecordedScore {
            student_id: "s1".to_string(),
            component_id: component_id.to_string(),
            value,
        }
    }

    #[test]
    fn trimester_mean_resolves_to_twelve() {
        let comps = vec![
            plain("c1", "NF1", 0.0),
            plain("c2", "NF2", 0.0),
            plain("c3", "NF3", 0.0),
            calculated("c4", "MT", "(NF1+NF2+NF3)/3", &["c1", "c2", "c3"]),
        ];
        let scores = vec![
            score("c1", Some(12.0)),
            score("c2", Some(9.0)),
            score("c3", Some(15.0)),
        ];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("MT"), Some(&12.0));
        assert_eq!(res.recorded.len(), 3);
        assert!(res.warnings.is_empty());
    }

    #[test]
    fn missing_plain_scores_resolve_to_zero() {
        let comps = vec![
            plain("c1", "MAC", 40.0),
            plain("c2", "NPP", 30.0),
            calculated("c3", "MT", "(MAC+NPP)/2", &["c1", "c2"]),
        ];
        let scores = vec![score("c1", Some(14.0)), score("c2", None)];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("NPP"), Some(&0.0));
        assert_eq!(res.values.get("MT"), Some(&7.0));
        assert_eq!(
            res.recorded.iter().cloned().collect::<Vec<_>>(),
            vec!["MAC".to_string()]
        );
    }

    #[test]
    fn calculated_chain_evaluates_in_dependency_order() {
        // Declared out of order: MF depends on MT which depends on plain scores.
        let comps = vec![
            calculated("c5", "MF", "MT * 2", &["c4"]),
            calculated("c4", "MT", "(NF1 + NF2) / 2", &["c1", "c2"]),
            plain("c1", "NF1", 0.0),
            plain("c2", "NF2", 0.0),
        ];
        let scores = vec![score("c1", Some(11.0)), score("c2", Some(12.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("MT"), Some(&11.5));
        assert_eq!(res.values.get("MF"), Some(&23.0));
    }

    #[test]
    fn cycle_is_reported_and_terminates() {
        let comps = vec![
            plain("c1", "NF1", 0.0),
            calculated("a", "A", "B + NF1", &["b", "c1"]),
            calculated("b", "B", "A + 1", &["a"]),
            calculated("c", "C", "A + NF1", &["a", "c1"]),
        ];
        let scores = vec![score("c1", Some(5.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("A"), Some(&0.0));
        assert_eq!(res.values.get("B"), Some(&0.0));
        // Depends on the cycle but is not part of it.
        assert_eq!(res.values.get("C"), Some(&5.0));
        let cyclic: Vec<_> = res
            .warnings
            .iter()
            .filter(|w| w.code == "dependency_cycle")
            .filter_map(|w| w.component_code.clone())
            .collect();
        assert_eq!(cyclic.len(), 2);
        assert!(cyclic.contains(&"A".to_string()));
        assert!(cyclic.contains(&"B".to_string()));
        assert!(res.warnings.iter().all(|w| w.kind == WarningKind::Config));
    }

    #[test]
    fn cycle_member_reached_through_finished_node_is_flagged() {
        // E sits on A -> E -> B -> A, but the walk reaches B from A first.
        let comps = vec![
            plain("n", "NF1", 0.0),
            calculated("a", "A", "B + E", &["b", "e"]),
            calculated("b", "B", "A + 1", &["a"]),
            calculated("e", "E", "B + NF1", &["b", "n"]),
            calculated("d", "D", "E + NF1", &["e", "n"]),
        ];
        let scores = vec![score("n", Some(7.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("A"), Some(&0.0));
        assert_eq!(res.values.get("B"), Some(&0.0));
        assert_eq!(res.values.get("E"), Some(&0.0));
        assert_eq!(res.values.get("D"), Some(&7.0));
        let mut cyclic: Vec<_> = res
            .warnings
            .iter()
            .filter(|w| w.code == "dependency_cycle")
            .filter_map(|w| w.component_code.clone())
            .collect();
        cyclic.sort();
        assert_eq!(cyclic, vec!["A", "B", "E"]);
    }

    #[test]
    fn long_calculated_chain_resolves_without_recursion() {
        let n = 5_000;
        let mut comps = vec![plain("n", "NF1", 0.0)];
        comps.push(calculated("k0", "C0", "NF1 + 1", &["n"]));
        for i in 1..n {
            let prev = format!("k{}", i - 1);
            comps.push(calculated(
                &format!("k{}", i),
                &format!("C{}", i),
                &format!("C{} + 1", i - 1),
                &[prev.as_str()],
            ));
        }
        // Deepest first, so the walk starts at the far end of the chain.
        comps[1..].reverse();
        let scores = vec![score("n", Some(1.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert!(res.warnings.is_empty());
        assert_eq!(res.values.get(&format!("C{}", n - 1)), Some(&(n as f64 + 1.0)));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let comps = vec![calculated("a", "A", "A + 1", &["a"])];
        let res = resolve_components(&comps, &[], &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("A"), Some(&0.0));
        assert_eq!(res.warnings.len(), 1);
        assert_eq!(res.warnings[0].code, "dependency_cycle");
    }

    #[test]
    fn evaluation_failure_does_not_affect_siblings() {
        let comps = vec![
            plain("c1", "NF1", 0.0),
            plain("c2", "NF2", 0.0),
            calculated("x", "BAD", "NF1 / NF2", &["c1", "c2"]),
            calculated("y", "GOOD", "NF1 + 1", &["c1"]),
            calculated("z", "TYPO", "NF1 + NF9", &["c1"]),
        ];
        let scores = vec![score("c1", Some(8.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("BAD"), Some(&0.0));
        assert_eq!(res.values.get("TYPO"), Some(&0.0));
        assert_eq!(res.values.get("GOOD"), Some(&9.0));
        let failed: Vec<_> = res
            .warnings
            .iter()
            .filter(|w| w.kind == WarningKind::Evaluation)
            .filter_map(|w| w.component_code.as_deref())
            .collect();
        assert_eq!(failed, vec!["BAD", "TYPO"]);
    }

    #[test]
    fn unknown_dependency_and_missing_formula_are_config_warnings() {
        let mut no_formula = calculated("m", "M", "", &[]);
        no_formula.formula_expression = None;
        let comps = vec![
            plain("c1", "NF1", 0.0),
            calculated("x", "X", "NF1 * 2", &["c1", "ghost"]),
            no_formula,
        ];
        let scores = vec![score("c1", Some(3.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("X"), Some(&6.0));
        assert_eq!(res.values.get("M"), Some(&0.0));
        let codes: Vec<_> = res.warnings.iter().map(|w| w.code.as_str()).collect();
        assert!(codes.contains(&"unknown_dependency"));
        assert!(codes.contains(&"missing_formula"));
    }

    #[test]
    fn computed_values_round_to_two_decimals() {
        let comps = vec![
            plain("c1", "NF1", 0.0),
            calculated("x", "X", "NF1 / 3", &["c1"]),
        ];
        let scores = vec![score("c1", Some(10.0))];
        let res = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(res.values.get("X"), Some(&3.33));
    }

    #[test]
    fn resolution_is_idempotent() {
        let comps = vec![
            plain("c1", "NF1", 0.0),
            plain("c2", "NF2", 0.0),
            calculated("x", "MT", "(NF1+NF2)/2", &["c1", "c2"]),
            calculated("y", "Y", "MT / 0", &["x"]),
        ];
        let scores = vec![score("c1", Some(13.0)), score("c2", Some(14.5))];
        let a = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        let b = resolve_components(&comps, &scores, &ArithmeticEvaluator).expect("resolve");
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_codes_are_a_hard_error() {
        let comps = vec![plain("c1", "MAC", 50.0), plain("c2", "MAC", 50.0)];
        let err = resolve_components(&comps, &[], &ArithmeticEvaluator).unwrap_err();
        assert_eq!(err.code, "bad_params");
    }
}
