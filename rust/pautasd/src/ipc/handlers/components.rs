use crate::calc::formula::{self, is_identifier, ArithmeticEvaluator, FormulaError};
use crate::calc::resolver::resolve_components;
use crate::calc::summary::{load_scope_components, ComponentDef};
use crate::calc::EvaluationComponent;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, parse_trimester, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

fn subject_exists(
    conn: &Connection,
    req: &Request,
    subject_id: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match found {
        Some(_) => Ok(()),
        None => Err(err(&req.id, "not_found", "subject not found", None)),
    }
}

fn formula_error_details(e: &FormulaError) -> serde_json::Value {
    match e {
        FormulaError::Syntax { pos, .. } => json!({ "kind": "syntax", "pos": pos }),
        FormulaError::UnknownVariable(name) => json!({ "kind": "unknownVariable", "name": name }),
        FormulaError::DivisionByZero => json!({ "kind": "divisionByZero" }),
        FormulaError::NonFinite => json!({ "kind": "nonFinite" }),
    }
}

fn handle_components_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if let Err(e) = subject_exists(conn, req, &subject_id) {
        return e;
    }
    match load_scope_components(conn, &subject_id, trimester) {
        Ok(components) => ok(&req.id, json!({ "components": components })),
        Err(e) => calc_err(req, e),
    }
}

/// Validated shape of a `components.upsert` request.
struct ComponentInput {
    id: Option<String>,
    code: String,
    name: String,
    weight_percent: f64,
    is_calculated: bool,
    formula_expression: Option<String>,
    depends_on: Vec<String>,
    sort_order: Option<i64>,
}

fn parse_component_input(req: &Request) -> Result<ComponentInput, serde_json::Value> {
    let id = req
        .params
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let code = required_str(req, "code")?;
    if !is_identifier(&code) {
        return Err(err(
            &req.id,
            "bad_params",
            "code must start with a letter or '_' and contain only letters, digits and '_'",
            Some(json!({ "code": code })),
        ));
    }
    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| code.clone());

    let weight_percent = match req.params.get("weightPercent") {
        None => 0.0,
        Some(v) if v.is_null() => 0.0,
        Some(v) => match v.as_f64() {
            Some(w) if (0.0..=100.0).contains(&w) => w,
            _ => {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "weightPercent must be a number in 0..=100",
                    Some(json!({ "weightPercent": v })),
                ))
            }
        },
    };
    let is_calculated = req
        .params
        .get("isCalculated")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let formula_expression = req
        .params
        .get("formulaExpression")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut depends_on: Vec<String> = Vec::new();
    match req.params.get("dependsOn") {
        None => {}
        Some(v) if v.is_null() => {}
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                let Some(dep) = item.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        "dependsOn must be an array of component ids",
                        None,
                    ));
                };
                if !depends_on.iter().any(|d| d == dep) {
                    depends_on.push(dep.to_string());
                }
            }
        }
        Some(_) => {
            return Err(err(
                &req.id,
                "bad_params",
                "dependsOn must be an array of component ids",
                None,
            ))
        }
    }
    let sort_order = req.params.get("sortOrder").and_then(|v| v.as_i64());

    Ok(ComponentInput {
        id,
        code,
        name,
        weight_percent,
        is_calculated,
        formula_expression,
        depends_on,
        sort_order,
    })
}

/// Checks the candidate against the rest of its scope, including a dry run of
/// the resolver over the scope with the candidate in place.
fn validate_against_scope(
    req: &Request,
    scope: &[ComponentDef],
    component_id: &str,
    input: &ComponentInput,
) -> Result<(), serde_json::Value> {
    let config_error = |message: String, details: serde_json::Value| {
        err(&req.id, "config_error", message, Some(details))
    };

    if let Some(other) = scope
        .iter()
        .find(|d| d.component.id != component_id && d.component.code == input.code)
    {
        return Err(err(
            &req.id,
            "bad_params",
            "component code already exists in this subject and trimester",
            Some(json!({ "code": input.code, "componentId": other.component.id })),
        ));
    }

    if !input.is_calculated {
        if input.formula_expression.is_some() || !input.depends_on.is_empty() {
            return Err(config_error(
                "only calculated components may declare a formula or dependencies".into(),
                json!({ "code": input.code }),
            ));
        }
    } else {
        let Some(formula_src) = input.formula_expression.as_deref() else {
            return Err(config_error(
                "calculated component requires formulaExpression".into(),
                json!({ "code": input.code }),
            ));
        };

        let code_by_id: HashMap<&str, &str> = scope
            .iter()
            .filter(|d| d.component.id != component_id)
            .map(|d| (d.component.id.as_str(), d.component.code.as_str()))
            .collect();
        let mut dep_codes: Vec<&str> = Vec::with_capacity(input.depends_on.len());
        for dep in &input.depends_on {
            if dep == component_id {
                return Err(config_error(
                    "component cannot depend on itself".into(),
                    json!({ "code": input.code }),
                ));
            }
            match code_by_id.get(dep.as_str()) {
                Some(code) => dep_codes.push(*code),
                None => {
                    return Err(config_error(
                        "dependency is not a component of this subject and trimester".into(),
                        json!({ "dependsOn": dep }),
                    ))
                }
            }
        }

        let expr = formula::parse(formula_src).map_err(|e| {
            config_error(
                format!("formula does not parse: {}", e),
                formula_error_details(&e),
            )
        })?;
        let undeclared: Vec<String> = expr
            .identifiers()
            .into_iter()
            .filter(|name| !dep_codes.contains(&name.as_str()))
            .collect();
        if !undeclared.is_empty() {
            return Err(config_error(
                "formula references codes that are not declared dependencies".into(),
                json!({ "identifiers": undeclared }),
            ));
        }
    }

    // Renaming a code would silently break formulas of dependents.
    if let Some(previous) = scope.iter().find(|d| d.component.id == component_id) {
        if previous.component.code != input.code {
            let dependents: Vec<&str> = scope
                .iter()
                .filter(|d| d.component.depends_on.iter().any(|x| x == component_id))
                .map(|d| d.component.code.as_str())
                .collect();
            if !dependents.is_empty() {
                return Err(config_error(
                    "cannot rename a component other components depend on".into(),
                    json!({ "dependents": dependents }),
                ));
            }
        }
    }

    let candidate = EvaluationComponent {
        id: component_id.to_string(),
        code: input.code.clone(),
        weight_percent: input.weight_percent,
        is_calculated: input.is_calculated,
        formula_expression: input.formula_expression.clone(),
        depends_on: input.depends_on.clone(),
    };
    let mut components: Vec<EvaluationComponent> = scope
        .iter()
        .filter(|d| d.component.id != component_id)
        .map(|d| d.component.clone())
        .collect();
    components.push(candidate);

    let resolution = resolve_components(&components, &[], &ArithmeticEvaluator)
        .map_err(|e| calc_err(req, e))?;
    let cycle: Vec<&str> = resolution
        .warnings
        .iter()
        .filter(|w| w.code == "dependency_cycle")
        .filter_map(|w| w.component_code.as_deref())
        .collect();
    if !cycle.is_empty() {
        return Err(config_error(
            "dependencies would form a cycle".into(),
            json!({ "cycle": cycle }),
        ));
    }
    Ok(())
}

fn handle_components_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let input = match parse_component_input(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = subject_exists(conn, req, &subject_id) {
        return e;
    }
    let scope = match load_scope_components(conn, &subject_id, trimester) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let existing = match input.id.as_deref() {
        Some(id) => match scope.iter().find(|d| d.component.id == id) {
            Some(d) => Some(d),
            None => {
                return err(
                    &req.id,
                    "not_found",
                    "component not found in this subject and trimester",
                    Some(json!({ "id": id })),
                )
            }
        },
        None => None,
    };
    let component_id = input
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(e) = validate_against_scope(req, &scope, &component_id, &input) {
        return e;
    }

    let sort_order = input
        .sort_order
        .or_else(|| existing.map(|d| d.sort_order))
        .unwrap_or_else(|| {
            scope
                .iter()
                .map(|d| d.sort_order)
                .max()
                .map(|m| m + 1)
                .unwrap_or(0)
        });
    let is_calculated_i = if input.is_calculated { 1 } else { 0 };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let write = if existing.is_some() {
        tx.execute(
            "UPDATE components
             SET code = ?, name = ?, weight_percent = ?, is_calculated = ?,
                 formula_expression = ?, sort_order = ?
             WHERE id = ?",
            (
                &input.code,
                &input.name,
                input.weight_percent,
                is_calculated_i,
                input.formula_expression.as_deref(),
                sort_order,
                &component_id,
            ),
        )
        .map_err(|e| ("db_update_failed", e))
    } else {
        tx.execute(
            "INSERT INTO components(
               id, subject_id, trimester, code, name, weight_percent,
               is_calculated, formula_expression, sort_order
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &component_id,
                &subject_id,
                trimester,
                &input.code,
                &input.name,
                input.weight_percent,
                is_calculated_i,
                input.formula_expression.as_deref(),
                sort_order,
            ),
        )
        .map_err(|e| ("db_insert_failed", e))
    };
    if let Err((code, e)) = write {
        let _ = tx.rollback();
        return err(
            &req.id,
            code,
            e.to_string(),
            Some(json!({ "table": "components" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM component_deps WHERE component_id = ?",
        [&component_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "component_deps" })),
        );
    }
    for (position, dep) in input.depends_on.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO component_deps(component_id, depends_on_id, position) VALUES(?, ?, ?)",
            (&component_id, dep, position as i64),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "component_deps" })),
            );
        }
    }
    // Calculated values are always recomputed; stale raw scores must not linger.
    if input.is_calculated {
        if let Err(e) = tx.execute("DELETE FROM scores WHERE component_id = ?", [&component_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "scores" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(
        component_id = %component_id,
        code = %input.code,
        created = existing.is_none(),
        "component saved"
    );
    ok(
        &req.id,
        json!({ "componentId": component_id, "created": existing.is_none() }),
    )
}

fn handle_components_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM components WHERE id = ?", [&component_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "component not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT c.code
         FROM component_deps d
         JOIN components c ON c.id = d.component_id
         WHERE d.depends_on_id = ?
         ORDER BY c.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let dependents = match stmt
        .query_map([&component_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !dependents.is_empty() {
        return err(
            &req.id,
            "config_error",
            "component is used by calculated components",
            Some(json!({ "dependents": dependents })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let steps: [(&str, &str); 3] = [
        ("scores", "DELETE FROM scores WHERE component_id = ?1"),
        ("component_deps", "DELETE FROM component_deps WHERE component_id = ?1"),
        ("components", "DELETE FROM components WHERE id = ?1"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&component_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_components_check_formula(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(src) = req.params.get("formula").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing formula", None);
    };
    let available: Option<Vec<String>> = req
        .params
        .get("availableCodes")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });

    let expr = match formula::parse(src) {
        Ok(e) => e,
        Err(e) => {
            return ok(
                &req.id,
                json!({
                    "valid": false,
                    "error": { "message": e.to_string(), "details": formula_error_details(&e) }
                }),
            )
        }
    };
    let identifiers = expr.identifiers();
    let unknown: Vec<&String> = match &available {
        Some(codes) => identifiers.iter().filter(|i| !codes.contains(*i)).collect(),
        None => Vec::new(),
    };

    // Optional sample evaluation with caller-supplied values.
    let sample = req.params.get("values").and_then(|v| v.as_object()).map(|m| {
        let vars: HashMap<String, f64> = m
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect();
        match expr.eval(&vars) {
            Ok(v) => json!({ "value": crate::calc::round_off_2_decimals(v) }),
            Err(e) => json!({ "error": { "message": e.to_string(), "details": formula_error_details(&e) } }),
        }
    });

    ok(
        &req.id,
        json!({
            "valid": unknown.is_empty(),
            "identifiers": identifiers,
            "unknownIdentifiers": unknown,
            "sample": sample
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "components.list" => Some(handle_components_list(state, req)),
        "components.upsert" => Some(handle_components_upsert(state, req)),
        "components.delete" => Some(handle_components_delete(state, req)),
        "components.checkFormula" => Some(handle_components_check_formula(state, req)),
        _ => None,
    }
}
