mod test_support;

use serde_json::json;
use test_support::{request, request_err_code, request_ok, send_raw, spawn_sidecar, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("pautasd-router-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health["workspacePath"].is_null());

    // Workspace-backed methods refuse to run before a workspace is selected.
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "2", "students.list", json!({ "classId": "x" })),
        "no_workspace"
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("pautas.sqlite3").exists());

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "name": "Smoke Class" }),
    );
    let class_id = created["classId"].as_str().expect("classId").to_string();

    let methods: Vec<(&str, serde_json::Value)> = vec![
        ("classes.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("subjects.list", json!({ "classId": class_id })),
        ("components.list", json!({ "subjectId": "missing", "trimester": 1 })),
        ("components.checkFormula", json!({ "formula": "(A + B) / 2" })),
        ("scores.get", json!({ "subjectId": "missing", "trimester": 1 })),
        ("calc.annualOutcome", json!({ "classId": class_id })),
        ("calc.evaluateInline", json!({ "components": [] })),
        ("reports.annualModel", json!({ "classId": class_id })),
        ("setup.get", json!({})),
    ];
    for (i, (method, params)) in methods.into_iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("m{}", i), method, params);
        if resp["ok"] == json!(false) {
            assert_ne!(
                resp["error"]["code"],
                json!("not_implemented"),
                "{} is not routed",
                method
            );
        }
    }

    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "5", "marksets.list", json!({})),
        "not_implemented"
    );
}

#[test]
fn malformed_line_gets_bad_json_without_id_and_loop_continues() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let resp = send_raw(&mut stdin, &mut reader, "{not json");
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("bad_json"));
    assert!(resp.get("id").is_none());

    let health = request_ok(&mut stdin, &mut reader, "after", "health", json!({}));
    assert!(health.get("version").is_some());
}

#[test]
fn workspace_from_environment_is_opened_at_start() {
    let workspace = temp_dir("pautasd-env-workspace");
    let path = workspace.to_string_lossy().to_string();
    let (_child, mut stdin, mut reader) =
        test_support::spawn_sidecar_with_env(&[("PAUTASD_WORKSPACE", path.as_str())]);

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["workspacePath"], json!(path));
    let classes = request_ok(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(classes["classes"], json!([]));
}

#[test]
fn class_delete_cascades_to_roster_subjects_and_scores() {
    let workspace = temp_dir("pautasd-class-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = test_support::seed_class(&mut stdin, &mut reader, &workspace);

    let comp = test_support::upsert_component(
        &mut stdin,
        &mut reader,
        "c1",
        json!({
            "subjectId": fx.subject_id,
            "trimester": 1,
            "code": "MAC",
            "weightPercent": 100
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "scores.set",
        json!({ "componentId": comp, "studentId": fx.students[0], "value": 15 }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "l1", "classes.list", json!({}));
    assert_eq!(listed["classes"][0]["studentCount"], json!(2));
    assert_eq!(listed["classes"][0]["subjectCount"], json!(1));

    request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "classes.delete",
        json!({ "classId": fx.class_id }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "l2", "classes.list", json!({}));
    assert_eq!(listed["classes"], json!([]));
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "d2",
            "classes.delete",
            json!({ "classId": fx.class_id })
        ),
        "not_found"
    );
    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "scores.get",
        json!({ "subjectId": fx.subject_id, "trimester": 1 }),
    );
    assert_eq!(scores["scores"], json!([]));
}
