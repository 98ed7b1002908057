mod test_support;

use serde_json::json;
use test_support::{request_err_code, request_ok, seed_class, spawn_sidecar, temp_dir, upsert_component};

#[test]
fn student_delete_removes_their_scores_only() {
    let workspace = temp_dir("pautasd-student-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    let comp = upsert_component(
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
        "b1",
        "scores.bulkSet",
        json!({
            "entries": [
                { "componentId": comp, "studentId": fx.students[0], "value": 12 },
                { "componentId": comp, "studentId": fx.students[1], "value": 16 }
            ]
        }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "students.delete",
        json!({ "studentId": fx.students[0] }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "students.list",
        json!({ "classId": fx.class_id }),
    );
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["id"], json!(fx.students[1]));

    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "scores.get",
        json!({ "subjectId": fx.subject_id, "trimester": 1 }),
    );
    let scores = scores["scores"].as_array().expect("scores");
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0]["studentId"], json!(fx.students[1]));
    assert_eq!(scores[0]["value"], json!(16.0));
}

#[test]
fn new_students_append_to_roster_order() {
    let workspace = temp_dir("pautasd-student-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({
            "classId": fx.class_id,
            "lastName": "Mendes",
            "firstName": "Carla",
            "status": "inactive"
        }),
    );
    assert_eq!(created["sortOrder"], json!(2));

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "students.list",
        json!({ "classId": fx.class_id, "studentStatus": "all" }),
    );
    let names: Vec<&str> = all["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["lastName"].as_str())
        .collect();
    assert_eq!(names, vec!["Silva", "Costa", "Mendes"]);

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "l2",
        "students.list",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(active["students"].as_array().map(|a| a.len()), Some(2));

    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "s2",
            "students.create",
            json!({ "classId": "missing", "lastName": "X", "firstName": "Y" })
        ),
        "not_found"
    );
}

#[test]
fn subject_delete_cascades_components_and_scores() {
    let workspace = temp_dir("pautasd-subject-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_class(&mut stdin, &mut reader, &workspace);

    for (i, code) in ["NF1", "NF2"].iter().enumerate() {
        upsert_component(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            json!({
                "subjectId": fx.subject_id,
                "trimester": 1,
                "code": code,
                "weightPercent": 0
            }),
        );
    }
    let components = request_ok(
        &mut stdin,
        &mut reader,
        "cl",
        "components.list",
        json!({ "subjectId": fx.subject_id, "trimester": 1 }),
    );
    let ids: Vec<String> = components["components"]
        .as_array()
        .expect("components")
        .iter()
        .filter_map(|c| c["id"].as_str().map(|s| s.to_string()))
        .collect();
    assert_eq!(ids.len(), 2);
    upsert_component(
        &mut stdin,
        &mut reader,
        "mt",
        json!({
            "subjectId": fx.subject_id,
            "trimester": 1,
            "code": "MT",
            "weightPercent": 0,
            "isCalculated": true,
            "formulaExpression": "(NF1 + NF2) / 2",
            "dependsOn": ids
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "scores.set",
        json!({ "componentId": ids[0], "studentId": fx.students[0], "value": 10 }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "subjects.delete",
        json!({ "subjectId": fx.subject_id }),
    );

    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "subjects.list",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(subjects["subjects"], json!([]));
    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "scores.get",
        json!({ "subjectId": fx.subject_id, "trimester": 1 }),
    );
    assert_eq!(scores["scores"], json!([]));

    // The code is free again once the subject is gone.
    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "subjects.create",
        json!({ "classId": fx.class_id, "code": "MAT", "name": "Matematica" }),
    );
}
