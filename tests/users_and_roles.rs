mod test_support;

use serde_json::json;
use test_support::{error_code, id_of, register, seed_school, spawn_sidecar, request, Sidecar};

#[test]
fn first_admin_bootstraps_then_admin_roles_need_a_session() {
    let mut s = Sidecar::start("schoold-users-bootstrap");
    let admin = register(&mut s, None, "Ada@School.Test", "Ada Admin", "admin", json!({}));
    let profile = s.as_user_ok(&admin, "users.get", json!({ "id": admin }));
    assert_eq!(profile["email"], "ada@school.test");
    assert_eq!(profile["role"], "admin");

    let second_admin = s.call(
        "users.register",
        json!({ "input": { "email": "eve@school.test", "displayName": "Eve", "role": "admin" } }),
    );
    assert_eq!(error_code(&second_admin), "forbidden");

    let teacher = register(&mut s, None, "tom@school.test", "Tom", "teacher", json!({}));
    let head_by_teacher = s.call(
        "users.register",
        json!({
            "input": { "email": "hal@school.test", "displayName": "Hal", "role": "headteacher" },
            "session": { "userId": teacher }
        }),
    );
    assert_eq!(error_code(&head_by_teacher), "forbidden");

    let head = register(&mut s, Some(&admin), "hal@school.test", "Hal", "headteacher", json!({}));
    assert!(!head.is_empty());
}

#[test]
fn register_rejects_duplicate_and_malformed_emails() {
    let mut s = Sidecar::start("schoold-users-email");
    let school = seed_school(&mut s, 0);

    let dup = s.call(
        "users.register",
        json!({ "input": { "email": "TEACHER@school.test", "displayName": "Copy", "role": "teacher" } }),
    );
    assert_eq!(error_code(&dup), "conflict");
    assert_eq!(dup["error"]["message"], "email already in use");

    for email in ["no-at-sign", "a@localhost", "@school.test"] {
        let bad = s.call(
            "users.register",
            json!({ "input": { "email": email, "displayName": "X", "role": "student" } }),
        );
        assert_eq!(error_code(&bad), "bad_params", "{}", email);
    }

    let bad_role = s.call(
        "users.register",
        json!({ "input": { "email": "z@school.test", "displayName": "Z", "role": "janitor" } }),
    );
    assert_eq!(error_code(&bad_role), "bad_params");

    let taken = s.as_user(
        &school.teacher,
        "users.update",
        json!({ "id": school.teacher, "patch": { "email": "head@school.test" } }),
    );
    assert_eq!(error_code(&taken), "conflict");
}

#[test]
fn student_fields_only_stick_to_students() {
    let mut s = Sidecar::start("schoold-users-student-fields");
    let school = seed_school(&mut s, 1);

    let teacher = s.call_ok(
        "users.register",
        json!({
            "input": {
                "email": "nia@school.test",
                "displayName": "Nia",
                "role": "teacher",
                "classId": school.class_id,
                "parentName": "Should vanish"
            }
        }),
    );
    assert!(teacher.get("classId").is_none());
    assert!(teacher.get("parentName").is_none());

    let missing_class = s.call(
        "users.register",
        json!({
            "input": {
                "email": "kid@school.test",
                "displayName": "Kid",
                "role": "student",
                "classId": "no-such-class"
            }
        }),
    );
    assert_eq!(error_code(&missing_class), "not_found");

    let roster = s.as_user_ok(&school.teacher, "classes.students", json!({ "id": school.class_id }));
    assert_eq!(roster["students"].as_array().map(|r| r.len()), Some(1));

    let students = s.as_user_ok(
        &school.teacher,
        "users.list",
        json!({ "filters": { "role": "student", "classId": school.class_id } }),
    );
    assert_eq!(students["users"].as_array().map(|u| u.len()), Some(1));
}

#[test]
fn sessions_gate_every_write() {
    let mut s = Sidecar::start("schoold-users-sessions");
    let school = seed_school(&mut s, 2);
    let (a, b) = (school.students[0].clone(), school.students[1].clone());

    let anonymous = s.call("grades.list", json!({}));
    assert_eq!(error_code(&anonymous), "forbidden");
    let ghost = s.as_user("no-such-user", "grades.list", json!({}));
    assert_eq!(error_code(&ghost), "forbidden");

    let renamed = s.as_user_ok(&a, "users.update", json!({ "id": a, "patch": { "displayName": "Alex" } }));
    assert_eq!(renamed["displayName"], "Alex");
    let other = s.as_user(&a, "users.update", json!({ "id": b, "patch": { "displayName": "Nope" } }));
    assert_eq!(error_code(&other), "forbidden");
    let promote = s.as_user(&a, "users.update", json!({ "id": a, "patch": { "role": "admin" } }));
    assert_eq!(error_code(&promote), "forbidden");
    let unknown_field = s.as_user(&a, "users.update", json!({ "id": a, "patch": { "id": "x" } }));
    assert_eq!(error_code(&unknown_field), "bad_params");

    let class = s.as_user(&school.teacher, "classes.create", json!({ "input": { "name": "8B" } }));
    assert_eq!(error_code(&class), "forbidden");
    let subject = s.as_user(
        &school.teacher,
        "subjects.create",
        json!({ "input": { "name": "Art", "code": "ART" } }),
    );
    assert_eq!(error_code(&subject), "forbidden");

    let delete_other = s.as_user(&school.teacher, "users.delete", json!({ "id": b }));
    assert_eq!(error_code(&delete_other), "forbidden");
    let delete_self = s.as_user_ok(&b, "users.delete", json!({ "id": b }));
    assert_eq!(delete_self["deleted"], true);
}

#[test]
fn subjects_track_assigned_teachers() {
    let mut s = Sidecar::start("schoold-subjects");
    let school = seed_school(&mut s, 1);

    let dup = s.as_user(
        &school.head,
        "subjects.create",
        json!({ "input": { "name": "Maths again", "code": "MATH" } }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let science = s.as_user_ok(
        &school.head,
        "subjects.create",
        json!({ "input": { "name": "Science", "code": "SCI" } }),
    );
    let science_id = id_of(&science);
    for _ in 0..2 {
        let assigned = s.as_user_ok(
            &school.head,
            "subjects.assignTeacher",
            json!({ "id": science_id, "teacherId": school.teacher }),
        );
        assert_eq!(assigned["teachersAssigned"], json!([school.teacher]));
    }
    let not_teacher = s.as_user(
        &school.head,
        "subjects.assignTeacher",
        json!({ "id": science_id, "teacherId": school.students[0] }),
    );
    assert_eq!(error_code(&not_teacher), "bad_params");

    let taught = s.as_user_ok(
        &school.teacher,
        "subjects.list",
        json!({ "filters": { "teacherId": school.teacher } }),
    );
    let names: Vec<&str> = taught["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|x| x["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Science"]);

    let unassigned = s.as_user_ok(
        &school.head,
        "subjects.unassignTeacher",
        json!({ "id": science_id, "teacherId": school.teacher }),
    );
    assert_eq!(unassigned["teachersAssigned"], json!([]));
}

#[test]
fn requests_without_workspace_are_refused() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "grades.list", json!({}));
    assert_eq!(error_code(&resp), "no_workspace");
    let health = request(&mut stdin, &mut reader, "2", "health", json!({}));
    assert_eq!(health["ok"], true);
    assert!(health["result"]["workspacePath"].is_null());
    let _ = child.kill();
    let _ = child.wait();
}
