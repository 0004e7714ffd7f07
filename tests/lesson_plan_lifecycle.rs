mod test_support;

use serde_json::{json, Value};
use test_support::{error_code, id_of, seed_school, School, Sidecar};

fn plan_input(school: &School, title: &str, date: &str) -> Value {
    json!({
        "input": {
            "classId": school.class_id,
            "subjectId": school.subject_id,
            "title": title,
            "date": date,
            "objectives": ["Add fractions with unlike denominators"],
            "materials": ["Fraction strips", "Worksheet 4"],
            "activities": [
                { "type": "introduction", "description": "Recap", "durationMinutes": 10 },
                { "type": "practice", "description": "Pairs work", "durationMinutes": 30 }
            ]
        }
    })
}

#[test]
fn draft_complete_review_lifecycle() {
    let mut s = Sidecar::start("schoold-lesson-lifecycle");
    let school = seed_school(&mut s, 0);

    let plan = s.as_user_ok(
        &school.teacher,
        "lessonPlans.create",
        plan_input(&school, "Fractions", "2025-09-10"),
    );
    assert_eq!(plan["status"], "draft");
    assert_eq!(plan["teacherId"], school.teacher.as_str());
    assert_eq!(plan["durationMinutes"].as_i64(), Some(60));
    assert_eq!(plan["activities"][1]["type"], "practice");
    let id = id_of(&plan);

    let edited = s.as_user_ok(
        &school.teacher,
        "lessonPlans.update",
        json!({ "id": id, "patch": { "title": "Fractions II", "homework": "Sheet 5" } }),
    );
    assert_eq!(edited["title"], "Fractions II");
    assert_eq!(edited["homework"], "Sheet 5");

    let completed = s.as_user_ok(&school.teacher, "lessonPlans.complete", json!({ "id": id }));
    assert_eq!(completed["status"], "completed");
    let again = s.as_user_ok(&school.teacher, "lessonPlans.complete", json!({ "id": id }));
    assert_eq!(again["status"], "completed");

    let locked = s.as_user(
        &school.teacher,
        "lessonPlans.update",
        json!({ "id": id, "patch": { "title": "Too late" } }),
    );
    assert_eq!(error_code(&locked), "conflict");

    let denied = s.as_user(&school.teacher, "lessonPlans.review", json!({ "id": id, "feedback": "self" }));
    assert_eq!(error_code(&denied), "forbidden");

    let reviewed = s.as_user_ok(
        &school.head,
        "lessonPlans.review",
        json!({ "id": id, "feedback": "Good pacing" }),
    );
    assert_eq!(reviewed["status"], "reviewed");
    assert_eq!(reviewed["feedback"], "Good pacing");
    assert_eq!(reviewed["reviewedBy"], school.head.as_str());

    let rereviewed = s.as_user_ok(
        &school.admin,
        "lessonPlans.review",
        json!({ "id": id, "feedback": "Share with department" }),
    );
    assert_eq!(rereviewed["feedback"], "Share with department");
    assert_eq!(rereviewed["reviewedBy"], school.admin.as_str());

    let after_review = s.as_user(&school.teacher, "lessonPlans.complete", json!({ "id": id }));
    assert_eq!(error_code(&after_review), "conflict");
}

#[test]
fn plans_require_objectives_and_materials() {
    let mut s = Sidecar::start("schoold-lesson-validation");
    let school = seed_school(&mut s, 1);

    let mut no_objectives = plan_input(&school, "Empty", "2025-09-10");
    no_objectives["input"]["objectives"] = json!([]);
    let resp = s.as_user(&school.teacher, "lessonPlans.create", no_objectives);
    assert_eq!(error_code(&resp), "bad_params");

    let mut bad_duration = plan_input(&school, "Zero", "2025-09-10");
    bad_duration["input"]["durationMinutes"] = json!(0);
    let resp = s.as_user(&school.teacher, "lessonPlans.create", bad_duration);
    assert_eq!(error_code(&resp), "bad_params");

    let mut bad_activity = plan_input(&school, "Odd", "2025-09-10");
    bad_activity["input"]["activities"] = json!([{ "type": "nap", "description": "zzz" }]);
    let resp = s.as_user(&school.teacher, "lessonPlans.create", bad_activity);
    assert_eq!(error_code(&resp), "bad_params");

    let by_student = s.as_user(
        &school.students[0],
        "lessonPlans.create",
        plan_input(&school, "Student plan", "2025-09-10"),
    );
    assert_eq!(error_code(&by_student), "forbidden");
}

#[test]
fn planner_default_duration_comes_from_setup() {
    let mut s = Sidecar::start("schoold-lesson-duration");
    let school = seed_school(&mut s, 0);
    s.as_user_ok(
        &school.head,
        "setup.update",
        json!({ "section": "planner", "patch": { "defaultDurationMinutes": 45 } }),
    );
    let plan = s.as_user_ok(
        &school.teacher,
        "lessonPlans.create",
        plan_input(&school, "Shorter", "2025-09-11"),
    );
    assert_eq!(plan["durationMinutes"].as_i64(), Some(45));
}

#[test]
fn plans_list_by_date_then_title() {
    let mut s = Sidecar::start("schoold-lesson-list");
    let school = seed_school(&mut s, 0);
    for (title, date) in [
        ("Percentages", "2025-09-12"),
        ("Decimals", "2025-09-10"),
        ("Angles", "2025-09-12"),
    ] {
        s.as_user_ok(&school.teacher, "lessonPlans.create", plan_input(&school, title, date));
    }

    let listed = s.as_user_ok(
        &school.head,
        "lessonPlans.list",
        json!({ "filters": { "teacherId": school.teacher } }),
    );
    let titles: Vec<&str> = listed["lessonPlans"]
        .as_array()
        .expect("lessonPlans")
        .iter()
        .filter_map(|p| p["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Decimals", "Angles", "Percentages"]);

    let from = s.as_user_ok(
        &school.teacher,
        "lessonPlans.list",
        json!({ "filters": { "dateFrom": "2025-09-11" } }),
    );
    assert_eq!(from["lessonPlans"].as_array().map(|p| p.len()), Some(2));

    let first = listed["lessonPlans"][0].clone();
    let id = id_of(&first);
    let gone = s.as_user_ok(&school.teacher, "lessonPlans.delete", json!({ "id": id }));
    assert_eq!(gone["deleted"], true);
    let missing = s.as_user(&school.teacher, "lessonPlans.get", json!({ "id": id }));
    assert_eq!(error_code(&missing), "not_found");
}
