mod test_support;

use serde_json::json;
use test_support::{error_code, id_of, seed_school, Sidecar};

#[test]
fn only_one_current_year_and_term_per_year() {
    let mut s = Sidecar::start("schoold-calendar-current");
    let school = seed_school(&mut s, 0);

    let y1 = s.as_user_ok(
        &school.head,
        "academicYears.create",
        json!({ "input": { "name": "2024/25", "startDate": "2024-09-01", "endDate": "2025-07-20", "isCurrent": true } }),
    );
    let y2 = s.as_user_ok(
        &school.head,
        "academicYears.create",
        json!({ "input": { "name": "2025/26", "startDate": "2025-09-01", "endDate": "2026-07-20", "isCurrent": true } }),
    );
    let current = s.as_user_ok(
        &school.teacher,
        "academicYears.list",
        json!({ "filters": { "isCurrent": true } }),
    );
    let years = current["academicYears"].as_array().expect("years");
    assert_eq!(years.len(), 1);
    assert_eq!(years[0]["id"], y2["id"]);

    let y2_id = id_of(&y2);
    let outside = s.as_user(
        &school.head,
        "terms.create",
        json!({ "input": { "academicYearId": y2_id, "name": "Early", "startDate": "2025-08-01", "endDate": "2025-10-01" } }),
    );
    assert_eq!(error_code(&outside), "bad_params");

    let backwards = s.as_user(
        &school.head,
        "academicYears.create",
        json!({ "input": { "name": "Bad", "startDate": "2026-09-01", "endDate": "2026-01-01" } }),
    );
    assert_eq!(error_code(&backwards), "bad_params");

    for (name, start, end) in [
        ("Autumn", "2025-09-01", "2025-12-19"),
        ("Spring", "2026-01-05", "2026-03-27"),
    ] {
        s.as_user_ok(
            &school.head,
            "terms.create",
            json!({ "input": { "academicYearId": y2_id, "name": name, "startDate": start, "endDate": end, "isCurrent": true } }),
        );
    }
    // A current term in another year stays current.
    s.as_user_ok(
        &school.head,
        "terms.create",
        json!({ "input": { "academicYearId": id_of(&y1), "name": "Summer", "startDate": "2025-04-20", "endDate": "2025-07-20", "isCurrent": true } }),
    );

    let terms = s.as_user_ok(
        &school.teacher,
        "terms.list",
        json!({ "filters": { "isCurrent": true } }),
    );
    let mut names: Vec<&str> = terms["terms"]
        .as_array()
        .expect("terms")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Spring", "Summer"]);

    let by_teacher = s.as_user(
        &school.teacher,
        "academicYears.delete",
        json!({ "id": y2_id }),
    );
    assert_eq!(error_code(&by_teacher), "forbidden");
}

#[test]
fn class_counts_and_delete_without_cascade() {
    let mut s = Sidecar::start("schoold-classes");
    let school = seed_school(&mut s, 2);
    s.as_user_ok(
        &school.head,
        "classes.create",
        json!({ "input": { "name": "8B", "gradeLevel": "8", "classTeacherId": school.teacher, "capacity": 28 } }),
    );
    let bad_capacity = s.as_user(
        &school.head,
        "classes.create",
        json!({ "input": { "name": "9C", "capacity": 0 } }),
    );
    assert_eq!(error_code(&bad_capacity), "bad_params");

    let listed = s.as_user_ok(&school.teacher, "classes.list", json!({}));
    let rows = listed["classes"].as_array().expect("classes");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "7A");
    assert_eq!(rows[0]["studentCount"].as_u64(), Some(2));
    assert_eq!(rows[1]["studentCount"].as_u64(), Some(0));

    let removed = s.as_user_ok(&school.head, "classes.delete", json!({ "id": school.class_id }));
    assert_eq!(removed["deleted"], true);
    let student = s.as_user_ok(&school.head, "users.get", json!({ "id": school.students[0] }));
    assert_eq!(student["classId"], school.class_id.as_str());

    let gone = s.as_user(&school.head, "classes.students", json!({ "id": school.class_id }));
    assert_eq!(error_code(&gone), "not_found");
}

#[test]
fn assignments_filter_by_due_date_and_name_grades() {
    let mut s = Sidecar::start("schoold-assignments");
    let school = seed_school(&mut s, 1);

    let mut ids = Vec::new();
    for (title, due) in [
        ("Worksheet", "2025-09-15"),
        ("Project", "2025-10-01"),
        ("Quiz", "2025-09-22"),
    ] {
        let a = s.as_user_ok(
            &school.teacher,
            "assignments.create",
            json!({
                "input": {
                    "title": title,
                    "subjectId": school.subject_id,
                    "classId": school.class_id,
                    "dueDate": due,
                    "totalMarks": 40
                }
            }),
        );
        assert_eq!(a["teacherId"], school.teacher.as_str());
        ids.push(id_of(&a));
    }

    let all = s.as_user_ok(&school.students[0], "assignments.list", json!({}));
    let titles: Vec<&str> = all["assignments"]
        .as_array()
        .expect("assignments")
        .iter()
        .filter_map(|a| a["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Worksheet", "Quiz", "Project"]);

    let window = s.as_user_ok(
        &school.teacher,
        "assignments.list",
        json!({ "filters": { "dueAfter": "2025-09-15", "dueBefore": "2025-10-01" } }),
    );
    let titles: Vec<&str> = window["assignments"]
        .as_array()
        .expect("assignments")
        .iter()
        .filter_map(|a| a["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Quiz"]);

    let zero = s.as_user(
        &school.teacher,
        "assignments.update",
        json!({ "id": ids[0], "patch": { "totalMarks": 0 } }),
    );
    assert_eq!(error_code(&zero), "bad_params");

    let grade = s.as_user_ok(
        &school.teacher,
        "grades.create",
        json!({
            "input": {
                "studentId": school.students[0],
                "subjectId": school.subject_id,
                "assignmentId": ids[1],
                "marksObtained": 30,
                "totalMarks": 40
            }
        }),
    );
    assert_eq!(grade["assignmentName"], "Project");
    assert_eq!(grade["gradePercentage"].as_f64(), Some(75.0));

    let other_teacher = s.call_ok(
        "users.register",
        json!({ "input": { "email": "ola@school.test", "displayName": "Ola", "role": "teacher" } }),
    );
    let denied = s.as_user(
        &id_of(&other_teacher),
        "assignments.delete",
        json!({ "id": ids[0] }),
    );
    assert_eq!(error_code(&denied), "forbidden");
    let by_head = s.as_user_ok(&school.head, "assignments.delete", json!({ "id": ids[0] }));
    assert_eq!(by_head["deleted"], true);
}
