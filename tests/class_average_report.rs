mod test_support;

use serde_json::json;
use test_support::{id_of, seed_school, Sidecar};

fn approved_grade(s: &mut Sidecar, teacher: &str, head: &str, student: &str, subject: &str, marks: f64) {
    let grade = s.as_user_ok(
        teacher,
        "grades.create",
        json!({
            "input": {
                "studentId": student,
                "subjectId": subject,
                "assignmentName": "Unit test",
                "marksObtained": marks,
                "totalMarks": 100
            }
        }),
    );
    s.as_user_ok(head, "grades.approve", json!({ "id": id_of(&grade) }));
}

#[test]
fn class_average_is_mean_of_student_means() {
    let mut s = Sidecar::start("schoold-class-average");
    let school = seed_school(&mut s, 3);
    let (a, b) = (school.students[0].clone(), school.students[1].clone());

    approved_grade(&mut s, &school.teacher, &school.head, &a, &school.subject_id, 100.0);
    approved_grade(&mut s, &school.teacher, &school.head, &a, &school.subject_id, 0.0);
    approved_grade(&mut s, &school.teacher, &school.head, &b, &school.subject_id, 60.0);

    // Pending grades stay out of every report.
    s.as_user_ok(
        &school.teacher,
        "grades.create",
        json!({
            "input": {
                "studentId": school.students[2],
                "subjectId": school.subject_id,
                "assignmentName": "Unreviewed",
                "marksObtained": 10,
                "totalMarks": 100
            }
        }),
    );

    let model = s.as_user_ok(
        &school.head,
        "reports.model",
        json!({ "kind": "classPerformance", "classId": school.class_id }),
    );
    let rows = model["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["className"], "7A");
    assert_eq!(rows[0]["averageGrade"].as_f64(), Some(55.0));
    assert_eq!(rows[0]["totalStudents"].as_u64(), Some(3));
    assert_eq!(rows[0]["gradedStudents"].as_u64(), Some(2));

    // The subject report averages grades directly.
    let subject = s.as_user_ok(
        &school.head,
        "reports.model",
        json!({ "kind": "subjectPerformance", "subjectId": school.subject_id }),
    );
    let rows = subject["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["subjectName"], "Mathematics");
    assert_eq!(rows[0]["averagePercentage"].as_f64(), Some(53.33));
    assert_eq!(rows[0]["gradeCount"].as_u64(), Some(3));

    let overview = s.as_user_ok(
        &school.head,
        "reports.model",
        json!({ "kind": "teacherOverview", "teacherId": school.teacher }),
    );
    let rows = overview["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["teacherName"], "Tia Teacher");
    assert_eq!(rows[0]["totalStudentsGraded"].as_u64(), Some(2));
    assert_eq!(rows[0]["gradeCount"].as_u64(), Some(3));
}

#[test]
fn empty_class_averages_to_zero() {
    let mut s = Sidecar::start("schoold-class-average-empty");
    let school = seed_school(&mut s, 0);
    let model = s.as_user_ok(
        &school.head,
        "reports.model",
        json!({ "kind": "classPerformance", "classId": school.class_id }),
    );
    let rows = model["rows"].as_array().expect("rows");
    assert_eq!(rows[0]["averageGrade"].as_f64(), Some(0.0));
    assert_eq!(rows[0]["totalStudents"].as_u64(), Some(0));
}

#[test]
fn term_filter_narrows_report_grades() {
    let mut s = Sidecar::start("schoold-class-average-term");
    let school = seed_school(&mut s, 1);
    let year = s.as_user_ok(
        &school.head,
        "academicYears.create",
        json!({ "input": { "name": "2025/26", "startDate": "2025-09-01", "endDate": "2026-07-20" } }),
    );
    let term = s.as_user_ok(
        &school.head,
        "terms.create",
        json!({
            "input": {
                "academicYearId": id_of(&year),
                "name": "Autumn",
                "startDate": "2025-09-01",
                "endDate": "2025-12-19"
            }
        }),
    );
    let term_id = id_of(&term);

    for (marks, term) in [(80.0, Some(term_id.clone())), (40.0, None)] {
        let grade = s.as_user_ok(
            &school.teacher,
            "grades.create",
            json!({
                "input": {
                    "studentId": school.students[0],
                    "subjectId": school.subject_id,
                    "termId": term,
                    "assignmentName": "Test",
                    "marksObtained": marks,
                    "totalMarks": 100
                }
            }),
        );
        s.as_user_ok(&school.head, "grades.approve", json!({ "id": id_of(&grade) }));
    }

    let all = s.as_user_ok(
        &school.head,
        "reports.model",
        json!({ "kind": "studentPerformance", "studentId": school.students[0] }),
    );
    assert_eq!(all["rows"][0]["averagePercentage"].as_f64(), Some(60.0));

    let autumn = s.as_user_ok(
        &school.head,
        "reports.model",
        json!({ "kind": "studentPerformance", "studentId": school.students[0], "termId": term_id }),
    );
    assert_eq!(autumn["rows"][0]["averagePercentage"].as_f64(), Some(80.0));
    assert_eq!(autumn["rows"][0]["gradeCount"].as_u64(), Some(1));
}
