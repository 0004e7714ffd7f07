#![allow(dead_code)]

#[path = "../src/models.rs"]
mod models;

#[path = "../src/calc.rs"]
mod calc;

use calc::{
    attendance_summary, average_by_student, average_by_subject, class_average, round2,
    teacher_overview,
};
use models::{AttendanceRecord, AttendanceStatus, Grade, GradeStatus, RecordType};

fn grade(student: &str, subject: &str, teacher: &str, pct: f64) -> Grade {
    Grade {
        id: format!("{}-{}-{}", student, subject, pct),
        student_id: student.into(),
        subject_id: subject.into(),
        teacher_id: teacher.into(),
        class_id: None,
        term_id: None,
        assignment_id: None,
        assignment_name: "Quiz".into(),
        marks_obtained: pct,
        total_marks: 100.0,
        grade_percentage: pct,
        status: GradeStatus::Approved,
        comments: None,
        reviewed_by: None,
        reviewed_at: None,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

fn record(student: Option<&str>, teacher: &str, status: AttendanceStatus) -> AttendanceRecord {
    AttendanceRecord {
        id: String::new(),
        record_type: if student.is_some() {
            RecordType::Student
        } else {
            RecordType::Teacher
        },
        class_id: None,
        student_id: student.map(str::to_string),
        teacher_id: teacher.into(),
        date: "2025-09-08".into(),
        start_time: None,
        status,
        notes: None,
        is_approved: false,
        approved_by: None,
        approved_at: None,
        recorded_by: teacher.into(),
        created_at: String::new(),
        updated_at: String::new(),
    }
}

#[test]
fn class_average_weights_students_equally() {
    let roster = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let grades = vec![
        grade("a", "math", "t", 100.0),
        grade("a", "math", "t", 0.0),
        grade("b", "math", "t", 60.0),
        // Not on the roster.
        grade("z", "math", "t", 10.0),
    ];
    let avg = class_average(&roster, &grades);
    assert_eq!(avg.average_grade, 55.0);
    assert_eq!(avg.total_students, 3);
    assert_eq!(avg.graded_students, 2);

    let empty = class_average(&roster, &[]);
    assert_eq!(empty.average_grade, 0.0);
    assert_eq!(empty.graded_students, 0);
}

#[test]
fn averages_keep_first_seen_order() {
    let grades = vec![
        grade("b", "sci", "t1", 50.0),
        grade("a", "math", "t1", 100.0),
        grade("b", "math", "t2", 100.0),
        grade("a", "sci", "t1", 0.0),
    ];
    let by_student = average_by_student(&grades);
    assert_eq!(by_student.len(), 2);
    assert_eq!(by_student[0].student_id, "b");
    assert_eq!(by_student[0].average_percentage, 75.0);
    assert_eq!(by_student[1].average_percentage, 50.0);

    let by_subject = average_by_subject(&grades);
    assert_eq!(by_subject[0].subject_id, "sci");
    assert_eq!(by_subject[0].average_percentage, 25.0);
    assert_eq!(by_subject[1].grade_count, 2);

    let overview = teacher_overview("t1", &grades);
    assert_eq!(overview.len(), 2);
    assert_eq!(overview[0].subject_id, "sci");
    assert_eq!(overview[0].total_students_graded, 2);
    assert_eq!(overview[1].subject_id, "math");
    assert_eq!(overview[1].grade_count, 1);
}

#[test]
fn round2_matches_fixed_point_display() {
    assert_eq!(round2(55.0), 55.0);
    assert_eq!(round2(160.0 / 3.0), 53.33);
    assert_eq!(round2(2.675), 2.67);
    assert_eq!(round2(0.125), 0.13);
}

#[test]
fn attendance_counts_late_as_attended() {
    let records = vec![
        record(Some("s1"), "t", AttendanceStatus::Present),
        record(Some("s1"), "t", AttendanceStatus::Late),
        record(Some("s1"), "t", AttendanceStatus::Absent),
        record(Some("s2"), "t", AttendanceStatus::Excused),
        record(None, "t", AttendanceStatus::Present),
    ];
    let summary = attendance_summary(&records);
    assert_eq!(summary.people.len(), 3);
    assert_eq!(summary.people[0].person_id, "s1");
    assert_eq!(summary.people[0].tally.attendance_rate, 66.67);
    assert_eq!(summary.people[1].tally.excused, 1);
    assert_eq!(summary.people[1].tally.attendance_rate, 0.0);
    assert_eq!(summary.people[2].person_id, "t");
    assert_eq!(summary.overall.total, 5);
    assert_eq!(summary.overall.attendance_rate, 60.0);

    let none = attendance_summary(&[]);
    assert_eq!(none.overall.attendance_rate, 0.0);
    assert!(none.people.is_empty());
}
