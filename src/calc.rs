use crate::models::{AttendanceRecord, AttendanceStatus, Grade};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Rounds to 2 decimals the way `Number.prototype.toFixed(2)` does: the
/// decision is taken on the exact binary value, and an exact tie goes away
/// from zero. `1.005` is stored below the tie and rounds to `1.0`, while
/// `0.125` is an exact tie and rounds to `0.13`.
pub fn round2(x: f64) -> f64 {
    if !x.is_finite() {
        return x;
    }
    // 80 fraction digits covers the full expansion of every double >= 1e-6.
    let text = format!("{:.80}", x.abs());
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let frac = frac_part.as_bytes();
    let digit = |i: usize| frac.get(i).map(|b| (b - b'0') as u128).unwrap_or(0);
    let Ok(whole) = int_part.parse::<u128>() else {
        return x;
    };
    let mut cents = whole * 100 + digit(0) * 10 + digit(1);
    if digit(2) >= 5 {
        cents += 1;
    }
    let magnitude: f64 = format!("{}.{:02}", cents / 100, cents % 100)
        .parse()
        .unwrap_or(0.0);
    if x.is_sign_negative() {
        -magnitude
    } else {
        magnitude
    }
}

/// `round2(marks / total * 100)`; a non-positive total yields 0.
pub fn grade_percentage(marks_obtained: f64, total_marks: f64) -> f64 {
    if total_marks <= 0.0 {
        return 0.0;
    }
    round2(marks_obtained / total_marks * 100.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Groups values by key, keeping groups in first-seen order.
fn group_in_order<'a, T, K, V>(
    items: impl IntoIterator<Item = &'a T>,
    key: K,
    value: V,
) -> Vec<(String, Vec<f64>)>
where
    T: 'a,
    K: Fn(&T) -> &str,
    V: Fn(&T) -> f64,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<f64>)> = Vec::new();
    for item in items {
        let k = key(item);
        let slot = match index.get(k) {
            Some(i) => *i,
            None => {
                index.insert(k.to_string(), groups.len());
                groups.push((k.to_string(), Vec::new()));
                groups.len() - 1
            }
        };
        groups[slot].1.push(value(item));
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverage {
    pub student_id: String,
    pub average_percentage: f64,
    pub grade_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub average_percentage: f64,
    pub grade_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAverage {
    pub average_grade: f64,
    pub total_students: usize,
    pub graded_students: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherSubjectOverview {
    pub subject_id: String,
    pub average_grade: f64,
    pub total_students_graded: usize,
    pub grade_count: usize,
}

pub fn average_by_student(grades: &[Grade]) -> Vec<StudentAverage> {
    group_in_order(grades, |g| g.student_id.as_str(), |g| g.grade_percentage)
        .into_iter()
        .map(|(student_id, values)| StudentAverage {
            student_id,
            average_percentage: round2(mean(&values)),
            grade_count: values.len(),
        })
        .collect()
}

pub fn average_by_subject(grades: &[Grade]) -> Vec<SubjectAverage> {
    group_in_order(grades, |g| g.subject_id.as_str(), |g| g.grade_percentage)
        .into_iter()
        .map(|(subject_id, values)| SubjectAverage {
            subject_id,
            average_percentage: round2(mean(&values)),
            grade_count: values.len(),
        })
        .collect()
}

/// Mean of per-student means over the roster members that have grades.
/// Grades of students outside the roster are ignored.
pub fn class_average(student_ids_in_class: &[String], grades: &[Grade]) -> ClassAverage {
    let roster: HashSet<&str> = student_ids_in_class.iter().map(String::as_str).collect();
    let per_student: Vec<f64> = group_in_order(
        grades.iter().filter(|g| roster.contains(g.student_id.as_str())),
        |g| g.student_id.as_str(),
        |g| g.grade_percentage,
    )
    .into_iter()
    .map(|(_, values)| mean(&values))
    .collect();

    ClassAverage {
        average_grade: round2(mean(&per_student)),
        total_students: roster.len(),
        graded_students: per_student.len(),
    }
}

pub fn teacher_overview(teacher_id: &str, grades: &[Grade]) -> Vec<TeacherSubjectOverview> {
    let mine: Vec<&Grade> = grades.iter().filter(|g| g.teacher_id == teacher_id).collect();
    let mut students: HashMap<&str, HashSet<&str>> = HashMap::new();
    for g in &mine {
        students
            .entry(g.subject_id.as_str())
            .or_default()
            .insert(g.student_id.as_str());
    }
    group_in_order(mine.iter().copied(), |g| g.subject_id.as_str(), |g| g.grade_percentage)
        .into_iter()
        .map(|(subject_id, values)| TeacherSubjectOverview {
            total_students_graded: students.get(subject_id.as_str()).map(|s| s.len()).unwrap_or(0),
            subject_id,
            average_grade: round2(mean(&values)),
            grade_count: values.len(),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
    pub total: usize,
    pub attendance_rate: f64,
}

impl AttendanceTally {
    fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
        self.total += 1;
    }

    // Late arrivals count as attended.
    fn finish(&mut self) {
        self.attendance_rate = if self.total == 0 {
            0.0
        } else {
            round2((self.present + self.late) as f64 / self.total as f64 * 100.0)
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendeeSummary {
    /// Student id for student records, teacher id for teacher records.
    pub person_id: String,
    #[serde(flatten)]
    pub tally: AttendanceTally,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub people: Vec<AttendeeSummary>,
    pub overall: AttendanceTally,
}

pub fn attendance_person_id(r: &AttendanceRecord) -> &str {
    r.student_id.as_deref().unwrap_or(r.teacher_id.as_str())
}

pub fn attendance_summary(records: &[AttendanceRecord]) -> AttendanceSummary {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut people: Vec<AttendeeSummary> = Vec::new();
    let mut overall = AttendanceTally::default();
    for r in records {
        let pid = attendance_person_id(r);
        let slot = *index.entry(pid).or_insert_with(|| {
            people.push(AttendeeSummary {
                person_id: pid.to_string(),
                tally: AttendanceTally::default(),
            });
            people.len() - 1
        });
        people[slot].tally.add(r.status);
        overall.add(r.status);
    }
    for p in &mut people {
        p.tally.finish();
    }
    overall.finish();
    AttendanceSummary { people, overall }
}
