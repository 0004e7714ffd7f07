use crate::blobs::sanitize_file_name;
use crate::calc;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::attendance::{load_records, AttendanceFilter};
use crate::ipc::handlers::{classes, setup};
use crate::ipc::helpers::{filters, opt_bool, opt_str, required_str, with_session, Ctx};
use crate::ipc::types::{AppState, Request};
use crate::models::{Grade, Role, SchoolClass};
use crate::printing::{self, ReportDocument, ReportFormat};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    StudentPerformance,
    SubjectPerformance,
    ClassPerformance,
    TeacherOverview,
    Attendance,
}

impl ReportKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "studentPerformance" => Some(Self::StudentPerformance),
            "subjectPerformance" => Some(Self::SubjectPerformance),
            "classPerformance" => Some(Self::ClassPerformance),
            "teacherOverview" => Some(Self::TeacherOverview),
            "attendance" => Some(Self::Attendance),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::StudentPerformance => "studentPerformance",
            Self::SubjectPerformance => "subjectPerformance",
            Self::ClassPerformance => "classPerformance",
            Self::TeacherOverview => "teacherOverview",
            Self::Attendance => "attendance",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::StudentPerformance => "Student Performance",
            Self::SubjectPerformance => "Subject Performance",
            Self::ClassPerformance => "Class Performance",
            Self::TeacherOverview => "Teacher Overview",
            Self::Attendance => "Attendance Summary",
        }
    }

    /// The params key naming the report's scope, if it has one.
    fn scope_key(self) -> &'static str {
        match self {
            Self::StudentPerformance => "studentId",
            Self::SubjectPerformance => "subjectId",
            Self::ClassPerformance => "classId",
            Self::TeacherOverview => "teacherId",
            Self::Attendance => "classId",
        }
    }
}

/// Report rows plus the same rows flattened for printing.
struct ReportModel {
    kind: ReportKind,
    scope_id: Option<String>,
    rows: Vec<Value>,
    columns: Vec<String>,
    cells: Vec<Vec<String>>,
    totals: Option<Value>,
}

impl ReportModel {
    fn to_json(&self) -> Value {
        let mut out = json!({
            "kind": self.kind.as_str(),
            "title": self.kind.title(),
            "scopeId": self.scope_id,
            "columns": self.columns,
            "rows": self.rows,
        });
        if let Some(t) = &self.totals {
            out["totals"] = t.clone();
        }
        out
    }
}

/// id -> display name for one collection, fetched with a chunked `in` query.
fn name_lookup(
    conn: &Connection,
    collection: &'static str,
    field: &str,
    ids: &BTreeSet<String>,
) -> AppResult<HashMap<String, String>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let docs = store::query(conn, &Query::new(collection).is_in("id", ids.iter().cloned()))?;
    Ok(docs
        .into_iter()
        .filter_map(|d| {
            let id = d.get("id")?.as_str()?.to_string();
            let name = d.get(field)?.as_str()?.to_string();
            Some((id, name))
        })
        .collect())
}

fn name_of(lookup: &HashMap<String, String>, id: &str) -> String {
    lookup
        .get(id)
        .filter(|n| !n.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn pct(v: f64) -> String {
    format!("{:.2}", v)
}

/// Only approved grades feed reports.
fn approved_grades(conn: &Connection, base: Query) -> AppResult<Vec<Grade>> {
    store::query_typed(conn, &base.eq("status", "approved"))
}

fn grade_query(term_id: Option<String>) -> Query {
    Query::new(store::GRADES).eq_opt("termId", term_id)
}

fn student_performance(
    conn: &Connection,
    scope: Option<String>,
    term_id: Option<String>,
) -> AppResult<ReportModel> {
    let grades = approved_grades(conn, grade_query(term_id).eq_opt("studentId", scope.clone()))?;
    let averages = calc::average_by_student(&grades);
    let ids: BTreeSet<String> = averages.iter().map(|a| a.student_id.clone()).collect();
    let names = name_lookup(conn, store::USERS, "displayName", &ids)?;

    let mut rows = Vec::with_capacity(averages.len());
    let mut cells = Vec::with_capacity(averages.len());
    for a in &averages {
        let name = name_of(&names, &a.student_id);
        cells.push(vec![name.clone(), a.grade_count.to_string(), pct(a.average_percentage)]);
        rows.push(json!({
            "studentId": a.student_id,
            "studentName": name,
            "averagePercentage": a.average_percentage,
            "gradeCount": a.grade_count,
        }));
    }
    Ok(ReportModel {
        kind: ReportKind::StudentPerformance,
        scope_id: scope,
        rows,
        columns: vec!["Student".into(), "Grades".into(), "Average %".into()],
        cells,
        totals: None,
    })
}

fn subject_performance(
    conn: &Connection,
    scope: Option<String>,
    term_id: Option<String>,
) -> AppResult<ReportModel> {
    let grades = approved_grades(conn, grade_query(term_id).eq_opt("subjectId", scope.clone()))?;
    let averages = calc::average_by_subject(&grades);
    let ids: BTreeSet<String> = averages.iter().map(|a| a.subject_id.clone()).collect();
    let names = name_lookup(conn, store::SUBJECTS, "name", &ids)?;

    let mut rows = Vec::with_capacity(averages.len());
    let mut cells = Vec::with_capacity(averages.len());
    for a in &averages {
        let name = name_of(&names, &a.subject_id);
        cells.push(vec![name.clone(), a.grade_count.to_string(), pct(a.average_percentage)]);
        rows.push(json!({
            "subjectId": a.subject_id,
            "subjectName": name,
            "averagePercentage": a.average_percentage,
            "gradeCount": a.grade_count,
        }));
    }
    Ok(ReportModel {
        kind: ReportKind::SubjectPerformance,
        scope_id: scope,
        rows,
        columns: vec!["Subject".into(), "Grades".into(), "Average %".into()],
        cells,
        totals: None,
    })
}

fn class_performance(
    conn: &Connection,
    scope: Option<String>,
    term_id: Option<String>,
) -> AppResult<ReportModel> {
    let targets: Vec<SchoolClass> = match &scope {
        Some(id) => vec![store::require(conn, store::CLASSES, id, "class")?],
        None => {
            let mut all: Vec<SchoolClass> = store::query_typed(conn, &Query::new(store::CLASSES))?;
            all.sort_by(|a, b| a.name.cmp(&b.name));
            all
        }
    };

    let mut rows = Vec::with_capacity(targets.len());
    let mut cells = Vec::with_capacity(targets.len());
    for class in &targets {
        let roster: Vec<String> = classes::roster(conn, &class.id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let grades = if roster.is_empty() {
            Vec::new()
        } else {
            approved_grades(
                conn,
                grade_query(term_id.clone()).is_in("studentId", roster.iter().cloned()),
            )?
        };
        let avg = calc::class_average(&roster, &grades);
        let name = if class.name.trim().is_empty() {
            UNKNOWN.to_string()
        } else {
            class.name.clone()
        };
        cells.push(vec![
            name.clone(),
            avg.total_students.to_string(),
            avg.graded_students.to_string(),
            pct(avg.average_grade),
        ]);
        rows.push(json!({
            "classId": class.id,
            "className": name,
            "averageGrade": avg.average_grade,
            "totalStudents": avg.total_students,
            "gradedStudents": avg.graded_students,
        }));
    }
    Ok(ReportModel {
        kind: ReportKind::ClassPerformance,
        scope_id: scope,
        rows,
        columns: vec![
            "Class".into(),
            "Students".into(),
            "Graded".into(),
            "Average %".into(),
        ],
        cells,
        totals: None,
    })
}

fn teacher_overview(
    conn: &Connection,
    scope: Option<String>,
    term_id: Option<String>,
) -> AppResult<ReportModel> {
    let grades = approved_grades(conn, grade_query(term_id).eq_opt("teacherId", scope.clone()))?;
    let mut teachers: Vec<String> = Vec::new();
    for g in &grades {
        if !teachers.contains(&g.teacher_id) {
            teachers.push(g.teacher_id.clone());
        }
    }
    let teacher_ids: BTreeSet<String> = teachers.iter().cloned().collect();
    let subject_ids: BTreeSet<String> = grades.iter().map(|g| g.subject_id.clone()).collect();
    let teacher_names = name_lookup(conn, store::USERS, "displayName", &teacher_ids)?;
    let subject_names = name_lookup(conn, store::SUBJECTS, "name", &subject_ids)?;

    let mut rows = Vec::new();
    let mut cells = Vec::new();
    for teacher_id in &teachers {
        let teacher_name = name_of(&teacher_names, teacher_id);
        for o in calc::teacher_overview(teacher_id, &grades) {
            let subject_name = name_of(&subject_names, &o.subject_id);
            cells.push(vec![
                teacher_name.clone(),
                subject_name.clone(),
                o.total_students_graded.to_string(),
                o.grade_count.to_string(),
                pct(o.average_grade),
            ]);
            rows.push(json!({
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "subjectId": o.subject_id,
                "subjectName": subject_name,
                "averageGrade": o.average_grade,
                "totalStudentsGraded": o.total_students_graded,
                "gradeCount": o.grade_count,
            }));
        }
    }
    Ok(ReportModel {
        kind: ReportKind::TeacherOverview,
        scope_id: scope,
        rows,
        columns: vec![
            "Teacher".into(),
            "Subject".into(),
            "Students".into(),
            "Grades".into(),
            "Average %".into(),
        ],
        cells,
        totals: None,
    })
}

fn attendance_report(conn: &Connection, filter: AttendanceFilter) -> AppResult<ReportModel> {
    let records = load_records(conn, &filter)?;
    let summary = calc::attendance_summary(&records);
    let ids: BTreeSet<String> = summary.people.iter().map(|p| p.person_id.clone()).collect();
    let names = name_lookup(conn, store::USERS, "displayName", &ids)?;

    let mut rows = Vec::with_capacity(summary.people.len());
    let mut cells = Vec::with_capacity(summary.people.len());
    for p in &summary.people {
        let name = name_of(&names, &p.person_id);
        let t = &p.tally;
        cells.push(vec![
            name.clone(),
            t.present.to_string(),
            t.absent.to_string(),
            t.late.to_string(),
            t.excused.to_string(),
            t.total.to_string(),
            pct(t.attendance_rate),
        ]);
        let mut row = json!(p);
        row["personName"] = json!(name);
        rows.push(row);
    }
    Ok(ReportModel {
        kind: ReportKind::Attendance,
        scope_id: filter.class_id.clone().or(filter.student_id.clone()),
        rows,
        columns: vec![
            "Name".into(),
            "Present".into(),
            "Absent".into(),
            "Late".into(),
            "Excused".into(),
            "Total".into(),
            "Rate %".into(),
        ],
        cells,
        totals: Some(json!(summary.overall)),
    })
}

fn build_model(ctx: &Ctx, session: &Session) -> AppResult<ReportModel> {
    let kind_raw = required_str(ctx.params, "kind")?;
    let kind = ReportKind::parse(&kind_raw).ok_or_else(|| {
        AppError::validation(
            "kind must be one of: studentPerformance, subjectPerformance, classPerformance, teacherOverview, attendance",
        )
    })?;
    let term_id = opt_str(ctx.params, "termId")?;

    if session.is(Role::Student) {
        return match kind {
            ReportKind::StudentPerformance => {
                student_performance(ctx.conn, Some(session.user_id.clone()), term_id)
            }
            ReportKind::Attendance => {
                let mut filter = AttendanceFilter::from_value(&filters(ctx.params)?)?;
                filter.restrict_to(session);
                attendance_report(ctx.conn, filter)
            }
            _ => Err(AppError::forbidden(format!(
                "student may not view the {} report",
                kind.as_str()
            ))),
        };
    }

    let scope = opt_str(ctx.params, kind.scope_key())?;
    match kind {
        ReportKind::StudentPerformance => student_performance(ctx.conn, scope, term_id),
        ReportKind::SubjectPerformance => subject_performance(ctx.conn, scope, term_id),
        ReportKind::ClassPerformance => class_performance(ctx.conn, scope, term_id),
        ReportKind::TeacherOverview => teacher_overview(ctx.conn, scope, term_id),
        ReportKind::Attendance => {
            let mut filter = AttendanceFilter::from_value(&filters(ctx.params)?)?;
            if filter.class_id.is_none() {
                filter.class_id = scope;
            }
            attendance_report(ctx.conn, filter)
        }
    }
}

fn reports_model(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    Ok(build_model(ctx, session)?.to_json())
}

fn storage_path(kind: ReportKind, scope: Option<&str>, millis: Option<i64>, format: ReportFormat) -> String {
    let base = scope.map(sanitize_file_name).unwrap_or_else(|| "all".to_string());
    match millis {
        Some(ms) => format!("reports/{}/{}_{}.{}", kind.as_str(), base, ms, format.extension()),
        None => format!("reports/{}/{}.{}", kind.as_str(), base, format.extension()),
    }
}

fn reports_render(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let model = build_model(ctx, session)?;
    let settings = setup::report_settings(ctx.conn)?;
    let format = match opt_str(ctx.params, "format")? {
        Some(f) => ReportFormat::parse(&f)
            .ok_or_else(|| AppError::validation("format must be one of: pdf, html"))?,
        None => settings.default_format,
    };
    let timestamped = opt_bool(ctx.params, "timestamped")?.unwrap_or(settings.timestamped_paths);

    let doc = ReportDocument {
        title: model.kind.title().to_string(),
        school_name: settings.school_name.clone(),
        generated_at: settings.show_generated_at.then(store::now_iso),
        columns: model.columns.clone(),
        rows: model.cells.clone(),
    };
    let bytes = match format {
        ReportFormat::Pdf => printing::render_pdf(&doc)?,
        ReportFormat::Html => printing::render_html(&doc).into_bytes(),
    };

    let millis = timestamped.then(|| chrono::Utc::now().timestamp_millis());
    let path = storage_path(model.kind, model.scope_id.as_deref(), millis, format);
    let blob = ctx.blobs.upload(&path, &bytes)?;
    tracing::info!(
        kind = model.kind.as_str(),
        path = %path,
        rows = model.rows.len(),
        by = %session.user_id,
        "report rendered"
    );
    Ok(json!({
        "url": blob.url,
        "storagePath": blob.path,
        "sizeBytes": blob.size_bytes,
        "rowCount": model.rows.len(),
        "format": format.extension(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.model" => Some(with_session(state, req, reports_model)),
        "reports.render" => Some(with_session(state, req, reports_render)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_follow_layout() {
        assert_eq!(
            storage_path(ReportKind::StudentPerformance, Some("s1"), None, ReportFormat::Pdf),
            "reports/studentPerformance/s1.pdf"
        );
        assert_eq!(
            storage_path(ReportKind::Attendance, None, Some(1700000000000), ReportFormat::Html),
            "reports/attendance/all_1700000000000.html"
        );
    }

    #[test]
    fn missing_names_render_unknown() {
        let mut names = HashMap::new();
        names.insert("a".to_string(), "Ada".to_string());
        names.insert("b".to_string(), "  ".to_string());
        assert_eq!(name_of(&names, "a"), "Ada");
        assert_eq!(name_of(&names, "b"), "Unknown");
        assert_eq!(name_of(&names, "zzz"), "Unknown");
    }
}
