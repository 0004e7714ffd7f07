use crate::calc;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_str, patch, patched_opt_str, patched_str,
    require_exists, required_f64, required_str, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Assignment, Grade, GradeStatus, Role, UserProfile};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Value};

const PATCHABLE: &[&str] = &[
    "assignmentName",
    "marksObtained",
    "totalMarks",
    "comments",
    "classId",
    "termId",
];

fn validate_marks(marks_obtained: f64, total_marks: f64) -> AppResult<()> {
    if total_marks <= 0.0 {
        return Err(AppError::validation("totalMarks must be greater than 0"));
    }
    if marks_obtained < 0.0 {
        return Err(AppError::validation("marksObtained must not be negative"));
    }
    if marks_obtained > total_marks {
        return Err(AppError::validation("marksObtained must not exceed totalMarks"));
    }
    Ok(())
}

fn require_student(conn: &Connection, id: &str) -> AppResult<()> {
    let profile: UserProfile = store::require(conn, store::USERS, id, "student")?;
    if profile.role != Role::Student {
        return Err(AppError::validation("studentId must reference a student"));
    }
    Ok(())
}

/// Teachers record grades under their own id; administrators may record on
/// behalf of a named teacher.
fn grading_teacher(ctx: &Ctx, session: &Session, inp: &Value) -> AppResult<String> {
    match opt_str(inp, "teacherId")? {
        Some(t) if t != session.user_id => {
            session.require_any(&[Role::Headteacher], "record grades for another teacher")?;
            require_exists(ctx.conn, store::USERS, &t, "teacher")?;
            Ok(t)
        }
        _ => Ok(session.user_id.clone()),
    }
}

fn grades_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher, Role::Teacher], "record grades")?;
    let inp = input(ctx.params)?;
    let student_id = required_str(inp, "studentId")?;
    let subject_id = required_str(inp, "subjectId")?;
    let marks_obtained = required_f64(inp, "marksObtained")?;
    let total_marks = required_f64(inp, "totalMarks")?;
    validate_marks(marks_obtained, total_marks)?;

    require_student(ctx.conn, &student_id)?;
    require_exists(ctx.conn, store::SUBJECTS, &subject_id, "subject")?;
    let class_id = opt_str(inp, "classId")?;
    if let Some(c) = &class_id {
        require_exists(ctx.conn, store::CLASSES, c, "class")?;
    }
    let term_id = opt_str(inp, "termId")?;
    if let Some(t) = &term_id {
        require_exists(ctx.conn, store::TERMS, t, "term")?;
    }
    let assignment_id = opt_str(inp, "assignmentId")?;
    let assignment_name = match (&assignment_id, opt_str(inp, "assignmentName")?) {
        (_, Some(name)) => name,
        (Some(aid), None) => {
            let a: Assignment = store::require(ctx.conn, store::ASSIGNMENTS, aid, "assignment")?;
            a.title
        }
        (None, None) => return Err(AppError::validation("missing assignmentName")),
    };

    let grade = Grade {
        id: String::new(),
        student_id,
        subject_id,
        teacher_id: grading_teacher(ctx, session, inp)?,
        class_id,
        term_id,
        assignment_id,
        assignment_name,
        marks_obtained,
        total_marks,
        grade_percentage: calc::grade_percentage(marks_obtained, total_marks),
        status: GradeStatus::Pending,
        comments: opt_str(inp, "comments")?,
        reviewed_by: None,
        reviewed_at: None,
        created_at: String::new(),
        updated_at: String::new(),
    };
    let stored = store::insert_typed(ctx.conn, store::GRADES, &grade)?;
    tracing::info!(
        grade = %stored.id,
        student = %stored.student_id,
        percentage = stored.grade_percentage,
        "grade recorded"
    );
    Ok(json!(stored))
}

fn grades_list(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let student_id = if session.is(Role::Student) {
        Some(session.user_id.clone())
    } else {
        opt_str(&f, "studentId")?
    };
    let status = match opt_str(&f, "status")? {
        Some(s) => Some(
            GradeStatus::parse(&s)
                .ok_or_else(|| AppError::validation("status must be one of: pending, approved, rejected"))?
                .as_str(),
        ),
        None => None,
    };
    let q = Query::new(store::GRADES)
        .eq_opt("studentId", student_id)
        .eq_opt("subjectId", opt_str(&f, "subjectId")?)
        .eq_opt("teacherId", opt_str(&f, "teacherId")?)
        .eq_opt("classId", opt_str(&f, "classId")?)
        .eq_opt("termId", opt_str(&f, "termId")?)
        .eq_opt("status", status);
    let grades: Vec<Grade> = store::query_typed(ctx.conn, &q)?;
    Ok(json!({ "grades": grades }))
}

fn editable_grade(ctx: &Ctx, session: &Session, action: &str) -> AppResult<Grade> {
    let id = required_str(ctx.params, "id")?;
    let grade: Grade = store::require(ctx.conn, store::GRADES, &id, "grade")?;
    if session.is(Role::Student) {
        return Err(AppError::forbidden(format!("student may not {}", action)));
    }
    session.require_owner_or_admin(&grade.teacher_id, action)?;
    Ok(grade)
}

fn grades_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let p = patch(ctx.params, PATCHABLE)?;
    let mut grade = editable_grade(ctx, session, "edit this grade")?;

    if has_key(p, "marksObtained") {
        grade.marks_obtained = required_f64(p, "marksObtained")?;
    }
    if has_key(p, "totalMarks") {
        grade.total_marks = required_f64(p, "totalMarks")?;
    }
    validate_marks(grade.marks_obtained, grade.total_marks)?;
    grade.grade_percentage = calc::grade_percentage(grade.marks_obtained, grade.total_marks);
    grade.assignment_name = patched_str(p, "assignmentName", grade.assignment_name)?;
    grade.comments = patched_opt_str(p, "comments", grade.comments)?;
    grade.class_id = patched_opt_str(p, "classId", grade.class_id)?;
    if let Some(c) = &grade.class_id {
        require_exists(ctx.conn, store::CLASSES, c, "class")?;
    }
    grade.term_id = patched_opt_str(p, "termId", grade.term_id)?;
    if let Some(t) = &grade.term_id {
        require_exists(ctx.conn, store::TERMS, t, "term")?;
    }

    // A changed grade goes back through review.
    grade.status = GradeStatus::Pending;
    grade.reviewed_by = None;
    grade.reviewed_at = None;

    let stored = store::replace_typed(ctx.conn, store::GRADES, &grade.id, &grade)?;
    tracing::info!(grade = %stored.id, by = %session.user_id, "grade updated");
    Ok(json!(stored))
}

fn review(ctx: &Ctx, session: &Session, status: GradeStatus) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "review grades")?;
    let id = required_str(ctx.params, "id")?;
    let mut grade: Grade = store::require(ctx.conn, store::GRADES, &id, "grade")?;
    grade.status = status;
    grade.reviewed_by = Some(session.user_id.clone());
    grade.reviewed_at = Some(store::now_iso());
    if status == GradeStatus::Rejected {
        if let Some(reason) = opt_str(ctx.params, "reason")? {
            grade.comments = Some(reason);
        }
    }
    let stored = store::replace_typed(ctx.conn, store::GRADES, &id, &grade)?;
    tracing::info!(grade = %id, status = status.as_str(), by = %session.user_id, "grade reviewed");
    Ok(json!(stored))
}

fn grades_approve(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    review(ctx, session, GradeStatus::Approved)
}

fn grades_reject(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    review(ctx, session, GradeStatus::Rejected)
}

fn grades_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    if store::exists(ctx.conn, store::GRADES, &id)? {
        editable_grade(ctx, session, "delete this grade")?;
    } else if session.is(Role::Student) {
        return Err(AppError::forbidden("student may not delete grades"));
    }
    let removed = store::delete(ctx.conn, store::GRADES, &id)?;
    tracing::info!(grade = %id, by = %session.user_id, removed, "grade delete");
    Ok(deleted(&id, removed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.create" => Some(with_session(state, req, grades_create)),
        "grades.list" => Some(with_session(state, req, grades_list)),
        "grades.update" => Some(with_session(state, req, grades_update)),
        "grades.approve" => Some(with_session(state, req, grades_approve)),
        "grades.reject" => Some(with_session(state, req, grades_reject)),
        "grades.delete" => Some(with_session(state, req, grades_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::validate_marks;

    #[test]
    fn marks_must_fit_total() {
        assert!(validate_marks(45.0, 50.0).is_ok());
        assert!(validate_marks(50.0, 50.0).is_ok());
        assert!(validate_marks(0.0, 50.0).is_ok());
        assert_eq!(validate_marks(51.0, 50.0).unwrap_err().code(), "bad_params");
        assert_eq!(validate_marks(-1.0, 50.0).unwrap_err().code(), "bad_params");
        assert_eq!(validate_marks(0.0, 0.0).unwrap_err().code(), "bad_params");
    }
}
