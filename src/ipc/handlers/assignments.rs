use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_str, patch, patched_str, require_date, require_exists,
    required_f64, required_str, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Assignment, Role};
use crate::session::Session;
use crate::store::{self, FilterOp, Query};
use serde_json::{json, Value};

const PATCHABLE: &[&str] = &["title", "description", "dueDate", "totalMarks"];

fn parse_total(obj: &Value) -> AppResult<f64> {
    let total = required_f64(obj, "totalMarks")?;
    if total <= 0.0 {
        return Err(AppError::validation("totalMarks must be greater than 0"));
    }
    Ok(total)
}

fn assignments_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher, Role::Teacher], "set assignments")?;
    let inp = input(ctx.params)?;
    let subject_id = required_str(inp, "subjectId")?;
    let class_id = required_str(inp, "classId")?;
    require_exists(ctx.conn, store::SUBJECTS, &subject_id, "subject")?;
    require_exists(ctx.conn, store::CLASSES, &class_id, "class")?;
    let due_date = required_str(inp, "dueDate")?;
    require_date(&due_date, "dueDate")?;

    let assignment = Assignment {
        id: String::new(),
        title: required_str(inp, "title")?,
        description: opt_str(inp, "description")?.unwrap_or_default(),
        subject_id,
        class_id,
        teacher_id: session.user_id.clone(),
        due_date,
        total_marks: parse_total(inp)?,
        created_at: String::new(),
        updated_at: String::new(),
    };
    let stored = store::insert_typed(ctx.conn, store::ASSIGNMENTS, &assignment)?;
    tracing::info!(assignment = %stored.id, class = %stored.class_id, "assignment created");
    Ok(json!(stored))
}

fn assignments_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let mut q = Query::new(store::ASSIGNMENTS)
        .eq_opt("classId", opt_str(&f, "classId")?)
        .eq_opt("subjectId", opt_str(&f, "subjectId")?)
        .eq_opt("teacherId", opt_str(&f, "teacherId")?);
    // Exclusive bounds on the due date.
    if let Some(d) = opt_str(&f, "dueAfter")? {
        require_date(&d, "dueAfter")?;
        q = q.filter("dueDate", FilterOp::Gt, d);
    }
    if let Some(d) = opt_str(&f, "dueBefore")? {
        require_date(&d, "dueBefore")?;
        q = q.filter("dueDate", FilterOp::Lt, d);
    }
    let mut assignments: Vec<Assignment> = store::query_typed(ctx.conn, &q)?;
    assignments.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.title.cmp(&b.title)));
    Ok(json!({ "assignments": assignments }))
}

fn owned(ctx: &Ctx, session: &Session, action: &str) -> AppResult<Assignment> {
    let id = required_str(ctx.params, "id")?;
    let a: Assignment = store::require(ctx.conn, store::ASSIGNMENTS, &id, "assignment")?;
    session.require_any(&[Role::Headteacher, Role::Teacher], action)?;
    session.require_owner_or_admin(&a.teacher_id, action)?;
    Ok(a)
}

fn assignments_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let p = patch(ctx.params, PATCHABLE)?;
    let mut a = owned(ctx, session, "edit this assignment")?;
    a.title = patched_str(p, "title", a.title)?;
    if has_key(p, "description") {
        a.description = opt_str(p, "description")?.unwrap_or_default();
    }
    if has_key(p, "dueDate") {
        let due = required_str(p, "dueDate")?;
        require_date(&due, "dueDate")?;
        a.due_date = due;
    }
    if has_key(p, "totalMarks") {
        a.total_marks = parse_total(p)?;
    }
    let stored = store::replace_typed(ctx.conn, store::ASSIGNMENTS, &a.id, &a)?;
    Ok(json!(stored))
}

fn assignments_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    if store::exists(ctx.conn, store::ASSIGNMENTS, &id)? {
        owned(ctx, session, "delete this assignment")?;
    } else {
        session.require_any(&[Role::Headteacher, Role::Teacher], "delete assignments")?;
    }
    let removed = store::delete(ctx.conn, store::ASSIGNMENTS, &id)?;
    tracing::info!(assignment = %id, removed, "assignment delete");
    Ok(deleted(&id, removed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(with_session(state, req, assignments_create)),
        "assignments.list" => Some(with_session(state, req, assignments_list)),
        "assignments.update" => Some(with_session(state, req, assignments_update)),
        "assignments.delete" => Some(with_session(state, req, assignments_delete)),
        _ => None,
    }
}
