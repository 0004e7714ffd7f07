use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, input, opt_str, patch, patched_str, required_str, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Role, Subject, UserProfile};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Value};

fn ensure_code_free(conn: &Connection, code: &str, except_id: Option<&str>) -> AppResult<()> {
    if code.is_empty() {
        return Ok(());
    }
    let hits: Vec<Subject> = store::query_typed(conn, &Query::new(store::SUBJECTS).eq("code", code))?;
    if hits.iter().any(|s| Some(s.id.as_str()) != except_id) {
        return Err(AppError::conflict(format!("subject code already in use: {}", code)));
    }
    Ok(())
}

fn subjects_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "administer subjects")?;
    let inp = input(ctx.params)?;
    let subject = Subject {
        id: String::new(),
        name: required_str(inp, "name")?,
        code: opt_str(inp, "code")?.unwrap_or_default(),
        description: opt_str(inp, "description")?.unwrap_or_default(),
        teachers_assigned: Vec::new(),
        created_at: String::new(),
        updated_at: String::new(),
    };
    ensure_code_free(ctx.conn, &subject.code, None)?;
    let stored = store::insert_typed(ctx.conn, store::SUBJECTS, &subject)?;
    tracing::info!(subject = %stored.id, name = %stored.name, "subject created");
    Ok(json!(stored))
}

fn subjects_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let mut q = Query::new(store::SUBJECTS);
    if let Some(teacher_id) = opt_str(&f, "teacherId")? {
        q = q.array_contains("teachersAssigned", teacher_id);
    }
    let mut subjects: Vec<Subject> = store::query_typed(ctx.conn, &q)?;
    subjects.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(json!({ "subjects": subjects }))
}

fn subjects_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "administer subjects")?;
    let id = required_str(ctx.params, "id")?;
    let p = patch(ctx.params, &["name", "code", "description"])?;
    let mut subject: Subject = store::require(ctx.conn, store::SUBJECTS, &id, "subject")?;
    subject.name = patched_str(p, "name", subject.name)?;
    if p.get("code").is_some() {
        subject.code = opt_str(p, "code")?.unwrap_or_default();
        ensure_code_free(ctx.conn, &subject.code, Some(&id))?;
    }
    if p.get("description").is_some() {
        subject.description = opt_str(p, "description")?.unwrap_or_default();
    }
    let stored = store::replace_typed(ctx.conn, store::SUBJECTS, &id, &subject)?;
    Ok(json!(stored))
}

fn subjects_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "administer subjects")?;
    let id = required_str(ctx.params, "id")?;
    let removed = store::delete(ctx.conn, store::SUBJECTS, &id)?;
    tracing::info!(subject = %id, removed, "subject delete");
    Ok(deleted(&id, removed))
}

/// Assigning twice, or unassigning someone not assigned, is a no-op.
fn set_assignment(ctx: &Ctx, session: &Session, assign: bool) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "assign teachers")?;
    let id = required_str(ctx.params, "id")?;
    let teacher_id = required_str(ctx.params, "teacherId")?;
    let mut subject: Subject = store::require(ctx.conn, store::SUBJECTS, &id, "subject")?;

    if assign {
        let teacher: UserProfile = store::require(ctx.conn, store::USERS, &teacher_id, "teacher")?;
        if !matches!(teacher.role, Role::Teacher | Role::Headteacher) {
            return Err(AppError::validation("only teachers can be assigned to subjects"));
        }
        if subject.teachers_assigned.contains(&teacher_id) {
            return Ok(json!(subject));
        }
        subject.teachers_assigned.push(teacher_id.clone());
    } else {
        let before = subject.teachers_assigned.len();
        subject.teachers_assigned.retain(|t| t != &teacher_id);
        if subject.teachers_assigned.len() == before {
            return Ok(json!(subject));
        }
    }

    let stored = store::replace_typed(ctx.conn, store::SUBJECTS, &id, &subject)?;
    tracing::info!(subject = %id, teacher = %teacher_id, assign, "subject teachers changed");
    Ok(json!(stored))
}

fn subjects_assign_teacher(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    set_assignment(ctx, session, true)
}

fn subjects_unassign_teacher(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    set_assignment(ctx, session, false)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(with_session(state, req, subjects_create)),
        "subjects.list" => Some(with_session(state, req, subjects_list)),
        "subjects.update" => Some(with_session(state, req, subjects_update)),
        "subjects.delete" => Some(with_session(state, req, subjects_delete)),
        "subjects.assignTeacher" => Some(with_session(state, req, subjects_assign_teacher)),
        "subjects.unassignTeacher" => Some(with_session(state, req, subjects_unassign_teacher)),
        _ => None,
    }
}
