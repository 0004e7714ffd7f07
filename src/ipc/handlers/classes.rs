use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_i64, opt_str, patch, patched_opt_str, patched_str,
    require_exists, required_str, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Role, SchoolClass, UserProfile};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;

const PATCHABLE: &[&str] = &[
    "name",
    "gradeLevel",
    "classTeacherId",
    "academicYearId",
    "capacity",
];

fn parse_capacity(obj: &Value) -> AppResult<Option<i64>> {
    match opt_i64(obj, "capacity")? {
        Some(c) if c <= 0 => Err(AppError::validation("capacity must be > 0")),
        other => Ok(other),
    }
}

fn validate_links(conn: &Connection, class: &SchoolClass) -> AppResult<()> {
    if let Some(t) = &class.class_teacher_id {
        require_exists(conn, store::USERS, t, "class teacher")?;
    }
    if let Some(y) = &class.academic_year_id {
        require_exists(conn, store::ACADEMIC_YEARS, y, "academic year")?;
    }
    Ok(())
}

/// Students of a class, by display name.
pub fn roster(conn: &Connection, class_id: &str) -> AppResult<Vec<UserProfile>> {
    let q = Query::new(store::USERS)
        .eq("role", Role::Student.as_str())
        .eq("classId", class_id);
    let mut students: Vec<UserProfile> = store::query_typed(conn, &q)?;
    students.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(students)
}

fn classes_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "administer classes")?;
    let inp = input(ctx.params)?;
    let class = SchoolClass {
        id: String::new(),
        name: required_str(inp, "name")?,
        grade_level: opt_str(inp, "gradeLevel")?.unwrap_or_default(),
        class_teacher_id: opt_str(inp, "classTeacherId")?,
        academic_year_id: opt_str(inp, "academicYearId")?,
        capacity: parse_capacity(inp)?,
        created_at: String::new(),
        updated_at: String::new(),
    };
    validate_links(ctx.conn, &class)?;
    let stored = store::insert_typed(ctx.conn, store::CLASSES, &class)?;
    tracing::info!(class = %stored.id, name = %stored.name, "class created");
    Ok(json!(stored))
}

fn classes_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let q = Query::new(store::CLASSES)
        .eq_opt("academicYearId", opt_str(&f, "academicYearId")?)
        .eq_opt("classTeacherId", opt_str(&f, "classTeacherId")?)
        .eq_opt("gradeLevel", opt_str(&f, "gradeLevel")?);
    let mut classes: Vec<SchoolClass> = store::query_typed(ctx.conn, &q)?;
    classes.sort_by(|a, b| a.name.cmp(&b.name));

    // Dashboard counts in one pass over the student profiles.
    let students: Vec<UserProfile> = store::query_typed(
        ctx.conn,
        &Query::new(store::USERS).eq("role", Role::Student.as_str()),
    )?;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for s in &students {
        if let Some(c) = s.class_id.as_deref() {
            *counts.entry(c).or_default() += 1;
        }
    }

    let rows: Vec<Value> = classes
        .iter()
        .map(|c| {
            let mut v = json!(c);
            v["studentCount"] = json!(counts.get(c.id.as_str()).copied().unwrap_or(0));
            v
        })
        .collect();
    Ok(json!({ "classes": rows }))
}

fn classes_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "administer classes")?;
    let id = required_str(ctx.params, "id")?;
    let p = patch(ctx.params, PATCHABLE)?;
    let mut class: SchoolClass = store::require(ctx.conn, store::CLASSES, &id, "class")?;
    class.name = patched_str(p, "name", class.name)?;
    if has_key(p, "gradeLevel") {
        class.grade_level = opt_str(p, "gradeLevel")?.unwrap_or_default();
    }
    class.class_teacher_id = patched_opt_str(p, "classTeacherId", class.class_teacher_id)?;
    class.academic_year_id = patched_opt_str(p, "academicYearId", class.academic_year_id)?;
    if has_key(p, "capacity") {
        class.capacity = parse_capacity(p)?;
    }
    validate_links(ctx.conn, &class)?;
    let stored = store::replace_typed(ctx.conn, store::CLASSES, &id, &class)?;
    Ok(json!(stored))
}

/// Does not cascade: students keep their `classId`.
fn classes_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "administer classes")?;
    let id = required_str(ctx.params, "id")?;
    let removed = store::delete(ctx.conn, store::CLASSES, &id)?;
    tracing::info!(class = %id, removed, "class delete");
    Ok(deleted(&id, removed))
}

fn classes_students(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    require_exists(ctx.conn, store::CLASSES, &id, "class")?;
    let students = roster(ctx.conn, &id)?;
    Ok(json!({ "classId": id, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(with_session(state, req, classes_create)),
        "classes.list" => Some(with_session(state, req, classes_list)),
        "classes.update" => Some(with_session(state, req, classes_update)),
        "classes.delete" => Some(with_session(state, req, classes_delete)),
        "classes.students" => Some(with_session(state, req, classes_students)),
        _ => None,
    }
}
