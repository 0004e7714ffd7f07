use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_str, patch, require_exists, require_hhmm, required_str,
    with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{DayOfWeek, Role, TimetableEntry};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Value};

const PATCHABLE: &[&str] = &[
    "classId",
    "subjectId",
    "teacherId",
    "academicYearId",
    "termId",
    "dayOfWeek",
    "startTime",
    "endTime",
    "roomLocation",
];

/// (collection, field, label) for every reference an entry carries.
const REFERENCES: [(&str, &str, &str); 5] = [
    (store::CLASSES, "classId", "class"),
    (store::SUBJECTS, "subjectId", "subject"),
    (store::USERS, "teacherId", "teacher"),
    (store::ACADEMIC_YEARS, "academicYearId", "academic year"),
    (store::TERMS, "termId", "term"),
];

fn parse_day(obj: &Value) -> AppResult<DayOfWeek> {
    DayOfWeek::parse(&required_str(obj, "dayOfWeek")?)
        .ok_or_else(|| AppError::validation("dayOfWeek must be a weekday name, Monday..Sunday"))
}

fn validate_slot(entry: &TimetableEntry) -> AppResult<()> {
    require_hhmm(&entry.start_time, "startTime")?;
    require_hhmm(&entry.end_time, "endTime")?;
    if entry.start_time >= entry.end_time {
        return Err(AppError::validation("startTime must be before endTime"));
    }
    Ok(())
}

fn validate_references(conn: &Connection, entry: &TimetableEntry) -> AppResult<()> {
    let ids = [
        &entry.class_id,
        &entry.subject_id,
        &entry.teacher_id,
        &entry.academic_year_id,
        &entry.term_id,
    ];
    for ((collection, _, label), id) in REFERENCES.iter().zip(ids) {
        require_exists(conn, collection, id, label)?;
    }
    Ok(())
}

/// Weekday order first (Monday first), then start time.
pub fn sort_entries(entries: &mut [TimetableEntry]) {
    entries.sort_by(|a, b| {
        a.day_of_week
            .index()
            .cmp(&b.day_of_week.index())
            .then_with(|| a.start_time.cmp(&b.start_time))
    });
}

fn timetable_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "edit the timetable")?;
    let inp = input(ctx.params)?;
    let entry = TimetableEntry {
        id: String::new(),
        class_id: required_str(inp, "classId")?,
        subject_id: required_str(inp, "subjectId")?,
        teacher_id: required_str(inp, "teacherId")?,
        academic_year_id: required_str(inp, "academicYearId")?,
        term_id: required_str(inp, "termId")?,
        day_of_week: parse_day(inp)?,
        start_time: required_str(inp, "startTime")?,
        end_time: required_str(inp, "endTime")?,
        room_location: opt_str(inp, "roomLocation")?.unwrap_or_default(),
        created_at: String::new(),
        updated_at: String::new(),
    };
    validate_slot(&entry)?;
    validate_references(ctx.conn, &entry)?;
    let stored = store::insert_typed(ctx.conn, store::TIMETABLE, &entry)?;
    tracing::info!(
        entry = %stored.id,
        day = stored.day_of_week.as_str(),
        start = %stored.start_time,
        "timetable entry created"
    );
    Ok(json!(stored))
}

fn timetable_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let day = match opt_str(&f, "dayOfWeek")? {
        Some(d) => Some(
            DayOfWeek::parse(&d)
                .ok_or_else(|| AppError::validation("unknown dayOfWeek filter"))?
                .as_str(),
        ),
        None => None,
    };
    let mut q = Query::new(store::TIMETABLE).eq_opt("dayOfWeek", day);
    for (_, field, _) in REFERENCES {
        q = q.eq_opt(field, opt_str(&f, field)?);
    }
    let mut entries: Vec<TimetableEntry> = store::query_typed(ctx.conn, &q)?;
    sort_entries(&mut entries);
    Ok(json!({ "entries": entries }))
}

fn timetable_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "edit the timetable")?;
    let id = required_str(ctx.params, "id")?;
    let p = patch(ctx.params, PATCHABLE)?;
    let mut entry: TimetableEntry = store::require(ctx.conn, store::TIMETABLE, &id, "timetable entry")?;

    for (_, field, _) in REFERENCES {
        if !has_key(p, field) {
            continue;
        }
        let value = required_str(p, field)?;
        match field {
            "classId" => entry.class_id = value,
            "subjectId" => entry.subject_id = value,
            "teacherId" => entry.teacher_id = value,
            "academicYearId" => entry.academic_year_id = value,
            _ => entry.term_id = value,
        }
    }
    if has_key(p, "dayOfWeek") {
        entry.day_of_week = parse_day(p)?;
    }
    if has_key(p, "startTime") {
        entry.start_time = required_str(p, "startTime")?;
    }
    if has_key(p, "endTime") {
        entry.end_time = required_str(p, "endTime")?;
    }
    if has_key(p, "roomLocation") {
        entry.room_location = opt_str(p, "roomLocation")?.unwrap_or_default();
    }
    validate_slot(&entry)?;
    validate_references(ctx.conn, &entry)?;

    let stored = store::replace_typed(ctx.conn, store::TIMETABLE, &id, &entry)?;
    tracing::info!(entry = %id, by = %session.user_id, "timetable entry updated");
    Ok(json!(stored))
}

fn timetable_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "edit the timetable")?;
    let id = required_str(ctx.params, "id")?;
    let removed = store::delete(ctx.conn, store::TIMETABLE, &id)?;
    tracing::info!(entry = %id, by = %session.user_id, removed, "timetable entry delete");
    Ok(deleted(&id, removed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.create" => Some(with_session(state, req, timetable_create)),
        "timetable.list" => Some(with_session(state, req, timetable_list)),
        "timetable.update" => Some(with_session(state, req, timetable_update)),
        "timetable.delete" => Some(with_session(state, req, timetable_delete)),
        _ => None,
    }
}
