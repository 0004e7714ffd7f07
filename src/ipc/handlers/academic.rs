use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_bool, opt_str, patch, patched_str, require_date,
    require_exists, required_str, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{AcademicYear, Role, Term};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const PATCHABLE: &[&str] = &["name", "startDate", "endDate", "isCurrent"];

fn validate_range(start: &str, end: &str) -> AppResult<()> {
    require_date(start, "startDate")?;
    require_date(end, "endDate")?;
    // ISO dates compare correctly as strings.
    if start > end {
        return Err(AppError::validation("startDate must not be after endDate"));
    }
    Ok(())
}

/// At most one current document per scope: flags every other one off.
fn clear_current(conn: &Connection, q: Query, keep_id: &str) -> AppResult<()> {
    let collection = q.collection;
    for doc in store::query(conn, &q.eq("isCurrent", true))? {
        let Some(id) = doc.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        if id == keep_id {
            continue;
        }
        let mut patch = Map::new();
        patch.insert("isCurrent".into(), Value::Bool(false));
        store::update(conn, collection, id, patch)?;
    }
    Ok(())
}

fn admin_only(session: &Session) -> AppResult<()> {
    session.require_any(&[Role::Headteacher], "administer the school calendar")
}

fn years_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    admin_only(session)?;
    let inp = input(ctx.params)?;
    let year = AcademicYear {
        id: String::new(),
        name: required_str(inp, "name")?,
        start_date: required_str(inp, "startDate")?,
        end_date: required_str(inp, "endDate")?,
        is_current: opt_bool(inp, "isCurrent")?.unwrap_or(false),
        created_at: String::new(),
        updated_at: String::new(),
    };
    validate_range(&year.start_date, &year.end_date)?;
    let stored = store::insert_typed(ctx.conn, store::ACADEMIC_YEARS, &year)?;
    if stored.is_current {
        clear_current(ctx.conn, Query::new(store::ACADEMIC_YEARS), &stored.id)?;
    }
    tracing::info!(year = %stored.id, name = %stored.name, "academic year created");
    Ok(json!(stored))
}

fn years_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let q = Query::new(store::ACADEMIC_YEARS).eq_opt("isCurrent", opt_bool(&f, "isCurrent")?);
    let mut years: Vec<AcademicYear> = store::query_typed(ctx.conn, &q)?;
    years.sort_by(|a, b| a.start_date.cmp(&b.start_date));
    Ok(json!({ "academicYears": years }))
}

fn years_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    admin_only(session)?;
    let id = required_str(ctx.params, "id")?;
    let p = patch(ctx.params, PATCHABLE)?;
    let mut year: AcademicYear = store::require(ctx.conn, store::ACADEMIC_YEARS, &id, "academic year")?;
    year.name = patched_str(p, "name", year.name)?;
    year.start_date = patched_str(p, "startDate", year.start_date)?;
    year.end_date = patched_str(p, "endDate", year.end_date)?;
    if has_key(p, "isCurrent") {
        year.is_current = opt_bool(p, "isCurrent")?.unwrap_or(false);
    }
    validate_range(&year.start_date, &year.end_date)?;
    let stored = store::replace_typed(ctx.conn, store::ACADEMIC_YEARS, &id, &year)?;
    if stored.is_current {
        clear_current(ctx.conn, Query::new(store::ACADEMIC_YEARS), &id)?;
    }
    Ok(json!(stored))
}

fn years_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    admin_only(session)?;
    let id = required_str(ctx.params, "id")?;
    let removed = store::delete(ctx.conn, store::ACADEMIC_YEARS, &id)?;
    tracing::info!(year = %id, removed, "academic year delete");
    Ok(deleted(&id, removed))
}

/// Terms must sit inside their academic year.
fn validate_term(conn: &Connection, term: &Term) -> AppResult<()> {
    validate_range(&term.start_date, &term.end_date)?;
    let year: AcademicYear = store::require(conn, store::ACADEMIC_YEARS, &term.academic_year_id, "academic year")?;
    if term.start_date < year.start_date || term.end_date > year.end_date {
        return Err(AppError::validation("term dates must fall within the academic year"));
    }
    Ok(())
}

fn terms_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    admin_only(session)?;
    let inp = input(ctx.params)?;
    let term = Term {
        id: String::new(),
        academic_year_id: required_str(inp, "academicYearId")?,
        name: required_str(inp, "name")?,
        start_date: required_str(inp, "startDate")?,
        end_date: required_str(inp, "endDate")?,
        is_current: opt_bool(inp, "isCurrent")?.unwrap_or(false),
        created_at: String::new(),
        updated_at: String::new(),
    };
    validate_term(ctx.conn, &term)?;
    let stored = store::insert_typed(ctx.conn, store::TERMS, &term)?;
    if stored.is_current {
        let scope = Query::new(store::TERMS).eq("academicYearId", stored.academic_year_id.as_str());
        clear_current(ctx.conn, scope, &stored.id)?;
    }
    tracing::info!(term = %stored.id, year = %stored.academic_year_id, "term created");
    Ok(json!(stored))
}

fn terms_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let year_id = opt_str(&f, "academicYearId")?;
    if let Some(y) = &year_id {
        require_exists(ctx.conn, store::ACADEMIC_YEARS, y, "academic year")?;
    }
    let q = Query::new(store::TERMS)
        .eq_opt("academicYearId", year_id)
        .eq_opt("isCurrent", opt_bool(&f, "isCurrent")?);
    let mut terms: Vec<Term> = store::query_typed(ctx.conn, &q)?;
    terms.sort_by(|a, b| a.start_date.cmp(&b.start_date));
    Ok(json!({ "terms": terms }))
}

fn terms_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    admin_only(session)?;
    let id = required_str(ctx.params, "id")?;
    let p = patch(ctx.params, PATCHABLE)?;
    let mut term: Term = store::require(ctx.conn, store::TERMS, &id, "term")?;
    term.name = patched_str(p, "name", term.name)?;
    term.start_date = patched_str(p, "startDate", term.start_date)?;
    term.end_date = patched_str(p, "endDate", term.end_date)?;
    if has_key(p, "isCurrent") {
        term.is_current = opt_bool(p, "isCurrent")?.unwrap_or(false);
    }
    validate_term(ctx.conn, &term)?;
    let stored = store::replace_typed(ctx.conn, store::TERMS, &id, &term)?;
    if stored.is_current {
        let scope = Query::new(store::TERMS).eq("academicYearId", stored.academic_year_id.as_str());
        clear_current(ctx.conn, scope, &id)?;
    }
    Ok(json!(stored))
}

fn terms_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    admin_only(session)?;
    let id = required_str(ctx.params, "id")?;
    let removed = store::delete(ctx.conn, store::TERMS, &id)?;
    tracing::info!(term = %id, removed, "term delete");
    Ok(deleted(&id, removed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "academicYears.create" => Some(with_session(state, req, years_create)),
        "academicYears.list" => Some(with_session(state, req, years_list)),
        "academicYears.update" => Some(with_session(state, req, years_update)),
        "academicYears.delete" => Some(with_session(state, req, years_delete)),
        "terms.create" => Some(with_session(state, req, terms_create)),
        "terms.list" => Some(with_session(state, req, terms_list)),
        "terms.update" => Some(with_session(state, req, terms_update)),
        "terms.delete" => Some(with_session(state, req, terms_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::validate_range;

    #[test]
    fn range_allows_single_day_and_rejects_inverted() {
        assert!(validate_range("2024-09-01", "2025-07-15").is_ok());
        assert!(validate_range("2024-09-01", "2024-09-01").is_ok());
        assert!(validate_range("2025-07-15", "2024-09-01").is_err());
        assert!(validate_range("2024-13-01", "2025-01-01").is_err());
    }
}
