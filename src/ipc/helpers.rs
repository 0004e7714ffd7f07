use crate::blobs::BlobStore;
use crate::error::{AppError, AppResult};
use crate::ipc::error::{app_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::Session;
use rusqlite::Connection;
use serde_json::{Map, Value};

/// What a handler body gets to work with.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub blobs: &'a BlobStore,
    pub params: &'a Value,
}

fn respond(req: &Request, result: AppResult<Value>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code(), error = %e, "request failed");
            app_err(&req.id, &e)
        }
    }
}

pub fn with_workspace<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Ctx) -> AppResult<Value>,
{
    let (Some(conn), Some(blobs)) = (state.db.as_ref(), state.blobs.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = Ctx {
        conn,
        blobs,
        params: &req.params,
    };
    respond(req, f(&ctx))
}

pub fn with_session<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Ctx, &Session) -> AppResult<Value>,
{
    with_workspace(state, req, |ctx| {
        let session = Session::resolve(ctx.conn, ctx.params)?;
        tracing::debug!(
            user = %session.user_id,
            name = %session.display_name,
            role = session.role.as_str(),
            "session resolved"
        );
        f(ctx, &session)
    })
}

pub fn required_str(obj: &Value, key: &str) -> AppResult<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::validation(format!("missing {}", key)))
}

/// Absent, null and blank strings all read as `None`.
pub fn opt_str(obj: &Value, key: &str) -> AppResult<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
        Some(_) => Err(AppError::validation(format!("{} must be string or null", key))),
    }
}

pub fn required_f64(obj: &Value, key: &str) -> AppResult<f64> {
    obj.get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::validation(format!("{} must be a number", key)))
}

pub fn opt_i64(obj: &Value, key: &str) -> AppResult<Option<i64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| AppError::validation(format!("{} must be integer", key))),
    }
}

pub fn opt_bool(obj: &Value, key: &str) -> AppResult<Option<bool>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| AppError::validation(format!("{} must be boolean", key))),
    }
}

/// A list of trimmed strings; blank items are rejected rather than dropped.
pub fn string_list(obj: &Value, key: &str) -> AppResult<Option<Vec<String>>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let s = item
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        AppError::validation(format!("{} items must be non-empty strings", key))
                    })?;
                out.push(s.to_string());
            }
            Ok(Some(out))
        }
        Some(_) => Err(AppError::validation(format!("{} must be a list", key))),
    }
}

/// `params.input` for creates.
pub fn input(params: &Value) -> AppResult<&Value> {
    match params.get("input") {
        Some(v) if v.is_object() => Ok(v),
        _ => Err(AppError::validation("input must be an object")),
    }
}

/// `params.patch` for updates, rejecting keys outside `allowed`.
pub fn patch<'a>(params: &'a Value, allowed: &[&str]) -> AppResult<&'a Value> {
    let p = params
        .get("patch")
        .filter(|v| v.is_object())
        .ok_or_else(|| AppError::validation("patch must be an object"))?;
    if let Some(obj) = p.as_object() {
        for k in obj.keys() {
            if !allowed.contains(&k.as_str()) {
                return Err(AppError::validation(format!("unknown patch field: {}", k)));
            }
        }
    }
    Ok(p)
}

/// `params.filters`, defaulting to an empty object.
pub fn filters(params: &Value) -> AppResult<Value> {
    match params.get("filters") {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(v) if v.is_object() => Ok(v.clone()),
        Some(_) => Err(AppError::validation("filters must be an object")),
    }
}

pub fn has_key(obj: &Value, key: &str) -> bool {
    obj.get(key).is_some()
}

/// Field present in a patch with a non-null value, or explicitly cleared.
pub fn patched_opt_str(
    patch: &Value,
    key: &str,
    current: Option<String>,
) -> AppResult<Option<String>> {
    if has_key(patch, key) {
        opt_str(patch, key)
    } else {
        Ok(current)
    }
}

pub fn patched_str(patch: &Value, key: &str, current: String) -> AppResult<String> {
    if has_key(patch, key) {
        required_str(patch, key)
    } else {
        Ok(current)
    }
}

pub fn require_date(value: &str, key: &str) -> AppResult<()> {
    if crate::models::is_date(value) {
        Ok(())
    } else {
        Err(AppError::validation(format!("{} must be YYYY-MM-DD", key)))
    }
}

pub fn require_hhmm(value: &str, key: &str) -> AppResult<()> {
    if crate::models::is_hhmm(value) {
        Ok(())
    } else {
        Err(AppError::validation(format!("{} must be HH:MM", key)))
    }
}

pub fn require_exists(conn: &Connection, collection: &str, id: &str, what: &str) -> AppResult<()> {
    if crate::store::exists(conn, collection, id)? {
        Ok(())
    } else {
        Err(AppError::not_found(format!("{} not found", what)))
    }
}

pub fn deleted(id: &str, removed: bool) -> Value {
    serde_json::json!({ "id": id, "deleted": removed })
}
