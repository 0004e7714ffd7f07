//! JSON document collections on top of the workspace SQLite database.
//!
//! Every entity lives in the single `documents` table keyed by
//! `(collection, id)`. Reads are described by a [`Query`] value and executed
//! by [`query`]; predicates are evaluated with SQLite's JSON1 functions.

use crate::error::{AppError, AppResult};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use uuid::Uuid;

/// Maximum number of values sent in one `IN (...)` predicate. Larger lists
/// are split and the partial results concatenated.
pub const IN_CHUNK_SIZE: usize = 10;

pub const USERS: &str = "users";
pub const GRADES: &str = "grades";
pub const ATTENDANCE: &str = "attendance";
pub const LESSON_PLANS: &str = "lessonPlans";
pub const TIMETABLE: &str = "timetable";
pub const SUBJECTS: &str = "subjects";
pub const CLASSES: &str = "classes";
pub const ACADEMIC_YEARS: &str = "academicYears";
pub const TERMS: &str = "terms";
pub const ASSIGNMENTS: &str = "assignments";
pub const RESOURCES: &str = "resources";
pub const DOCUMENTS: &str = "documents";

/// Fields owned by the store; patches never touch them.
const RESERVED_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    ArrayContains,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub collection: &'static str,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: &'static str) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<JsonValue>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    /// Adds an equality predicate only when a value is present.
    pub fn eq_opt<V: Into<JsonValue>>(self, field: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.eq(field, v),
            None => self,
        }
    }

    pub fn is_in<V: Into<JsonValue>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let list: Vec<JsonValue> = values.into_iter().map(Into::into).collect();
        self.filter(field, FilterOp::In, JsonValue::Array(list))
    }

    pub fn array_contains(self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.filter(field, FilterOp::ArrayContains, value)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn validate_field(field: &str) -> AppResult<()> {
    let ok = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::validation(format!("invalid field name: {}", field)))
    }
}

fn json_path(field: &str) -> AppResult<String> {
    validate_field(field)?;
    Ok(format!("$.{}", field))
}

fn sql_value(v: &JsonValue) -> AppResult<Value> {
    match v {
        JsonValue::Null => Ok(Value::Null),
        // json_extract yields 1/0 for JSON booleans.
        JsonValue::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(Value::Real(n.as_f64().unwrap_or(0.0)))
            }
        }
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        JsonValue::Array(_) | JsonValue::Object(_) => Err(AppError::validation(
            "filter values must be scalars",
        )),
    }
}

/// Builds the WHERE clause for every filter except an `In` list, which is
/// handled by the caller per chunk.
fn push_predicate(
    filter: &Filter,
    clauses: &mut Vec<String>,
    bind: &mut Vec<Value>,
) -> AppResult<()> {
    let path = json_path(&filter.field)?;
    match filter.op {
        FilterOp::Eq if filter.value.is_null() => {
            clauses.push("json_extract(body, ?) IS NULL".to_string());
            bind.push(Value::Text(path));
        }
        FilterOp::Eq | FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
            let op = match filter.op {
                FilterOp::Eq => "=",
                FilterOp::Lt => "<",
                FilterOp::Lte => "<=",
                FilterOp::Gt => ">",
                _ => ">=",
            };
            clauses.push(format!("json_extract(body, ?) {} ?", op));
            bind.push(Value::Text(path));
            bind.push(sql_value(&filter.value)?);
        }
        FilterOp::ArrayContains => {
            clauses.push(
                "EXISTS (SELECT 1 FROM json_each(body, ?) je WHERE je.value = ?)".to_string(),
            );
            bind.push(Value::Text(path));
            bind.push(sql_value(&filter.value)?);
        }
        FilterOp::In => {
            return Err(AppError::validation("only one `in` filter per query"));
        }
    }
    Ok(())
}

fn run_select(
    conn: &Connection,
    collection: &str,
    clauses: &[String],
    bind: Vec<Value>,
    order_by: Option<&(String, Direction)>,
    limit: Option<usize>,
) -> AppResult<Vec<JsonValue>> {
    let mut sql = String::from("SELECT body FROM documents WHERE collection = ?");
    let mut all_bind = vec![Value::Text(collection.to_string())];
    for c in clauses {
        sql.push_str(" AND ");
        sql.push_str(c);
    }
    all_bind.extend(bind);
    match order_by {
        Some((field, dir)) => {
            sql.push_str(" ORDER BY json_extract(body, ?) ");
            sql.push_str(if *dir == Direction::Asc { "ASC" } else { "DESC" });
            sql.push_str(", rowid");
            all_bind.push(Value::Text(json_path(field)?));
        }
        None => sql.push_str(" ORDER BY rowid"),
    }
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    tracing::debug!(collection, sql = %sql, "document query");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(all_bind), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter()
        .map(|text| serde_json::from_str(text).map_err(AppError::from))
        .collect()
}

/// Orders JSON scalars the way SQLite orders them: null, numbers, text.
/// `json_extract` yields booleans as the integers 1/0, so they sort among
/// the numbers.
pub fn cmp_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) | JsonValue::Number(_) => 1,
            JsonValue::String(_) => 2,
            _ => 3,
        }
    }
    fn numeric(v: &JsonValue) -> Option<f64> {
        match v {
            JsonValue::Number(n) => Some(n.as_f64().unwrap_or(0.0)),
            JsonValue::Bool(b) => Some(i64::from(*b) as f64),
            _ => None,
        }
    }
    match (a, b) {
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

/// Executes a query and returns raw JSON documents.
pub fn query(conn: &Connection, q: &Query) -> AppResult<Vec<JsonValue>> {
    let mut clauses = Vec::new();
    let mut bind = Vec::new();
    let mut in_filter: Option<&Filter> = None;
    for f in &q.filters {
        if f.op == FilterOp::In {
            if in_filter.is_some() {
                return Err(AppError::validation("only one `in` filter per query"));
            }
            in_filter = Some(f);
            continue;
        }
        push_predicate(f, &mut clauses, &mut bind)?;
    }

    let Some(in_filter) = in_filter else {
        return run_select(
            conn,
            q.collection,
            &clauses,
            bind,
            q.order_by.as_ref(),
            q.limit,
        );
    };

    let values = in_filter
        .value
        .as_array()
        .ok_or_else(|| AppError::validation("`in` filter needs a list of values"))?;
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let path = json_path(&in_filter.field)?;

    let chunks: Vec<&[JsonValue]> = values.chunks(IN_CHUNK_SIZE).collect();
    let chunk_count = chunks.len();
    let mut out = Vec::new();
    for chunk in chunks {
        let mut chunk_clauses = clauses.clone();
        let mut chunk_bind = bind.clone();
        let placeholders = vec!["?"; chunk.len()].join(", ");
        chunk_clauses.push(format!("json_extract(body, ?) IN ({})", placeholders));
        chunk_bind.push(Value::Text(path.clone()));
        for v in chunk {
            chunk_bind.push(sql_value(v)?);
        }
        // Limits only make sense once chunks are merged.
        let limit = if chunk_count == 1 { q.limit } else { None };
        out.extend(run_select(
            conn,
            q.collection,
            &chunk_clauses,
            chunk_bind,
            q.order_by.as_ref(),
            limit,
        )?);
    }

    if chunk_count > 1 {
        if let Some((field, dir)) = &q.order_by {
            out.sort_by(|a, b| {
                let ord = cmp_json(
                    a.get(field).unwrap_or(&JsonValue::Null),
                    b.get(field).unwrap_or(&JsonValue::Null),
                );
                if *dir == Direction::Asc {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(n) = q.limit {
            out.truncate(n);
        }
    }
    Ok(out)
}

pub fn query_typed<T: DeserializeOwned>(conn: &Connection, q: &Query) -> AppResult<Vec<T>> {
    query(conn, q)?
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(AppError::from))
        .collect()
}

pub fn get(conn: &Connection, collection: &str, id: &str) -> AppResult<Option<JsonValue>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ? AND id = ?",
            (collection, id),
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn get_typed<T: DeserializeOwned>(
    conn: &Connection,
    collection: &str,
    id: &str,
) -> AppResult<Option<T>> {
    match get(conn, collection, id)? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

/// Like [`get_typed`] but a missing document is a `NotFound` error naming
/// `what`.
pub fn require<T: DeserializeOwned>(
    conn: &Connection,
    collection: &str,
    id: &str,
    what: &str,
) -> AppResult<T> {
    get_typed(conn, collection, id)?.ok_or_else(|| AppError::not_found(format!("{} not found", what)))
}

pub fn exists(conn: &Connection, collection: &str, id: &str) -> AppResult<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM documents WHERE collection = ? AND id = ?",
            (collection, id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn to_object(value: JsonValue) -> AppResult<Map<String, JsonValue>> {
    match value {
        JsonValue::Object(m) => Ok(m),
        _ => Err(AppError::validation("document must be a JSON object")),
    }
}

/// Writes a new document with a generated id and fresh timestamps and
/// returns the stored body.
pub fn insert(conn: &Connection, collection: &str, data: JsonValue) -> AppResult<JsonValue> {
    let mut body = to_object(data)?;
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    body.insert("id".into(), JsonValue::String(id.clone()));
    body.insert("createdAt".into(), JsonValue::String(now.clone()));
    body.insert("updatedAt".into(), JsonValue::String(now.clone()));
    let body = JsonValue::Object(body);
    conn.execute(
        "INSERT INTO documents(collection, id, body, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (collection, &id, serde_json::to_string(&body)?, &now, &now),
    )?;
    tracing::debug!(collection, id = %id, "document inserted");
    Ok(body)
}

pub fn insert_typed<T: Serialize + DeserializeOwned>(
    conn: &Connection,
    collection: &str,
    value: &T,
) -> AppResult<T> {
    let stored = insert(conn, collection, serde_json::to_value(value)?)?;
    Ok(serde_json::from_value(stored)?)
}

fn write_body(
    conn: &Connection,
    collection: &str,
    id: &str,
    mut body: Map<String, JsonValue>,
) -> AppResult<JsonValue> {
    let now = now_iso();
    body.insert("id".into(), JsonValue::String(id.to_string()));
    body.insert("updatedAt".into(), JsonValue::String(now.clone()));
    let body = JsonValue::Object(body);
    let changed = conn.execute(
        "UPDATE documents SET body = ?, updated_at = ? WHERE collection = ? AND id = ?",
        (serde_json::to_string(&body)?, &now, collection, id),
    )?;
    if changed == 0 {
        return Err(AppError::not_found(format!("{} document not found", collection)));
    }
    Ok(body)
}

/// Merges top-level fields of `patch` into an existing document (last write
/// wins) and refreshes `updatedAt`.
pub fn update(
    conn: &Connection,
    collection: &str,
    id: &str,
    patch: Map<String, JsonValue>,
) -> AppResult<JsonValue> {
    let current = get(conn, collection, id)?
        .ok_or_else(|| AppError::not_found(format!("{} document not found", collection)))?;
    let mut body = to_object(current)?;
    for (k, v) in patch {
        if RESERVED_FIELDS.contains(&k.as_str()) {
            continue;
        }
        body.insert(k, v);
    }
    write_body(conn, collection, id, body)
}

/// Overwrites a document with a full typed value, keeping `createdAt`.
pub fn replace_typed<T: Serialize + DeserializeOwned>(
    conn: &Connection,
    collection: &str,
    id: &str,
    value: &T,
) -> AppResult<T> {
    let created_at = get(conn, collection, id)?
        .and_then(|v| v.get("createdAt").cloned())
        .ok_or_else(|| AppError::not_found(format!("{} document not found", collection)))?;
    let mut body = to_object(serde_json::to_value(value)?)?;
    body.insert("createdAt".into(), created_at);
    let stored = write_body(conn, collection, id, body)?;
    Ok(serde_json::from_value(stored)?)
}

/// Unconditional hard delete. Returns whether a document was removed.
pub fn delete(conn: &Connection, collection: &str, id: &str) -> AppResult<bool> {
    let n = conn.execute(
        "DELETE FROM documents WHERE collection = ? AND id = ?",
        (collection, id),
    )?;
    tracing::debug!(collection, id, removed = n, "document delete");
    Ok(n > 0)
}

pub fn count(conn: &Connection, collection: &str) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE collection = ?",
        [collection],
        |r| r.get(0),
    )?)
}
