use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, input, opt_str, patch, patched_opt_str, patched_str, require_exists,
    required_str, string_list, with_session, with_workspace, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Role, UserProfile};
use crate::session::Session;
use crate::store::{self, Query};
use rusqlite::Connection;
use serde_json::{json, Value};

const PATCHABLE: &[&str] = &[
    "email",
    "displayName",
    "role",
    "department",
    "qualifications",
    "phone",
    "classId",
    "parentName",
    "parentEmail",
    "parentPhone",
];

fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
        .unwrap_or(false);
    if !valid {
        return Err(AppError::validation("email is not valid"));
    }
    Ok(email)
}

fn parse_role(obj: &Value) -> AppResult<Role> {
    let raw = required_str(obj, "role")?;
    Role::parse(&raw).ok_or_else(|| {
        AppError::validation("role must be one of: admin, headteacher, teacher, student")
    })
}

fn email_taken(conn: &Connection, email: &str, except_id: Option<&str>) -> AppResult<bool> {
    let hits: Vec<UserProfile> = store::query_typed(conn, &Query::new(store::USERS).eq("email", email))?;
    Ok(hits.iter().any(|u| Some(u.id.as_str()) != except_id))
}

/// Student-only fields are dropped for other roles.
fn clear_student_fields(p: &mut UserProfile) {
    if p.role != Role::Student {
        p.class_id = None;
        p.parent_name = None;
        p.parent_email = None;
        p.parent_phone = None;
    }
}

fn users_register(ctx: &Ctx) -> AppResult<Value> {
    let inp = input(ctx.params)?;
    let role = parse_role(inp)?;
    let email = normalize_email(&required_str(inp, "email")?)?;
    let display_name = required_str(inp, "displayName")?;

    if matches!(role, Role::Admin | Role::Headteacher) {
        let empty_workspace = store::count(ctx.conn, store::USERS)? == 0;
        let bootstrap = empty_workspace && role == Role::Admin;
        if !bootstrap {
            let session = Session::resolve(ctx.conn, ctx.params)?;
            session.require_any(&[], "create administrative accounts")?;
        }
    }
    if email_taken(ctx.conn, &email, None)? {
        return Err(AppError::conflict("email already in use"));
    }

    let mut profile = UserProfile {
        id: String::new(),
        email,
        display_name,
        role,
        department: opt_str(inp, "department")?,
        qualifications: string_list(inp, "qualifications")?.unwrap_or_default(),
        phone: opt_str(inp, "phone")?,
        class_id: opt_str(inp, "classId")?,
        parent_name: opt_str(inp, "parentName")?,
        parent_email: opt_str(inp, "parentEmail")?,
        parent_phone: opt_str(inp, "parentPhone")?,
        created_at: String::new(),
        updated_at: String::new(),
    };
    clear_student_fields(&mut profile);
    if let Some(class_id) = &profile.class_id {
        require_exists(ctx.conn, store::CLASSES, class_id, "class")?;
    }
    let stored = store::insert_typed(ctx.conn, store::USERS, &profile)?;
    tracing::info!(user = %stored.id, role = role.as_str(), "user registered");
    Ok(json!(stored))
}

fn users_get(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    let profile: UserProfile = store::require(ctx.conn, store::USERS, &id, "user")?;
    Ok(json!(profile))
}

fn users_list(ctx: &Ctx, _session: &Session) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let role = match opt_str(&f, "role")? {
        Some(r) => Some(
            Role::parse(&r)
                .ok_or_else(|| AppError::validation("unknown role filter"))?
                .as_str(),
        ),
        None => None,
    };
    let q = Query::new(store::USERS)
        .eq_opt("role", role)
        .eq_opt("classId", opt_str(&f, "classId")?)
        .eq_opt("department", opt_str(&f, "department")?);
    let mut users: Vec<UserProfile> = store::query_typed(ctx.conn, &q)?;
    users.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(json!({ "users": users }))
}

fn users_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    let p = patch(ctx.params, PATCHABLE)?;
    let mut profile: UserProfile = store::require(ctx.conn, store::USERS, &id, "user")?;
    session.require_owner_or_admin(&profile.id, "edit this profile")?;

    if p.get("role").is_some() {
        session.require_any(&[], "change roles")?;
        profile.role = parse_role(p)?;
    }
    if p.get("email").is_some() {
        let email = normalize_email(&required_str(p, "email")?)?;
        if email_taken(ctx.conn, &email, Some(&profile.id))? {
            return Err(AppError::conflict("email already in use"));
        }
        profile.email = email;
    }
    profile.display_name = patched_str(p, "displayName", profile.display_name)?;
    profile.department = patched_opt_str(p, "department", profile.department)?;
    if p.get("qualifications").is_some() {
        profile.qualifications = string_list(p, "qualifications")?.unwrap_or_default();
    }
    profile.phone = patched_opt_str(p, "phone", profile.phone)?;
    profile.class_id = patched_opt_str(p, "classId", profile.class_id)?;
    profile.parent_name = patched_opt_str(p, "parentName", profile.parent_name)?;
    profile.parent_email = patched_opt_str(p, "parentEmail", profile.parent_email)?;
    profile.parent_phone = patched_opt_str(p, "parentPhone", profile.parent_phone)?;
    clear_student_fields(&mut profile);
    if let Some(class_id) = &profile.class_id {
        require_exists(ctx.conn, store::CLASSES, class_id, "class")?;
    }

    let stored = store::replace_typed(ctx.conn, store::USERS, &id, &profile)?;
    tracing::info!(user = %id, by = %session.user_id, "user updated");
    Ok(json!(stored))
}

fn users_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    if session.user_id != id {
        session.require_any(&[], "delete other accounts")?;
    }
    let removed = store::delete(ctx.conn, store::USERS, &id)?;
    tracing::info!(user = %id, by = %session.user_id, removed, "user delete");
    Ok(deleted(&id, removed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.register" => Some(with_workspace(state, req, users_register)),
        "users.get" => Some(with_session(state, req, users_get)),
        "users.list" => Some(with_session(state, req, users_list)),
        "users.update" => Some(with_session(state, req, users_update)),
        "users.delete" => Some(with_session(state, req, users_delete)),
        _ => None,
    }
}
