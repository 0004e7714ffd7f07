use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    deleted, filters, input, opt_bool, opt_i64, opt_str, require_exists, required_str,
    with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Role, StoredFile};
use crate::session::Session;
use crate::store::{self, Direction, Query};
use crate::uploads::{self, NewUpload, UploadKind};
use serde_json::{json, Value};
use std::path::Path;

fn read_source(source_path: &str) -> AppResult<Vec<u8>> {
    let path = Path::new(source_path);
    if !path.is_file() {
        return Err(AppError::not_found(format!("source file not found: {}", source_path)));
    }
    Ok(std::fs::read(path)?)
}

fn handle_upload(ctx: &Ctx, session: &Session, kind: UploadKind) -> AppResult<Value> {
    if kind == UploadKind::Resource {
        session.require_any(&[Role::Headteacher, Role::Teacher], "upload teaching resources")?;
    }
    let inp = input(ctx.params)?;
    let source_path = required_str(inp, "sourcePath")?;
    let file_name = match opt_str(inp, "fileName")? {
        Some(n) => n,
        None => Path::new(&source_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::validation("cannot derive fileName from sourcePath"))?,
    };
    let subject_id = opt_str(inp, "subjectId")?;
    if let Some(s) = &subject_id {
        require_exists(ctx.conn, store::SUBJECTS, s, "subject")?;
    }
    let class_id = opt_str(inp, "classId")?;
    if let Some(c) = &class_id {
        require_exists(ctx.conn, store::CLASSES, c, "class")?;
    }
    let bytes = read_source(&source_path)?;

    let meta = uploads::upload(
        ctx.conn,
        ctx.blobs,
        kind,
        NewUpload {
            owner_id: session.user_id.clone(),
            title: opt_str(inp, "title")?.unwrap_or_else(|| file_name.clone()),
            description: opt_str(inp, "description")?.unwrap_or_default(),
            subject_id,
            class_id,
            file_name,
        },
        &bytes,
    )?;
    Ok(json!(meta))
}

fn handle_list(ctx: &Ctx, session: &Session, kind: UploadKind) -> AppResult<Value> {
    let f = filters(ctx.params)?;
    let owner = match kind {
        // Personal uploads are private to their owner unless an
        // administrator asks.
        UploadKind::Document if !session.is_staff_admin() => Some(session.user_id.clone()),
        _ => opt_str(&f, "ownerId")?,
    };
    let mut q = Query::new(kind.collection())
        .eq_opt("ownerId", owner)
        .eq_opt("subjectId", opt_str(&f, "subjectId")?)
        .eq_opt("classId", opt_str(&f, "classId")?);
    if !opt_bool(&f, "includePending")?.unwrap_or(false) {
        q = q.eq("state", "committed");
    }
    q = q.order_by("createdAt", Direction::Desc);
    match opt_i64(&f, "limit")? {
        Some(n) if n > 0 => q = q.limit(n as usize),
        Some(_) => return Err(AppError::validation("limit must be > 0")),
        None => {}
    }
    let files: Vec<StoredFile> = store::query_typed(ctx.conn, &q)?;
    Ok(json!({ "files": files }))
}

fn handle_delete(ctx: &Ctx, session: &Session, kind: UploadKind) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    if let Some(meta) = store::get_typed::<StoredFile>(ctx.conn, kind.collection(), &id)? {
        session.require_owner_or_admin(&meta.owner_id, "delete this file")?;
    }
    let removed = uploads::delete(ctx.conn, ctx.blobs, kind, &id)?;
    Ok(deleted(&id, removed))
}

fn resources_upload(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    handle_upload(ctx, session, UploadKind::Resource)
}

fn resources_list(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    handle_list(ctx, session, UploadKind::Resource)
}

fn resources_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    handle_delete(ctx, session, UploadKind::Resource)
}

fn documents_upload(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    handle_upload(ctx, session, UploadKind::Document)
}

fn documents_list(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    handle_list(ctx, session, UploadKind::Document)
}

fn documents_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    handle_delete(ctx, session, UploadKind::Document)
}

fn uploads_reconcile(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "reconcile uploads")?;
    let resources = uploads::reconcile(ctx.conn, ctx.blobs, UploadKind::Resource)?;
    let documents = uploads::reconcile(ctx.conn, ctx.blobs, UploadKind::Document)?;
    Ok(json!({ "resources": resources, "documents": documents }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "resources.upload" => Some(with_session(state, req, resources_upload)),
        "resources.list" => Some(with_session(state, req, resources_list)),
        "resources.delete" => Some(with_session(state, req, resources_delete)),
        "documents.upload" => Some(with_session(state, req, documents_upload)),
        "documents.list" => Some(with_session(state, req, documents_list)),
        "documents.delete" => Some(with_session(state, req, documents_delete)),
        "uploads.reconcile" => Some(with_session(state, req, uploads_reconcile)),
        _ => None,
    }
}
