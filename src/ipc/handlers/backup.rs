use crate::backup;
use crate::error::AppError;
use crate::ipc::error::{app_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::Session;
use serde_json::json;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Bundles hold every record and file, so only administrators may move them.
fn require_admin(state: &AppState, req: &Request) -> Result<Session, serde_json::Value> {
    let Some(conn) = state.db.as_ref() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let session = Session::resolve(conn, &req.params).map_err(|e| app_err(&req.id, &e))?;
    session
        .require_any(&[], "move workspace bundles")
        .map_err(|e| app_err(&req.id, &e))?;
    Ok(session)
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_admin(state, req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let Some(out_path) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    match backup::export_workspace_bundle(&workspace_path, &out_path) {
        Ok(export) => {
            tracing::info!(
                path = %out_path.to_string_lossy(),
                blobs = export.blob_count,
                by = %session.user_id,
                "workspace bundle exported"
            );
            ok(
                &req.id,
                json!({
                    "path": out_path.to_string_lossy(),
                    "bundleFormat": export.bundle_format,
                    "entryCount": export.entry_count,
                    "blobCount": export.blob_count
                }),
            )
        }
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "workspace export failed");
            app_err(&req.id, &AppError::from(e))
        }
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_admin(state, req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let Some(in_path) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Drop open handles before replacing files.
    state.close_workspace();

    let imported = backup::import_workspace_bundle(&in_path, &workspace_path);
    let reopened = state.open_workspace(workspace_path.clone());
    let import = match imported {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "workspace import failed");
            return app_err(&req.id, &AppError::from(e));
        }
    };
    if let Err(e) = reopened {
        return err(&req.id, "db_open_failed", format!("{e:#}"), None);
    }

    tracing::info!(
        path = %in_path.to_string_lossy(),
        blobs = import.blob_count,
        by = %session.user_id,
        "workspace bundle imported"
    );
    ok(
        &req.id,
        json!({
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormatDetected": import.bundle_format_detected,
            "blobCount": import.blob_count
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        _ => None,
    }
}
