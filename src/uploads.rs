//! File uploads with metadata documents.
//!
//! Uploads write the metadata document first in `pending` state, then the
//! blob, then flip the document to `committed`. Deletes flip to `deleting`,
//! remove the blob, then remove the document. A crash between steps leaves a
//! document whose state says exactly what is unfinished; [`reconcile`]
//! completes or rolls back every such document.

use crate::blobs::{sanitize_file_name, sha256_hex, BlobStore};
use crate::error::AppResult;
use crate::models::{StoredFile, UploadState};
use crate::store::{self, Query};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Map};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// Shared teaching material, `resources/<uid>/<name>_<millis>`.
    Resource,
    /// Personal uploads, `uploads/<uid>/<name>`.
    Document,
}

impl UploadKind {
    pub fn collection(self) -> &'static str {
        match self {
            Self::Resource => store::RESOURCES,
            Self::Document => store::DOCUMENTS,
        }
    }

    pub fn storage_path(self, owner_id: &str, file_name: &str, millis: i64) -> String {
        let name = sanitize_file_name(file_name);
        match self {
            Self::Resource => format!("resources/{}/{}_{}", owner_id, name, millis),
            Self::Document => format!("uploads/{}/{}", owner_id, name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub subject_id: Option<String>,
    pub class_id: Option<String>,
    pub file_name: String,
}

pub fn upload(
    conn: &Connection,
    blobs: &BlobStore,
    kind: UploadKind,
    input: NewUpload,
    bytes: &[u8],
) -> AppResult<StoredFile> {
    let millis = chrono::Utc::now().timestamp_millis();
    let storage_path = kind.storage_path(&input.owner_id, &input.file_name, millis);
    let pending = StoredFile {
        id: String::new(),
        owner_id: input.owner_id,
        title: input.title,
        description: input.description,
        subject_id: input.subject_id,
        class_id: input.class_id,
        file_name: sanitize_file_name(&input.file_name),
        storage_path: storage_path.clone(),
        url: None,
        size_bytes: 0,
        content_hash: None,
        state: UploadState::Pending,
        created_at: String::new(),
        updated_at: String::new(),
    };
    let mut meta = store::insert_typed(conn, kind.collection(), &pending)?;

    let blob = match blobs.upload(&storage_path, bytes) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(id = %meta.id, path = %storage_path, error = %e, "blob upload failed; metadata left pending");
            return Err(e);
        }
    };

    meta.url = Some(blob.url);
    meta.size_bytes = blob.size_bytes;
    meta.content_hash = Some(blob.content_hash);
    meta.state = UploadState::Committed;
    let committed = store::replace_typed(conn, kind.collection(), &meta.id, &meta)?;
    supersede_older(conn, kind, &committed)?;

    tracing::info!(id = %committed.id, path = %storage_path, "upload committed");
    Ok(committed)
}

/// Same owner + file name addresses the same document blob, so the newest
/// committed metadata replaces every other document at that path.
fn supersede_older(conn: &Connection, kind: UploadKind, committed: &StoredFile) -> AppResult<()> {
    if kind != UploadKind::Document {
        return Ok(());
    }
    let older: Vec<StoredFile> = store::query_typed(
        conn,
        &Query::new(kind.collection()).eq("storagePath", committed.storage_path.as_str()),
    )?;
    for doc in older.iter().filter(|d| d.id != committed.id) {
        store::delete(conn, kind.collection(), &doc.id)?;
        tracing::info!(id = %doc.id, path = %committed.storage_path, "superseded upload metadata removed");
    }
    Ok(())
}

/// Returns `false` when no document with that id exists.
pub fn delete(
    conn: &Connection,
    blobs: &BlobStore,
    kind: UploadKind,
    id: &str,
) -> AppResult<bool> {
    let Some(meta) = store::get_typed::<StoredFile>(conn, kind.collection(), id)? else {
        return Ok(false);
    };
    let mut patch = Map::new();
    patch.insert("state".into(), json!(UploadState::Deleting));
    store::update(conn, kind.collection(), id, patch)?;

    if let Err(e) = blobs.delete(&meta.storage_path) {
        tracing::warn!(id, path = %meta.storage_path, error = %e, "blob delete failed; metadata left deleting");
        return Err(e);
    }
    store::delete(conn, kind.collection(), id)?;
    tracing::info!(id, path = %meta.storage_path, "upload deleted");
    Ok(true)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Pending uploads whose blob was present and are now committed.
    pub committed: usize,
    /// Pending uploads without a blob, removed.
    pub rolled_back: usize,
    /// Interrupted deletes that were finished.
    pub deleted: usize,
}

pub fn reconcile(
    conn: &Connection,
    blobs: &BlobStore,
    kind: UploadKind,
) -> AppResult<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let pending: Vec<StoredFile> = store::query_typed(
        conn,
        &Query::new(kind.collection()).eq("state", "pending"),
    )?;
    for mut meta in pending {
        // Already removed as superseded by an earlier row in this pass.
        if !store::exists(conn, kind.collection(), &meta.id)? {
            continue;
        }
        if blobs.exists(&meta.storage_path)? {
            // The blob may hold an older upload's bytes when this one never
            // reached the write; describe what is actually stored.
            let bytes = blobs.read(&meta.storage_path)?;
            meta.url = Some(blobs.url(&meta.storage_path)?);
            meta.size_bytes = bytes.len() as u64;
            meta.content_hash = Some(sha256_hex(&bytes));
            meta.state = UploadState::Committed;
            let committed = store::replace_typed(conn, kind.collection(), &meta.id, &meta)?;
            supersede_older(conn, kind, &committed)?;
            report.committed += 1;
        } else {
            store::delete(conn, kind.collection(), &meta.id)?;
            report.rolled_back += 1;
        }
    }

    let deleting: Vec<StoredFile> = store::query_typed(
        conn,
        &Query::new(kind.collection()).eq("state", "deleting"),
    )?;
    for meta in deleting {
        blobs.delete(&meta.storage_path)?;
        store::delete(conn, kind.collection(), &meta.id)?;
        report.deleted += 1;
    }

    tracing::info!(
        collection = kind.collection(),
        committed = report.committed,
        rolled_back = report.rolled_back,
        deleted = report.deleted,
        "uploads reconciled"
    );
    Ok(report)
}
