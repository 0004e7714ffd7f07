use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::blobs::BlobStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub blobs: Option<BlobStore>,
}

impl AppState {
    /// Opens (creating if needed) the workspace database and blob store.
    pub fn open_workspace(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let conn = crate::db::open_db(&path)?;
        let blobs = BlobStore::open(&path)?;
        tracing::info!(workspace = %path.to_string_lossy(), "workspace opened");
        self.workspace = Some(path);
        self.db = Some(conn);
        self.blobs = Some(blobs);
        Ok(())
    }

    pub fn close_workspace(&mut self) {
        self.db = None;
        self.blobs = None;
    }
}
