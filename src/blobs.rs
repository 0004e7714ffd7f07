use crate::error::{AppError, AppResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const BLOB_DIR: &str = "blobs";

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub path: String,
    pub url: String,
    pub size_bytes: u64,
    pub content_hash: String,
}

/// Path-addressed binary storage rooted at `<workspace>/blobs`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let root = workspace.join(BLOB_DIR);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> AppResult<PathBuf> {
        let mut out = self.root.clone();
        let mut parts = 0;
        for seg in path.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\') {
                return Err(AppError::validation(format!("invalid blob path: {}", path)));
            }
            out.push(seg);
            parts += 1;
        }
        if parts == 0 {
            return Err(AppError::validation("blob path must not be empty"));
        }
        Ok(out)
    }

    pub fn url(&self, path: &str) -> AppResult<String> {
        let full = self.resolve(path)?;
        Ok(format!("file://{}", full.to_string_lossy()))
    }

    pub fn exists(&self, path: &str) -> AppResult<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    pub fn upload(&self, path: &str, bytes: &[u8]) -> AppResult<StoredBlob> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never observe a half-written blob.
        let tmp = full.with_extension("uploading");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &full)?;
        tracing::info!(path, size = bytes.len(), "blob stored");
        Ok(StoredBlob {
            path: path.to_string(),
            url: format!("file://{}", full.to_string_lossy()),
            size_bytes: bytes.len() as u64,
            content_hash: sha256_hex(bytes),
        })
    }

    pub fn read(&self, path: &str) -> AppResult<Vec<u8>> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::not_found(format!("blob not found: {}", path)),
            _ => AppError::from(e),
        })
    }

    /// Removes a blob. An absent blob is not an error; returns whether a
    /// file was actually removed.
    pub fn delete(&self, path: &str) -> AppResult<bool> {
        let full = self.resolve(path)?;
        match std::fs::remove_file(&full) {
            Ok(()) => {
                tracing::info!(path, "blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::from(e)),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Reduces a client-supplied file name to a single safe path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_odd_chars() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\My Notes.pdf"), "My_Notes.pdf");
        assert_eq!(sanitize_file_name(".."), "file");
    }

    #[test]
    fn hash_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
