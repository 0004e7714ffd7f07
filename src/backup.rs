use crate::blobs::BLOB_DIR;
use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/school.sqlite3";
const BLOB_PREFIX: &str = "blobs/";
pub const BUNDLE_FORMAT: &str = "schoold-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub blob_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub blob_count: usize,
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.to_string_lossy()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    // Deterministic entry order.
    entries.sort();
    for p in entries {
        if p.is_dir() {
            collect_files(&p, out)?;
        } else if p.is_file() {
            out.push(p);
        }
    }
    Ok(())
}

fn blob_entry_name(blob_root: &Path, file: &Path) -> anyhow::Result<String> {
    let rel = file
        .strip_prefix(blob_root)
        .with_context(|| format!("blob outside blob root: {}", file.to_string_lossy()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(format!("{}{}", BLOB_PREFIX, parts.join("/")))
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let blob_root = workspace_path.join(BLOB_DIR);
    let mut blob_files = Vec::new();
    collect_files(&blob_root, &mut blob_files)?;

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": crate::store::now_iso(),
        "blobCount": blob_files.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    for file in &blob_files {
        let name = blob_entry_name(&blob_root, file)?;
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        let mut f = File::open(file)
            .with_context(|| format!("failed to open blob {}", file.to_string_lossy()))?;
        std::io::copy(&mut f, &mut zip).with_context(|| format!("failed to write entry {}", name))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 2 + blob_files.len(),
        blob_count: blob_files.len(),
    })
}

/// Entry name under `blobs/`, as a relative path made only of normal
/// components.
fn blob_entry_path(name: &str) -> anyhow::Result<PathBuf> {
    let rel = Path::new(name.strip_prefix(BLOB_PREFIX).unwrap_or(""));
    let safe = rel.components().next().is_some()
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(anyhow!("unsafe entry name in bundle: {}", name));
    }
    Ok(rel.to_path_buf())
}

fn remove_if_present(path: &Path) {
    let _ = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
}

/// Extracts the database to `db_tmp` and every blob under `blob_stage`.
fn stage_bundle(
    archive: &mut ZipArchive<File>,
    db_tmp: &Path,
    blob_stage: &Path,
) -> anyhow::Result<usize> {
    let mut blob_entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).context("failed to read bundle entry")?;
        if entry.is_dir() || !entry.name().starts_with(BLOB_PREFIX) {
            continue;
        }
        blob_entries.push((i, blob_entry_path(entry.name())?));
    }

    let mut db_out = File::create(db_tmp).with_context(|| {
        format!("failed to create temp database {}", db_tmp.to_string_lossy())
    })?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/school.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;

    std::fs::create_dir_all(blob_stage)
        .with_context(|| format!("failed to create {}", blob_stage.to_string_lossy()))?;
    for (i, rel) in &blob_entries {
        let mut entry = archive.by_index(*i).context("failed to read bundle entry")?;
        let target = blob_stage.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("failed to create {}", target.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {}", target.to_string_lossy()))?;
    }
    Ok(blob_entries.len())
}

/// Restores database and blobs. Everything is staged next to the live
/// files first; the live workspace is only touched once every entry has
/// been extracted. The caller must have closed its connection to the
/// target workspace database.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let dst = workspace_path.join(DB_FILE_NAME);
    let db_tmp = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    let blob_root = workspace_path.join(BLOB_DIR);
    let blob_stage = workspace_path.join(format!("{}.importing", BLOB_DIR));
    let blob_prev = workspace_path.join(format!("{}.previous", BLOB_DIR));
    remove_if_present(&db_tmp);
    remove_if_present(&blob_stage);
    remove_if_present(&blob_prev);

    let blob_count = match stage_bundle(&mut archive, &db_tmp, &blob_stage) {
        Ok(n) => n,
        Err(e) => {
            remove_if_present(&db_tmp);
            remove_if_present(&blob_stage);
            return Err(e);
        }
    };

    // Blobs are replaced wholesale so the restored metadata and files agree.
    if blob_root.exists() {
        if let Err(e) = std::fs::rename(&blob_root, &blob_prev) {
            remove_if_present(&db_tmp);
            remove_if_present(&blob_stage);
            return Err(e).with_context(|| {
                format!("failed to set aside blobs {}", blob_root.to_string_lossy())
            });
        }
    }
    let swapped = std::fs::rename(&blob_stage, &blob_root)
        .with_context(|| format!("failed to move restored blobs to {}", blob_root.to_string_lossy()))
        .and_then(|()| {
            std::fs::rename(&db_tmp, &dst).with_context(|| {
                format!(
                    "failed to move extracted database to {}",
                    dst.to_string_lossy()
                )
            })
        });
    if let Err(e) = swapped {
        remove_if_present(&db_tmp);
        remove_if_present(&blob_stage);
        if blob_prev.exists() {
            remove_if_present(&blob_root);
            let _ = std::fs::rename(&blob_prev, &blob_root);
        }
        return Err(e);
    }
    remove_if_present(&blob_prev);

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT.to_string(),
        blob_count,
    })
}
