//! Session descriptor, chunk records and manifest I/O.
//!
//! The manifest is authoritative: a finalized chunk file without a
//! manifest entry is an orphan (a crash landed between rename and manifest
//! rewrite) and is ignored on recovery. Manifest rewrites go through a
//! temporary file that is fsynced before the rename so the manifest on
//! disk is always a consistent prefix of finalized chunks.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use qdaq_core::{QdaqError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Manifest file name inside a session directory.
pub const MANIFEST_NAME: &str = "manifest.json";

/// One finalized chunk file. Immutable once finalized; never listed in the
/// manifest before its file is fully written, fsynced, hashed and renamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// 0-based dense index within the session.
    pub index: u32,
    /// Final file name within the session directory.
    pub name: String,
    /// Exact size of the finalized file in bytes.
    pub byte_size: u64,
    /// Data rows in the file (header excluded).
    pub row_count: u64,
    /// SHA-256 of the finalized file contents, lowercase hex.
    pub sha256_hex: String,
    /// Timestamp of the first row.
    pub start_ts: DateTime<Utc>,
    /// Timestamp of the last row.
    pub end_ts: DateTime<Utc>,
    /// When the chunk was finalized.
    pub finalized_at: DateTime<Utc>,
}

/// One recording session: metadata plus the ordered finalized chunk list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub mission: String,
    pub schema_version: u32,
    /// Nominal acquisition rate, advisory only.
    pub rate_hz: f64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub roll_interval_s: f64,
    /// Directory holding the manifest and chunk files. Not serialized; the
    /// manifest's own location defines it.
    #[serde(skip)]
    pub chunk_dir: PathBuf,
    pub chunks: Vec<ChunkRecord>,
}

impl Session {
    /// Load a session descriptor from `dir/manifest.json`.
    pub fn load(dir: &Path) -> Result<Session> {
        let text = fs::read_to_string(dir.join(MANIFEST_NAME)).map_err(QdaqError::StorageIo)?;
        let mut session: Session = serde_json::from_str(&text).map_err(|e| {
            QdaqError::StorageIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed manifest: {e}"),
            ))
        })?;
        session.chunk_dir = dir.to_path_buf();
        Ok(session)
    }
}

/// Rewrite `dir/manifest.json` atomically: write a temp file, fsync it,
/// then rename over the final name.
pub(crate) fn write_manifest(dir: &Path, session: &Session) -> Result<()> {
    let tmp = dir.join(format!("{MANIFEST_NAME}.tmp"));
    let bytes = serde_json::to_vec_pretty(session).map_err(|e| {
        QdaqError::StorageIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(QdaqError::StorageIo)?;
    file.write_all(&bytes).map_err(QdaqError::StorageIo)?;
    file.sync_all().map_err(QdaqError::StorageIo)?;
    drop(file);
    fs::rename(&tmp, dir.join(MANIFEST_NAME)).map_err(QdaqError::StorageIo)?;
    Ok(())
}

/// Fsync a freshly finalized file by handle.
pub(crate) fn sync_file(file: &File) -> Result<()> {
    file.sync_all().map_err(QdaqError::StorageIo)
}

/// List finalized chunk files present in `dir` but absent from the
/// manifest. Such orphans come from a crash between the chunk rename and
/// the manifest rewrite; the manifest stays authoritative and recovery
/// ignores them, but consumers can surface them.
pub fn scan_orphans(dir: &Path) -> Result<Vec<String>> {
    let session = Session::load(dir)?;
    let mut orphans = Vec::new();
    for entry in fs::read_dir(dir).map_err(QdaqError::StorageIo)? {
        let entry = entry.map_err(QdaqError::StorageIo)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_chunk = name.starts_with("chunk_") && name.ends_with(".csv");
        if is_chunk && !session.chunks.iter().any(|c| c.name == name) {
            warn!(%name, "finalized chunk not listed in manifest");
            orphans.push(name);
        }
    }
    orphans.sort();
    Ok(orphans)
}

/// Recorder lifecycle state, as reported by `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    /// Drain loop running.
    Recording,
    /// A storage error occurred; the loop idles but still accepts `stop()`.
    Failed,
    /// Final chunk rotated and manifest closed out.
    Finished,
}

/// Point-in-time recorder statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderStatus {
    pub state: RecorderState,
    /// Rows written across all chunks, including the open one.
    pub rows: u64,
    /// Bytes written across all chunks, including the open one.
    pub bytes: u64,
    /// Finalized chunks so far.
    pub chunks: u32,
    /// Age of the currently open chunk, if one is open.
    pub current_chunk_age_s: Option<f64>,
}
