//! Background chunk recorder.
//!
//! The recorder borrows a read-only view of the controller's ring buffer
//! (via [`ReadingSource`]) and owns a session directory. Its loop drains
//! readings newer than the last timestamp it has seen, appends them to the
//! open chunk file, and rotates chunks on a wall-clock interval.
//!
//! # Rotation ordering
//!
//! Rotation snapshots the open-chunk fields into locals and nulls the
//! recorder's "current chunk" slot *before* the file handle is flushed and
//! closed. A drain that runs concurrently with a rotation therefore either
//! sees the open chunk (and appends to a live handle) or sees no chunk
//! (and opens a fresh one); there is no window where a non-null field
//! holds a closed handle. Only after close does the chunk get hashed,
//! renamed to its final name — the publication point — and recorded in the
//! manifest.
//!
//! The recorder never slows the controller: if the ring buffer evicts a
//! reading before a drain observes it, that reading is lost. Size the
//! buffer so `capacity / peak_rate_hz` dwarfs the drain interval.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qdaq_core::{CancelToken, QdaqError, Reading, ReadingSource, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk;
use crate::session::{
    self, ChunkRecord, RecorderState, RecorderStatus, Session,
};

/// Default interval between drain passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Options for [`ChunkRecorder::start`].
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// Root directory; the session directory is created beneath it.
    pub root: PathBuf,
    /// Opaque mission label recorded in the manifest.
    pub mission: String,
    /// Nominal acquisition rate, advisory only.
    pub rate_hz: f64,
    /// Schema version tag written to the manifest.
    pub schema_version: u32,
    /// Wall-clock interval after which the open chunk is finalized.
    pub roll_interval: Duration,
    /// Interval between drain passes.
    pub poll_interval: Duration,
}

impl RecorderOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mission: String::new(),
            rate_hz: 0.0,
            schema_version: 1,
            roll_interval: Duration::from_secs(60),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The open chunk's file handle and counters. Owned by the recorder only.
struct OpenChunk {
    file: File,
    tmp_path: PathBuf,
    index: u32,
    rows: u64,
    bytes: u64,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    opened_at: Instant,
}

struct Inner {
    session: Session,
    current: Option<OpenChunk>,
    last_seen: Option<DateTime<Utc>>,
    next_index: u32,
    state: RecorderState,
    rows_total: u64,
    bytes_total: u64,
}

struct Shared {
    source: Arc<dyn ReadingSource>,
    dir: PathBuf,
    roll_interval: Duration,
    inner: Mutex<Inner>,
}

/// Background task draining a [`ReadingSource`] into chunk files.
pub struct ChunkRecorder {
    shared: Arc<Shared>,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChunkRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRecorder")
            .field("dir", &self.shared.dir)
            .field("thread_running", &self.thread.is_some())
            .finish()
    }
}

impl ChunkRecorder {
    /// Create the session directory, write the initial manifest, and spawn
    /// the drain loop.
    ///
    /// Fails with `InvalidState` unless the source is currently acquiring.
    pub fn start(source: Arc<dyn ReadingSource>, opts: RecorderOptions) -> Result<Self> {
        if !source.acquiring() {
            return Err(QdaqError::InvalidState {
                current: source.state(),
                attempted: "start recording",
            });
        }

        let session_id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(&opts.root).map_err(QdaqError::StorageIo)?;
        let dir = opts.root.join(&session_id);
        fs::create_dir(&dir).map_err(QdaqError::StorageIo)?;

        let session = Session {
            session_id: session_id.clone(),
            mission: opts.mission.clone(),
            schema_version: opts.schema_version,
            rate_hz: opts.rate_hz,
            started_at: Utc::now(),
            stopped_at: None,
            roll_interval_s: opts.roll_interval.as_secs_f64(),
            chunk_dir: dir.clone(),
            chunks: Vec::new(),
        };
        session::write_manifest(&dir, &session)?;
        info!(%session_id, dir = %dir.display(), "recording session started");

        let shared = Arc::new(Shared {
            source,
            dir,
            roll_interval: opts.roll_interval,
            inner: Mutex::new(Inner {
                session,
                current: None,
                last_seen: None,
                next_index: 0,
                state: RecorderState::Recording,
                rows_total: 0,
                bytes_total: 0,
            }),
        });

        let token = CancelToken::new();
        let thread = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            let poll_interval = opts.poll_interval;
            thread::Builder::new()
                .name("qdaq-recorder".into())
                .spawn(move || run_loop(shared, token, poll_interval))
                .map_err(QdaqError::StorageIo)?
        };

        Ok(Self {
            shared,
            token,
            thread: Some(thread),
        })
    }

    /// Stop the loop, finalize the current (possibly partial) chunk, stamp
    /// `stopped_at`, and return the finalized session descriptor.
    pub fn stop(mut self) -> Result<Session> {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("recorder thread panicked");
            }
        }
        let mut inner = self.shared.inner.lock();
        // The loop finalizes on its way out; this covers a panicked loop.
        if inner.current.is_some() {
            rotate(&mut inner, &self.shared.dir)?;
        }
        inner.session.stopped_at = Some(Utc::now());
        session::write_manifest(&self.shared.dir, &inner.session)?;
        if inner.state == RecorderState::Recording {
            inner.state = RecorderState::Finished;
        }
        info!(
            session_id = %inner.session.session_id,
            chunks = inner.session.chunks.len(),
            rows = inner.rows_total,
            "recording session stopped"
        );
        Ok(inner.session.clone())
    }

    /// Point-in-time statistics.
    pub fn status(&self) -> RecorderStatus {
        let inner = self.shared.inner.lock();
        RecorderStatus {
            state: inner.state,
            rows: inner.rows_total,
            bytes: inner.bytes_total,
            chunks: inner.session.chunks.len() as u32,
            current_chunk_age_s: inner
                .current
                .as_ref()
                .map(|c| c.opened_at.elapsed().as_secs_f64()),
        }
    }

    /// Current session descriptor (chunk list grows as chunks finalize).
    pub fn session(&self) -> Session {
        self.shared.inner.lock().session.clone()
    }

    /// Finalized chunks so far.
    pub fn snapshots(&self) -> Vec<ChunkRecord> {
        self.shared.inner.lock().session.chunks.clone()
    }

    /// Identifier of this session.
    pub fn session_id(&self) -> String {
        self.shared.inner.lock().session.session_id.clone()
    }

    /// Directory holding this session's manifest and chunks.
    pub fn dir(&self) -> PathBuf {
        self.shared.dir.clone()
    }
}

impl Drop for ChunkRecorder {
    fn drop(&mut self) {
        // Belt-and-braces for a dropped-without-stop recorder.
        self.token.cancel();
    }
}

// =============================================================================
// Drain loop
// =============================================================================

fn run_loop(shared: Arc<Shared>, token: CancelToken, poll_interval: Duration) {
    debug!("recorder loop started");
    loop {
        let cancelled = token.wait_timeout(poll_interval);

        if shared.inner.lock().state == RecorderState::Failed {
            if cancelled {
                break;
            }
            continue;
        }

        if let Err(e) = drain(&shared) {
            error!(error = %e, "recorder drain failed");
            shared.inner.lock().state = RecorderState::Failed;
            continue;
        }

        let acquisition_over = !shared.source.acquiring();
        if cancelled || acquisition_over {
            let mut inner = shared.inner.lock();
            if let Err(e) = rotate(&mut inner, &shared.dir) {
                error!(error = %e, "final chunk rotation failed");
                inner.state = RecorderState::Failed;
            } else if acquisition_over && inner.state == RecorderState::Recording {
                debug!("acquisition stopped; recorder finalized remaining rows");
                inner.state = RecorderState::Finished;
            }
            break;
        }

        let mut inner = shared.inner.lock();
        let roll_due = inner
            .current
            .as_ref()
            .is_some_and(|c| c.opened_at.elapsed() >= shared.roll_interval);
        if roll_due {
            if let Err(e) = rotate(&mut inner, &shared.dir) {
                error!(error = %e, "chunk rotation failed");
                inner.state = RecorderState::Failed;
            }
        }
    }
    debug!("recorder loop stopped");
}

/// Append every reading newer than `last_seen` to the open chunk, opening
/// one if needed.
fn drain(shared: &Shared) -> Result<()> {
    let snapshot = shared.source.snapshot();
    let mut inner = shared.inner.lock();

    let fresh: Vec<&Reading> = match inner.last_seen {
        Some(last) => snapshot.iter().filter(|r| r.timestamp > last).collect(),
        None => snapshot.iter().collect(),
    };
    let Some(last) = fresh.last() else {
        return Ok(());
    };
    let last_ts = last.timestamp;
    let first_ts = fresh[0].timestamp;

    if inner.current.is_none() {
        let index = inner.next_index;
        let tmp_path = shared.dir.join(chunk::tmp_file_name(index));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(QdaqError::StorageIo)?;
        let header = format!("{}\n", chunk::HEADER);
        file.write_all(header.as_bytes())
            .map_err(QdaqError::StorageIo)?;
        inner.next_index += 1;
        inner.current = Some(OpenChunk {
            file,
            tmp_path,
            index,
            rows: 0,
            bytes: header.len() as u64,
            start_ts: first_ts,
            end_ts: first_ts,
            opened_at: Instant::now(),
        });
        debug!(index, "opened chunk");
    }

    let mut batch = String::new();
    for &reading in &fresh {
        batch.push_str(&chunk::format_row(reading));
    }
    let rows = fresh.len() as u64;
    let Some(current) = inner.current.as_mut() else {
        return Ok(());
    };
    current
        .file
        .write_all(batch.as_bytes())
        .map_err(QdaqError::StorageIo)?;
    current.rows += rows;
    current.bytes += batch.len() as u64;
    current.end_ts = last_ts;

    inner.rows_total += rows;
    inner.bytes_total += batch.len() as u64;
    inner.last_seen = Some(last_ts);
    Ok(())
}

/// Finalize the open chunk, if any: clear the recorder's chunk fields
/// first, then fsync and close the handle, hash the file, rename it to its
/// final name, and publish its record in the manifest.
fn rotate(inner: &mut Inner, dir: &std::path::Path) -> Result<()> {
    // Atomic state clear first; see the module docs for why this ordering
    // is mandatory.
    let Some(chunk) = inner.current.take() else {
        return Ok(());
    };
    let OpenChunk {
        file,
        tmp_path,
        index,
        rows,
        bytes,
        start_ts,
        end_ts,
        ..
    } = chunk;

    session::sync_file(&file)?;
    drop(file);

    let data = fs::read(&tmp_path).map_err(QdaqError::StorageIo)?;
    if data.len() as u64 != bytes {
        warn!(
            expected = bytes,
            actual = data.len(),
            "chunk size on disk differs from bytes written"
        );
    }
    let sha256_hex = format!("{:x}", Sha256::digest(&data));

    let name = chunk::chunk_file_name(index);
    fs::rename(&tmp_path, dir.join(&name)).map_err(QdaqError::StorageIo)?;

    let record = ChunkRecord {
        index,
        name: name.clone(),
        byte_size: data.len() as u64,
        row_count: rows,
        sha256_hex,
        start_ts,
        end_ts,
        finalized_at: Utc::now(),
    };
    inner.session.chunks.push(record);
    session::write_manifest(dir, &inner.session)?;
    info!(%name, rows, bytes = data.len(), "finalized chunk");
    Ok(())
}
