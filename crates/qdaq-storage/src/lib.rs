//! Crash-safe chunked recording for the Q-Series acquisition engine.
//!
//! A [`ChunkRecorder`] drains readings from a [`qdaq_core::ReadingSource`]
//! into a directory of CSV chunk files plus a JSON manifest. Chunks rotate
//! on a wall-clock interval; every finalized chunk is fsynced, hashed
//! (SHA-256) and renamed from its temporary name before its record enters
//! the manifest, so the manifest on disk always describes a consistent
//! prefix of finalized chunks.

pub mod chunk;
pub mod recorder;
pub mod session;

pub use recorder::{ChunkRecorder, RecorderOptions, DEFAULT_POLL_INTERVAL};
pub use session::{ChunkRecord, RecorderState, RecorderStatus, Session, MANIFEST_NAME};
