//! Core types and pure logic for the Q-Series acquisition engine.
//!
//! This crate is the leaf of the engine: it performs no I/O and spawns no
//! tasks. It provides:
//!
//! - the error taxonomy ([`QdaqError`]),
//! - the data model ([`Reading`], [`SensorConfig`], [`ControllerState`]),
//! - the wire codec for the 2150 REV 4.003 firmware ([`codec`]),
//! - the bounded lossy FIFO between acquisition and consumers
//!   ([`RingBuffer`]),
//! - the cancellation primitive shared by all background tasks
//!   ([`CancelToken`]),
//! - the seam trait the recorder consumes ([`ReadingSource`]).

pub mod cancel;
pub mod codec;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod ring_buffer;

pub use cancel::CancelToken;
pub use error::{QdaqError, Result};
pub use model::{ControllerState, Reading, SensorConfig, SensorMode};
pub use pipeline::ReadingSource;
pub use ring_buffer::RingBuffer;
