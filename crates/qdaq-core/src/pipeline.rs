//! Seam between acquisition and downstream consumers.

use crate::model::{ControllerState, Reading};

/// A source of buffered readings the recorder can drain.
///
/// The controller implements this over its ring buffer; tests implement it
/// with a scripted fake. The recorder uses [`ReadingSource::acquiring`] to
/// detect that acquisition stopped underneath it and finalize cleanly.
pub trait ReadingSource: Send + Sync {
    /// Current controller state.
    fn state(&self) -> ControllerState;

    /// Copy of the currently buffered readings, in insertion order.
    fn snapshot(&self) -> Vec<Reading>;

    /// True while readings may still be produced.
    fn acquiring(&self) -> bool {
        self.state().is_acquiring()
    }
}
