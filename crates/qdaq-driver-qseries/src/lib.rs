//! Serial protocol driver for Q-Series instruments.
//!
//! The device's wire protocol is an interactive configuration menu with
//! timing-dependent echoes and a reset-to-exit command, not an RPC surface.
//! This crate owns the stateful side of that protocol:
//!
//! - [`Transport`]: a byte-oriented full-duplex link with line-oriented
//!   reads ([`SerialTransport`] for hardware, [`SimTransport`] for tests),
//! - [`SensorController`]: the state machine that navigates the menu,
//!   switches acquisition modes, and feeds parsed readings into the ring
//!   buffer from a background reader thread.

pub mod controller;
pub mod sim;
pub mod transport;

pub use controller::{SensorController, DEFAULT_POLL_HZ, SIM_PORT};
pub use sim::{SimOptions, SimTransport};
pub use transport::{SerialTransport, Transport, DEFAULT_READ_TIMEOUT};
