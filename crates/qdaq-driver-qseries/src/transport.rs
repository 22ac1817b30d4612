//! Byte-oriented serial link with line-oriented reads.
//!
//! The transport owns the port handle and nothing else: it strips line
//! terminators on input and never interprets payload semantics — that is
//! the codec's job.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use qdaq_core::{QdaqError, Result};
use tracing::{debug, trace};

/// Default timeout for one line read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll granularity of the underlying blocking reads.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A full-duplex byte link to the instrument.
///
/// Implementations: [`SerialTransport`] over real hardware, and
/// [`crate::sim::SimTransport`] over the in-process device model. All
/// methods take `&self`; implementations guard their handle internally so
/// the controller and its reader thread can share one `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// True while the link is open.
    fn is_open(&self) -> bool;

    /// Write raw bytes, returning the count written. No buffering across
    /// calls.
    fn write(&self, bytes: &[u8]) -> Result<usize>;

    /// Read one line, stripping the terminator (CR, LF or CRLF all
    /// accepted). Returns `Ok(None)` on timeout, an error on a closed or
    /// broken link.
    fn read_line(&self, timeout: Duration) -> Result<Option<String>>;

    /// Discard all currently buffered inbound bytes.
    fn flush_input(&self) -> Result<()>;

    /// Close the link. Idempotent.
    fn close(&self);
}

struct SerialIo {
    port: Option<Box<dyn serialport::SerialPort>>,
    /// Bytes received but not yet returned as lines.
    pending: VecDeque<u8>,
    /// Partial line accumulated across reads.
    acc: Vec<u8>,
    /// True when the last terminator seen was CR, so a following LF is
    /// consumed silently (CRLF input).
    last_cr: bool,
}

/// Hardware transport over the `serialport` crate, 8N1, no flow control.
pub struct SerialTransport {
    io: Mutex<SerialIo>,
}

impl SerialTransport {
    /// Open `port` at `baud`.
    pub fn open(port: &str, baud: u32) -> Result<Self> {
        let handle = serialport::new(port, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| QdaqError::PortUnavailable(format!("{port} at {baud} baud: {e}")))?;
        debug!(port, baud, "opened serial port");
        Ok(Self {
            io: Mutex::new(SerialIo {
                port: Some(handle),
                pending: VecDeque::new(),
                acc: Vec::new(),
                last_cr: false,
            }),
        })
    }

    /// Pop the next complete line out of the pending bytes, if any.
    fn take_line(io: &mut SerialIo) -> Option<String> {
        while let Some(byte) = io.pending.pop_front() {
            match byte {
                b'\r' => {
                    io.last_cr = true;
                    let line = std::mem::take(&mut io.acc);
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
                b'\n' => {
                    if io.last_cr {
                        io.last_cr = false;
                        continue;
                    }
                    let line = std::mem::take(&mut io.acc);
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
                other => {
                    io.last_cr = false;
                    io.acc.push(other);
                }
            }
        }
        None
    }
}

impl Transport for SerialTransport {
    fn is_open(&self) -> bool {
        self.io.lock().port.is_some()
    }

    fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut io = self.io.lock();
        let port = io
            .port
            .as_mut()
            .ok_or_else(|| QdaqError::ConnectionLost("serial port is closed".into()))?;
        port.write_all(bytes).map_err(QdaqError::SerialIo)?;
        port.flush().map_err(QdaqError::SerialIo)?;
        trace!(len = bytes.len(), "wrote bytes");
        Ok(bytes.len())
    }

    fn read_line(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let mut io = self.io.lock();
            if let Some(line) = Self::take_line(&mut io) {
                trace!(?line, "read line");
                return Ok(Some(line));
            }
            let port = io
                .port
                .as_mut()
                .ok_or_else(|| QdaqError::ConnectionLost("serial port is closed".into()))?;
            match port.read(&mut buf) {
                Ok(0) => return Err(QdaqError::ConnectionLost("EOF from serial port".into())),
                Ok(n) => {
                    io.pending.extend(&buf[..n]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(QdaqError::SerialIo(e)),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn flush_input(&self) -> Result<()> {
        let mut io = self.io.lock();
        io.pending.clear();
        io.acc.clear();
        io.last_cr = false;
        if let Some(port) = io.port.as_mut() {
            port.clear(serialport::ClearBuffer::Input)
                .map_err(|e| QdaqError::SerialIo(std::io::Error::other(e)))?;
        }
        debug!("flushed input buffer");
        Ok(())
    }

    fn close(&self) {
        let mut io = self.io.lock();
        if io.port.take().is_some() {
            debug!("closed serial port");
        }
        io.pending.clear();
        io.acc.clear();
    }
}
