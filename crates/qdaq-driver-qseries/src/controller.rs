//! High-level controller for a Q-Series instrument.
//!
//! The controller owns the transport and ring buffer, drives menu
//! navigation and mode selection, and spawns one background reader thread
//! per acquisition mode. All externally visible verbs are methods here.
//!
//! # State machine
//!
//! | From → To | Verb / event |
//! |---|---|
//! | `Disconnected` → `ConfigMenu` | `connect` |
//! | `ConfigMenu` → `ConfigMenu` | `set_averaging`, `set_adc_rate`, `set_mode`, `get_config` |
//! | `ConfigMenu` → `AcqFreerun` / `AcqPolled` | `start` |
//! | `AcqFreerun` / `AcqPolled` → `Paused` | `pause` |
//! | `Paused` → prior acquisition state | `resume` |
//! | acquisition or `Paused` → `ConfigMenu` | `stop` |
//! | any → `Disconnected` | `disconnect` |
//! | any → `Error` | fatal I/O or state-machine violation |
//!
//! Any transition not listed fails with `InvalidState`.
//!
//! # Concurrency
//!
//! Public verbs are serialized by a single controller-level lock. The
//! reader thread holds no controller lock while blocked on I/O; it touches
//! the ring buffer (which has its own lock) and the shared state cell (to
//! escalate to `Error`). Verbs never block on the reader other than via
//! join.
//!
//! # Timing
//!
//! The settle and timeout constants below are observed properties of the
//! firmware, not tunables. In particular, the menu's `X` command exits by
//! way of a full hardware reset; skipping the post-reset settle and input
//! flush races the power-on banner and misclassifies lines.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qdaq_core::codec::{self, LineClass};
use qdaq_core::model::{self, SensorConfig, SensorMode};
use qdaq_core::{
    CancelToken, ControllerState, QdaqError, Reading, ReadingSource, Result, RingBuffer,
};
use tracing::{debug, error, info, warn};

use crate::sim::SimTransport;
use crate::transport::{SerialTransport, Transport, DEFAULT_READ_TIMEOUT};

/// Settle time after opening the port, absorbing the power-on banner.
pub const POST_OPEN_SETTLE: Duration = Duration::from_millis(1200);

/// Timeout for the menu prompt to (re)appear after a command.
pub const MENU_PROMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Settle time after the reset triggered by the menu exit command.
pub const POST_RESET_SETTLE: Duration = Duration::from_millis(1500);

/// Bounded wait when joining a reader thread before escalating to `Error`.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default polling rate for polled-mode acquisition.
pub const DEFAULT_POLL_HZ: f64 = 1.0;

/// Port name that selects the in-process simulator instead of hardware.
pub const SIM_PORT: &str = "SIM";

struct ReaderTask {
    token: CancelToken,
    handle: JoinHandle<()>,
}

struct Verbs {
    transport: Option<Arc<dyn Transport>>,
    config: Option<SensorConfig>,
    sensor_id: String,
    /// Last known good connection parameters, for `reconnect`.
    last_conn: Option<(String, u32)>,
    reader: Option<ReaderTask>,
    /// Acquisition state remembered across `pause` / `resume`.
    paused_mode: Option<ControllerState>,
    poll_hz: f64,
}

/// Stateful driver for one Q-Series instrument.
pub struct SensorController {
    verbs: Mutex<Verbs>,
    state: Arc<Mutex<ControllerState>>,
    buffer: Arc<RingBuffer>,
}

impl SensorController {
    /// Controller with the default ring buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(qdaq_core::ring_buffer::DEFAULT_CAPACITY)
    }

    /// Controller with a fixed ring buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            verbs: Mutex::new(Verbs {
                transport: None,
                config: None,
                sensor_id: String::new(),
                last_conn: None,
                reader: None,
                paused_mode: None,
                poll_hz: DEFAULT_POLL_HZ,
            }),
            state: Arc::new(Mutex::new(ControllerState::Disconnected)),
            buffer: Arc::new(RingBuffer::new(capacity)),
        }
    }

    // =========================================================================
    // Connection management
    // =========================================================================

    /// Open the link and force the device into its config menu.
    ///
    /// The port name [`SIM_PORT`] selects the in-process simulator. On any
    /// failure during the handshake the transport is closed and the
    /// controller stays `Disconnected`.
    pub fn connect(&self, port: &str, baud: u32) -> Result<()> {
        let transport: Arc<dyn Transport> = if port == SIM_PORT {
            Arc::new(SimTransport::new())
        } else {
            Arc::new(SerialTransport::open(port, baud)?)
        };
        self.connect_transport(transport, port, baud)
    }

    /// [`Self::connect`] over a caller-supplied transport (tests inject the
    /// simulator here to keep a handle on it).
    pub fn connect_transport(
        &self,
        transport: Arc<dyn Transport>,
        port: &str,
        baud: u32,
    ) -> Result<()> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::Disconnected], "connect")?;

        info!(port, baud, "connecting to sensor");
        match Self::handshake(&transport) {
            Ok(config) => {
                v.sensor_id = config.sensor_id.clone();
                v.config = Some(config);
                v.transport = Some(transport);
                v.last_conn = Some((port.to_string(), baud));
                self.set_state(ControllerState::ConfigMenu);
                info!(sensor_id = %v.sensor_id, "connected, in config menu");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "connect handshake failed");
                transport.close();
                self.set_state(ControllerState::Disconnected);
                Err(e)
            }
        }
    }

    /// Absorb the power-on banner, enter the menu, read a config snapshot.
    fn handshake(transport: &Arc<dyn Transport>) -> Result<SensorConfig> {
        thread::sleep(POST_OPEN_SETTLE);
        transport.flush_input()?;
        transport.write(codec::menu_enter())?;
        Self::await_prompt(transport, "menu entry")?;
        Self::read_config_snapshot(transport)
    }

    /// Best-effort shutdown from any state. Infallible.
    pub fn disconnect(&self) {
        let mut v = self.verbs.lock();
        if self.state() == ControllerState::Disconnected {
            return;
        }
        info!("disconnecting from sensor");
        if let Some(reader) = v.reader.take() {
            reader.token.cancel();
            if Self::join_bounded(reader.handle).is_err() {
                warn!("reader thread did not stop before disconnect");
            }
        }
        if let Some(transport) = v.transport.take() {
            // Best effort: leave the device parked in its menu.
            let _ = transport.write(codec::menu_enter());
            transport.close();
        }
        v.config = None;
        v.paused_mode = None;
        self.buffer.clear();
        self.set_state(ControllerState::Disconnected);
        info!("disconnected");
    }

    /// Tear down and redo `connect` with the last known good parameters.
    pub fn reconnect(&self) -> Result<()> {
        let last = self.verbs.lock().last_conn.clone();
        let (port, baud) = last.ok_or_else(|| {
            QdaqError::PortUnavailable("no previous connection to re-establish".into())
        })?;
        self.disconnect();
        self.connect(&port, baud)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current configuration snapshot. `ConfigMenu` only.
    pub fn get_config(&self) -> Result<SensorConfig> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::ConfigMenu], "get_config")?;
        match &v.config {
            Some(config) => Ok(config.clone()),
            None => {
                let transport = Self::transport(&v)?;
                let config = Self::read_config_snapshot(&transport)?;
                v.config = Some(config.clone());
                Ok(config)
            }
        }
    }

    /// Set the averaging count (1-65535).
    pub fn set_averaging(&self, n: u32) -> Result<SensorConfig> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::ConfigMenu], "set_averaging")?;
        model::validate_averaging(n)?;

        let transport = Self::transport(&v)?;
        info!(n, "setting averaging");
        transport.write(&codec::menu_command(codec::CMD_SET_AVERAGING))?;
        transport.write(&codec::numeric_reply(n))?;
        Self::await_prompt(&transport, "set_averaging")?;
        Self::refresh_config(&mut v, &transport)
    }

    /// Set the ADC sample rate; must be one of the firmware's discrete set.
    pub fn set_adc_rate(&self, hz: u32) -> Result<SensorConfig> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::ConfigMenu], "set_adc_rate")?;
        model::validate_adc_rate(hz)?;

        let transport = Self::transport(&v)?;
        info!(hz, "setting ADC rate");
        transport.write(&codec::menu_command(codec::CMD_SET_RATE))?;
        transport.write(&codec::numeric_reply(hz))?;
        Self::await_prompt(&transport, "set_adc_rate")?;
        Self::refresh_config(&mut v, &transport)
    }

    /// Set the operating mode. `tag` is required iff `mode` is polled.
    pub fn set_mode(&self, mode: SensorMode, tag: Option<char>) -> Result<SensorConfig> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::ConfigMenu], "set_mode")?;
        match (mode, tag) {
            (SensorMode::Polled, Some(t)) => model::validate_tag(t)?,
            (SensorMode::Polled, None) => {
                return Err(QdaqError::InvalidConfigValue(
                    "polled mode requires a TAG letter".into(),
                ))
            }
            (SensorMode::Freerun, Some(_)) => {
                return Err(QdaqError::InvalidConfigValue(
                    "freerun mode takes no TAG".into(),
                ))
            }
            (SensorMode::Freerun, None) => {}
        }

        let transport = Self::transport(&v)?;
        info!(%mode, ?tag, "setting operating mode");
        transport.write(&codec::menu_command(codec::CMD_SET_MODE))?;
        match mode {
            SensorMode::Freerun => {
                transport.write(&codec::numeric_reply(0))?;
            }
            SensorMode::Polled => {
                transport.write(&codec::numeric_reply(1))?;
                // The unwrap-free path: tag was validated Some above.
                if let Some(t) = tag {
                    transport.write(&codec::menu_command(t))?;
                }
            }
        }
        Self::await_prompt(&transport, "set_mode")?;
        Self::refresh_config(&mut v, &transport)
    }

    // =========================================================================
    // Acquisition control
    // =========================================================================

    /// Exit the menu (device resets) and start acquiring in the configured
    /// mode. `poll_hz` applies to polled mode only.
    pub fn start(&self, poll_hz: f64) -> Result<()> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::ConfigMenu], "start")?;
        let config = v
            .config
            .clone()
            .ok_or(QdaqError::InvalidState {
                current: ControllerState::ConfigMenu,
                attempted: "start without a config snapshot",
            })?;
        if config.mode == SensorMode::Polled && !(poll_hz.is_finite() && poll_hz > 0.0) {
            return Err(QdaqError::InvalidConfigValue(format!(
                "poll_hz must be a positive rate, got {poll_hz}"
            )));
        }

        let transport = Self::transport(&v)?;
        info!(mode = %config.mode, poll_hz, "starting acquisition");
        if let Err(e) = Self::leave_menu(&transport, &config) {
            self.set_state(ControllerState::Error);
            return Err(e);
        }

        v.poll_hz = poll_hz;
        v.paused_mode = None;
        let next = match config.mode {
            SensorMode::Freerun => ControllerState::AcqFreerun,
            SensorMode::Polled => ControllerState::AcqPolled,
        };
        let reader = self.spawn_reader(&v, &transport, &config, poll_hz)?;
        v.reader = Some(reader);
        self.set_state(next);
        info!(mode = %config.mode, "acquisition started");
        Ok(())
    }

    /// Send the menu exit (device reset), absorb the post-reset banner, and
    /// for polled mode prime the device's averaging pipeline.
    fn leave_menu(transport: &Arc<dyn Transport>, config: &SensorConfig) -> Result<()> {
        transport.write(&codec::menu_exit())?;
        // The exit is a hardware reset. Do not try to detect the end of the
        // banner; the settle time is a firmware property.
        thread::sleep(POST_RESET_SETTLE);
        transport.flush_input()?;
        if config.mode == SensorMode::Polled {
            if let Some(tag) = config.tag {
                transport.write(&codec::polled_init(tag))?;
                // Let the device's internal averaging warm up before the
                // first query.
                thread::sleep(config.sample_period() + Duration::from_millis(500));
            }
        }
        Ok(())
    }

    /// Suspend acquisition and park the device in its menu.
    pub fn pause(&self) -> Result<()> {
        let mut v = self.verbs.lock();
        let current = self.state();
        self.require(
            &[ControllerState::AcqFreerun, ControllerState::AcqPolled],
            "pause",
        )?;

        info!("pausing acquisition");
        self.stop_reader(&mut v)?;
        let transport = Self::transport(&v)?;
        transport.write(codec::menu_enter())?;
        if let Err(e) = Self::await_prompt(&transport, "pause") {
            self.set_state(ControllerState::Error);
            return Err(e);
        }
        v.paused_mode = Some(current);
        self.set_state(ControllerState::Paused);
        info!("acquisition paused, in menu");
        Ok(())
    }

    /// Resume the acquisition mode remembered by `pause`.
    pub fn resume(&self) -> Result<()> {
        let mut v = self.verbs.lock();
        self.require(&[ControllerState::Paused], "resume")?;
        // Peek only: the remembered mode must survive a failed resume so
        // the verb can be retried from Paused.
        let target = v.paused_mode.ok_or(QdaqError::InvalidState {
            current: ControllerState::Paused,
            attempted: "resume with no remembered mode",
        })?;
        let poll_hz = v.poll_hz;

        let transport = Self::transport(&v)?;
        info!(?target, "resuming acquisition");
        // Past this point the device leaves the menu; any dialog failure is
        // a link fault, handled the same way for both steps.
        let config = match Self::read_config_snapshot(&transport) {
            Ok(config) => config,
            Err(e) => {
                self.set_state(ControllerState::Error);
                return Err(e);
            }
        };
        v.sensor_id = config.sensor_id.clone();
        v.config = Some(config.clone());

        if let Err(e) = Self::leave_menu(&transport, &config) {
            self.set_state(ControllerState::Error);
            return Err(e);
        }
        let reader = match self.spawn_reader(&v, &transport, &config, poll_hz) {
            Ok(reader) => reader,
            Err(e) => {
                self.set_state(ControllerState::Error);
                return Err(e);
            }
        };
        v.reader = Some(reader);
        v.paused_mode = None;
        self.set_state(target);
        info!("acquisition resumed");
        Ok(())
    }

    /// Stop acquiring and return to the config menu.
    pub fn stop(&self) -> Result<()> {
        let mut v = self.verbs.lock();
        self.require(
            &[
                ControllerState::AcqFreerun,
                ControllerState::AcqPolled,
                ControllerState::Paused,
            ],
            "stop",
        )?;

        info!("stopping acquisition");
        self.stop_reader(&mut v)?;
        // Always re-enter the menu, so ConfigMenu is guaranteed on success
        // even when called from Paused.
        let transport = Self::transport(&v)?;
        transport.write(codec::menu_enter())?;
        if let Err(e) = Self::await_prompt(&transport, "stop") {
            self.set_state(ControllerState::Error);
            return Err(e);
        }
        v.paused_mode = None;
        self.set_state(ControllerState::ConfigMenu);
        info!("acquisition stopped, in menu");
        Ok(())
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Copy of the buffered readings, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.buffer.snapshot()
    }

    /// Most recent reading, if any.
    pub fn latest(&self) -> Option<Reading> {
        self.buffer.latest()
    }

    /// Drop all buffered readings.
    pub fn clear_buffer(&self) {
        self.buffer.clear();
    }

    /// Readings evicted from the ring buffer since construction.
    pub fn overflow_count(&self) -> u64 {
        self.buffer.evicted_count()
    }

    /// Current controller state.
    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() != ControllerState::Disconnected
    }

    /// Device identifier captured at connect time.
    pub fn sensor_id(&self) -> String {
        self.verbs.lock().sensor_id.clone()
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn set_state(&self, next: ControllerState) {
        *self.state.lock() = next;
    }

    fn require(&self, allowed: &[ControllerState], attempted: &'static str) -> Result<()> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(QdaqError::InvalidState { current, attempted })
        }
    }

    fn transport(v: &Verbs) -> Result<Arc<dyn Transport>> {
        v.transport
            .clone()
            .ok_or_else(|| QdaqError::ConnectionLost("no transport".into()))
    }

    /// Issue-and-await-prompt primitive: read lines until the menu prompt
    /// reappears, skipping banner chatter, numeric echoes and anything else
    /// the firmware interleaves. A device error banner fails the dialog; a
    /// missing prompt is `MenuTimeout`.
    fn await_prompt(transport: &Arc<dyn Transport>, dialog: &'static str) -> Result<()> {
        let deadline = Instant::now() + MENU_PROMPT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QdaqError::MenuTimeout(dialog));
            }
            match transport.read_line(remaining.min(DEFAULT_READ_TIMEOUT))? {
                Some(line) => match codec::classify(&line) {
                    LineClass::MenuPrompt => return Ok(()),
                    LineClass::ErrorBanner(fault) => {
                        return Err(QdaqError::InvalidConfigValue(format!("{fault}: {line}")))
                    }
                    other => debug!(?other, ?line, "skipping line while awaiting prompt"),
                },
                None => {}
            }
        }
    }

    /// Send `^`, parse the CSV dump, then wait for the prompt to return.
    fn read_config_snapshot(transport: &Arc<dyn Transport>) -> Result<SensorConfig> {
        transport.write(&codec::menu_command(codec::CMD_CONFIG_DUMP))?;
        let deadline = Instant::now() + MENU_PROMPT_TIMEOUT;
        let config = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QdaqError::MenuTimeout("config dump"));
            }
            match transport.read_line(remaining.min(DEFAULT_READ_TIMEOUT))? {
                Some(line) if codec::classify(&line) == LineClass::ConfigDump => {
                    break codec::parse_config_dump(&line)?;
                }
                Some(line) => debug!(?line, "skipping line while awaiting config dump"),
                None => {}
            }
        };
        Self::await_prompt(transport, "config dump")?;
        debug!(?config, "read config snapshot");
        Ok(config)
    }

    fn refresh_config(v: &mut Verbs, transport: &Arc<dyn Transport>) -> Result<SensorConfig> {
        let config = Self::read_config_snapshot(transport)?;
        v.sensor_id = config.sensor_id.clone();
        v.config = Some(config.clone());
        Ok(config)
    }

    fn spawn_reader(
        &self,
        v: &Verbs,
        transport: &Arc<dyn Transport>,
        config: &SensorConfig,
        poll_hz: f64,
    ) -> Result<ReaderTask> {
        let token = CancelToken::new();
        let ctx = ReaderCtx {
            token: token.clone(),
            transport: Arc::clone(transport),
            buffer: Arc::clone(&self.buffer),
            state: Arc::clone(&self.state),
            sensor_id: v.sensor_id.clone(),
        };
        let mode = config.mode;
        let tag = config.tag;
        let handle = thread::Builder::new()
            .name("qseries-reader".into())
            .spawn(move || match mode {
                SensorMode::Freerun => freerun_reader(ctx),
                SensorMode::Polled => polled_reader(ctx, tag.unwrap_or('A'), poll_hz),
            })
            .map_err(QdaqError::SerialIo)?;
        Ok(ReaderTask { token, handle })
    }

    /// Cancel and join the reader, escalating to `Error` on a stuck join.
    fn stop_reader(&self, v: &mut Verbs) -> Result<()> {
        if let Some(reader) = v.reader.take() {
            reader.token.cancel();
            if Self::join_bounded(reader.handle).is_err() {
                error!("reader thread did not stop within the join timeout");
                self.set_state(ControllerState::Error);
                return Err(QdaqError::ConnectionLost(
                    "reader task did not stop".into(),
                ));
            }
        }
        Ok(())
    }

    fn join_bounded(handle: JoinHandle<()>) -> std::result::Result<(), ()> {
        let deadline = Instant::now() + READER_JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(());
            }
            thread::sleep(Duration::from_millis(10));
        }
        handle.join().map_err(|_| ())
    }
}

impl Default for SensorController {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingSource for SensorController {
    fn state(&self) -> ControllerState {
        SensorController::state(self)
    }

    fn snapshot(&self) -> Vec<Reading> {
        SensorController::snapshot(self)
    }
}

// =============================================================================
// Reader tasks
// =============================================================================

struct ReaderCtx {
    token: CancelToken,
    transport: Arc<dyn Transport>,
    buffer: Arc<RingBuffer>,
    state: Arc<Mutex<ControllerState>>,
    sensor_id: String,
}

impl ReaderCtx {
    /// Stamp with the current UTC instant, clamped so timestamps never go
    /// backwards within a session even if the wall clock steps.
    fn stamp(&self, last: &mut Option<DateTime<Utc>>) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now < prev {
                now = prev;
            }
        }
        *last = Some(now);
        now
    }

    fn append(&self, ts: DateTime<Utc>, mode: SensorMode, sample: codec::RawSample) {
        self.buffer.append(Reading {
            timestamp: ts,
            sensor_id: self.sensor_id.clone(),
            mode,
            value: sample.value,
            temp_c: sample.temp_c,
            vin: sample.vin,
        });
    }

    fn escalate(&self, why: &str) {
        error!(why, "reader escalating to error state");
        *self.state.lock() = ControllerState::Error;
    }
}

fn freerun_reader(ctx: ReaderCtx) {
    debug!("freerun reader started");
    let mut last_ts = None;
    while !ctx.token.is_cancelled() {
        match ctx.transport.read_line(DEFAULT_READ_TIMEOUT) {
            Ok(None) => {}
            Ok(Some(line)) => match codec::classify(&line) {
                LineClass::FreerunReading => match codec::parse_freerun(&line) {
                    Ok(sample) => {
                        let ts = ctx.stamp(&mut last_ts);
                        ctx.append(ts, SensorMode::Freerun, sample);
                    }
                    Err(e) => debug!(error = %e, "skipping unparseable freerun line"),
                },
                LineClass::MenuPrompt => {
                    ctx.escalate("unexpected menu prompt during freerun");
                    break;
                }
                other => debug!(?other, ?line, "dropping non-data line"),
            },
            Err(e) => {
                if ctx.token.is_cancelled() {
                    break;
                }
                ctx.escalate(&format!("freerun read failed: {e}"));
                break;
            }
        }
    }
    debug!("freerun reader stopped");
}

fn polled_reader(ctx: ReaderCtx, tag: char, poll_hz: f64) {
    debug!(%tag, poll_hz, "polled reader started");
    let period = Duration::from_secs_f64(1.0 / poll_hz);
    let mut last_ts = None;
    loop {
        // Cancellable cadence wait, not a plain sleep: stop must be prompt.
        if ctx.token.wait_timeout(period) {
            break;
        }
        if let Err(e) = ctx.transport.write(&codec::polled_query(tag)) {
            if !ctx.token.is_cancelled() {
                ctx.escalate(&format!("polled query write failed: {e}"));
            }
            break;
        }
        match ctx.transport.read_line(DEFAULT_READ_TIMEOUT) {
            Ok(None) => warn!(%tag, "no response to polled query"),
            Ok(Some(line)) => match codec::classify(&line) {
                LineClass::PolledReading => match codec::parse_polled(&line, tag) {
                    Ok(sample) => {
                        let ts = ctx.stamp(&mut last_ts);
                        ctx.append(ts, SensorMode::Polled, sample);
                    }
                    Err(e) => warn!(error = %e, "rejecting polled response"),
                },
                LineClass::MenuPrompt => {
                    ctx.escalate("unexpected menu prompt during polled acquisition");
                    break;
                }
                other => debug!(?other, ?line, "dropping non-data line"),
            },
            Err(e) => {
                if ctx.token.is_cancelled() {
                    break;
                }
                ctx.escalate(&format!("polled read failed: {e}"));
                break;
            }
        }
    }
    debug!("polled reader stopped");
}
