//! In-process model of a Q-Series instrument for tests.
//!
//! `SimTransport` implements [`Transport`] over a scripted device model of
//! the 2150 REV 4.003 firmware: the interactive menu with its prompts and
//! echoes, the reset-to-exit sequence with its post-reset banner, freerun
//! streaming at `adc_rate_hz / averaging` Hz, and polled init/query
//! handling. The same controller code path drives hardware and simulator.
//!
//! Data values are deterministic (a small ramp around 100.0) so tests can
//! assert on counts without flakiness. Two extra hooks exist for tests:
//! [`SimTransport::inject_line`] queues an arbitrary inbound line, and
//! [`SimTransport::bytes_written`] counts every byte the host has sent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use qdaq_core::{CancelToken, QdaqError, Result};
use tracing::{debug, trace};

use crate::transport::Transport;

/// Identity knobs for the simulated device.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub serial_number: String,
    pub firmware_version: String,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            serial_number: "Q12345".into(),
            firmware_version: "4.003".into(),
        }
    }
}

/// Which prompt the menu is waiting to fill with the next input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuInput {
    Averaging,
    Rate,
    Mode,
    Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceMode {
    Menu,
    Freerun,
    Polled,
}

/// Simulated EEPROM contents.
struct Eeprom {
    averaging: u32,
    adc_rate_hz: u32,
    polled: bool,
    tag: char,
    include_temp: bool,
    include_vin: bool,
    preamble: String,
    calfactor: f64,
}

struct SimState {
    open: bool,
    eeprom: Eeprom,
    mode: DeviceMode,
    pending: Option<MenuInput>,
    /// Polled sampling must be initialized with `*<TAG>Q000!` first.
    polled_inited: bool,
    outq: VecDeque<String>,
    inbuf: Vec<u8>,
    bytes_written: u64,
    stream_stop: Option<CancelToken>,
    sample_n: u64,
}

struct SimDevice {
    opts: SimOptions,
    state: Mutex<SimState>,
    out_ready: Condvar,
}

/// Scripted Q-Series device behind the [`Transport`] interface.
pub struct SimTransport {
    dev: Arc<SimDevice>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::with_options(SimOptions::default())
    }

    pub fn with_options(opts: SimOptions) -> Self {
        let dev = Arc::new(SimDevice {
            opts,
            state: Mutex::new(SimState {
                open: true,
                eeprom: Eeprom {
                    averaging: 125,
                    adc_rate_hz: 125,
                    polled: false,
                    tag: 'A',
                    include_temp: false,
                    include_vin: false,
                    preamble: String::new(),
                    calfactor: 1.0,
                },
                mode: DeviceMode::Menu,
                pending: None,
                polled_inited: false,
                outq: VecDeque::new(),
                inbuf: Vec::new(),
                bytes_written: 0,
                stream_stop: None,
                sample_n: 0,
            }),
            out_ready: Condvar::new(),
        });

        // Power-on: banner, then the stored operating mode takes over.
        {
            let mut st = dev.state.lock();
            dev.push_banner(&mut st);
            SimDevice::enter_run_mode(&dev, &mut st);
        }
        Self { dev }
    }

    /// Queue an arbitrary inbound line, as if the device had sent it.
    pub fn inject_line(&self, line: &str) {
        let mut st = self.dev.state.lock();
        st.outq.push_back(line.to_string());
        self.dev.out_ready.notify_all();
    }

    /// Total bytes the host has written since construction.
    pub fn bytes_written(&self) -> u64 {
        self.dev.state.lock().bytes_written
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    fn push(&self, st: &mut SimState, line: impl Into<String>) {
        st.outq.push_back(line.into());
        self.out_ready.notify_all();
    }

    fn push_prompt(&self, st: &mut SimState) {
        self.push(st, "");
        self.push(st, "Select the letter of the menu entry:");
    }

    fn push_banner(&self, st: &mut SimState) {
        let version = self.opts.firmware_version.clone();
        let serial = self.opts.serial_number.clone();
        self.push(st, "");
        self.push(
            st,
            format!("Biospherical Instruments Inc: Digital Engine Vers {version}"),
        );
        self.push(st, format!("Unit ID {serial}"));
        if st.eeprom.polled {
            let tag = st.eeprom.tag;
            self.push(st, format!("Operating in polled mode with tag of {tag}"));
        } else {
            self.push(st, "Operating in free run mode");
        }
        self.push(
            st,
            format!("ADC sample rate {}, gain 1", st.eeprom.adc_rate_hz),
        );
        if st.eeprom.averaging > 1 {
            self.push(st, format!("Averaging {} readings", st.eeprom.averaging));
        } else {
            self.push(st, "No Averaging");
        }
        self.push(st, "Sensor temperature: 21.50 C");
        self.push(st, "Input Supply Voltage: 12.345v");
        self.push(st, format!("Calfactor: {:.6}", st.eeprom.calfactor));
    }

    fn push_menu(&self, st: &mut SimState) {
        let version = self.opts.firmware_version.clone();
        self.push(st, "");
        self.push(
            st,
            format!("Biospherical Instruments Inc: Digital Log Engine v: {version}"),
        );
        self.push(st, format!("Model: {}", self.opts.serial_number));
        self.push(
            st,
            format!(
                "A to set number of samples averaged before update: {}",
                st.eeprom.averaging
            ),
        );
        let mode_digit = if st.eeprom.polled { 1 } else { 0 };
        self.push(
            st,
            format!(
                "M to set the operating mode (0=streaming, 1=polled with tag= {}) currently {}",
                st.eeprom.tag, mode_digit
            ),
        );
        self.push(
            st,
            format!("R to set ADC sample rate: {}", st.eeprom.adc_rate_hz),
        );
        self.push(st, "X to restart sampling");
    }

    fn config_dump_line(&self, st: &SimState) -> String {
        let e = &st.eeprom;
        format!(
            "{},9600,{:.6},,E,{},G,H,{},1.000000,0.000000,12.345,{},{},{},{},{},{}",
            e.averaging,
            e.calfactor,
            self.opts.firmware_version,
            self.opts.serial_number,
            if e.polled { 1 } else { 0 },
            if e.polled { e.tag.to_string() } else { String::new() },
            e.preamble,
            if e.include_temp { 1 } else { 0 },
            if e.include_vin { 1 } else { 0 },
            e.adc_rate_hz,
        )
    }

    /// Deterministic sample line, optionally TAG-prefixed for polled mode.
    fn data_line(&self, st: &mut SimState, tagged: bool) -> String {
        let n = st.sample_n;
        st.sample_n += 1;
        let value = 100.0 + (n % 16) as f64 * 0.125;
        let mut line = if tagged {
            format!("{},{}{:.6}", st.eeprom.tag, st.eeprom.preamble, value)
        } else {
            format!("{}{:.6}", st.eeprom.preamble, value)
        };
        if st.eeprom.include_temp {
            line.push_str(&format!(", {:.2}", 21.0 + (n % 8) as f64 * 0.05));
        }
        if st.eeprom.include_vin {
            line.push_str(&format!(", {:.3}", 12.3 + (n % 4) as f64 * 0.01));
        }
        line
    }

    fn stop_stream(&self, st: &mut SimState) {
        if let Some(token) = st.stream_stop.take() {
            token.cancel();
        }
    }

    fn start_stream(dev: &Arc<SimDevice>, st: &mut SimState) {
        let token = CancelToken::new();
        st.stream_stop = Some(token.clone());
        let period =
            Duration::from_secs_f64(st.eeprom.averaging as f64 / st.eeprom.adc_rate_hz as f64);
        let dev = Arc::clone(dev);
        thread::spawn(move || loop {
            {
                let mut st = dev.state.lock();
                if !st.open || st.mode != DeviceMode::Freerun || token.is_cancelled() {
                    break;
                }
                let line = dev.data_line(&mut st, false);
                dev.push(&mut st, line);
            }
            if token.wait_timeout(period) {
                break;
            }
        });
    }

    fn enter_run_mode(dev: &Arc<SimDevice>, st: &mut SimState) {
        st.pending = None;
        if st.eeprom.polled {
            st.mode = DeviceMode::Polled;
            st.polled_inited = false;
            dev.push(st, "Entering polled mainline sampling");
        } else {
            st.mode = DeviceMode::Freerun;
            dev.push(st, "Start free run sampling");
            Self::start_stream(dev, st);
        }
    }

    fn enter_menu(dev: &Arc<SimDevice>, st: &mut SimState) {
        dev.stop_stream(st);
        st.mode = DeviceMode::Menu;
        st.pending = None;
        dev.push_banner(st);
        dev.push_menu(st);
        dev.push_prompt(st);
    }

    fn reset(dev: &Arc<SimDevice>, st: &mut SimState) {
        dev.stop_stream(st);
        dev.push(st, "Calling reset!");
        dev.push(st, "Rebooting program");
        dev.push_banner(st);
        Self::enter_run_mode(dev, st);
    }

    fn handle_menu_command(dev: &Arc<SimDevice>, st: &mut SimState, cmd: &str) {
        let Some(first) = cmd.chars().next() else {
            return;
        };

        // A TAG prompt consumes the next single-letter input.
        if st.pending == Some(MenuInput::Tag) {
            if cmd.len() == 1 && first.is_ascii_uppercase() {
                st.eeprom.tag = first;
            } else {
                dev.push(st, " Bad TAG ");
            }
            st.pending = None;
            dev.push_prompt(st);
            return;
        }

        if first.is_ascii_digit() {
            dev.handle_numeric_input(st, cmd);
            return;
        }

        match first {
            'A' => {
                st.pending = Some(MenuInput::Averaging);
                dev.push(
                    st,
                    "If you set this to 125 averaged and use R command to set ADC rate to",
                );
                dev.push(st, "125 samples per second, then you will get data at roughly 1hz.");
                dev.push(st, "Enter # readings to average before update (1-65535): ");
            }
            'R' => {
                st.pending = Some(MenuInput::Rate);
                dev.push(st, "Enter ADC rate (4, 8, 16, 33, 62, 125, 250* Hz)");
                dev.push(st, " *250Hz is at reduced resolution     ---- Enter selection: ");
            }
            'M' => {
                st.pending = Some(MenuInput::Mode);
                dev.push(
                    st,
                    "Set operating mode.  Mode 0 is freerun, 1 is polled.  Polled require a TAG to be defined",
                );
                dev.push(st, "Enter the operating mode number: ");
            }
            '^' => {
                let dump = dev.config_dump_line(st);
                dev.push(st, dump);
                dev.push_prompt(st);
            }
            'X' => Self::reset(dev, st),
            _ => dev.push_prompt(st),
        }
    }

    fn handle_numeric_input(&self, st: &mut SimState, cmd: &str) {
        let value: Option<u32> = cmd.parse().ok();
        match st.pending.take() {
            Some(MenuInput::Averaging) => match value {
                Some(n) if (1..=65_535).contains(&n) => {
                    st.eeprom.averaging = n;
                    self.push(st, format!("{n} was entered"));
                    self.push(st, "");
                    self.push(st, format!("ADC set to averaging {n}"));
                    self.push_prompt(st);
                }
                _ => {
                    st.eeprom.averaging = 12;
                    self.push(
                        st,
                        "****Invalid number, averaging set to 12 which updates once per second.",
                    );
                    self.push_prompt(st);
                }
            },
            Some(MenuInput::Rate) => match value {
                Some(hz) if qdaq_core::model::VALID_ADC_RATES.contains(&hz) => {
                    st.eeprom.adc_rate_hz = hz;
                    self.push(st, "");
                    self.push(st, format!("ADC rate set to {hz}"));
                    self.push_prompt(st);
                }
                _ => {
                    self.push(st, "");
                    self.push(st, "Invalid rate!!! Command is ignored.");
                    self.push_prompt(st);
                }
            },
            Some(MenuInput::Mode) => match value {
                Some(0) => {
                    st.eeprom.polled = false;
                    self.push(st, "0");
                    self.push_prompt(st);
                }
                Some(1) => {
                    st.eeprom.polled = true;
                    st.pending = Some(MenuInput::Tag);
                    self.push(
                        st,
                        "Enter the single character that will be the tag used in polling (A-F) UPPER case",
                    );
                    self.push(
                        st,
                        "Note tags G-Z may not be supported in some Biospherical acquisition software : ",
                    );
                }
                _ => {
                    self.push(st, "I am confused");
                    self.push_prompt(st);
                }
            },
            _ => self.push_prompt(st),
        }
    }

    fn handle_polled_command(&self, st: &mut SimState, cmd: &str) {
        if cmd.starts_with('*') && cmd.ends_with('!') && cmd.contains('Q') {
            if cmd.chars().nth(1) == Some(st.eeprom.tag) {
                st.polled_inited = true;
                debug!(tag = %st.eeprom.tag, "polled sampling initialized");
            }
            // No response to the init command either way.
        } else if let Some(rest) = cmd.strip_prefix('>') {
            if rest.chars().next() == Some(st.eeprom.tag) && st.polled_inited {
                let line = self.data_line(st, true);
                self.push(st, line);
            }
            // Mismatched or uninitialized queries get no response; the host
            // read times out.
        }
    }

    fn process_input(dev: &Arc<SimDevice>, st: &mut SimState) {
        // ESC interrupts from any state, even mid-command.
        if st.inbuf.contains(&0x1b) {
            st.inbuf.retain(|&b| b != 0x1b);
            Self::enter_menu(dev, st);
        }

        while let Some(pos) = st.inbuf.iter().position(|&b| b == b'\r') {
            let cmd_bytes: Vec<u8> = st.inbuf.drain(..=pos).take(pos).collect();
            let cmd = String::from_utf8_lossy(&cmd_bytes).trim().to_uppercase();
            trace!(?cmd, mode = ?st.mode, "device received command");
            match st.mode {
                DeviceMode::Menu => Self::handle_menu_command(dev, st, &cmd),
                DeviceMode::Polled => dev.handle_polled_command(st, &cmd),
                // Freerun ignores everything except the ESC interrupt.
                DeviceMode::Freerun => {}
            }
        }
    }
}

impl Transport for SimTransport {
    fn is_open(&self) -> bool {
        self.dev.state.lock().open
    }

    fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut st = self.dev.state.lock();
        if !st.open {
            return Err(QdaqError::ConnectionLost("simulator port is closed".into()));
        }
        st.bytes_written += bytes.len() as u64;
        st.inbuf.extend_from_slice(bytes);
        SimDevice::process_input(&self.dev, &mut st);
        Ok(bytes.len())
    }

    fn read_line(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.dev.state.lock();
        loop {
            if !st.open {
                return Err(QdaqError::ConnectionLost("simulator port is closed".into()));
            }
            if let Some(line) = st.outq.pop_front() {
                return Ok(Some(line));
            }
            if self
                .dev
                .out_ready
                .wait_until(&mut st, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn flush_input(&self) -> Result<()> {
        let mut st = self.dev.state.lock();
        let discarded = st.outq.len();
        st.outq.clear();
        if discarded > 0 {
            debug!(discarded, "flushed simulated input");
        }
        Ok(())
    }

    fn close(&self) {
        let mut st = self.dev.state.lock();
        st.open = false;
        self.dev.stop_stream(&mut st);
        self.dev.out_ready.notify_all();
    }
}
