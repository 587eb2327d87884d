//! Serial link lifecycle and the background read loop.
//!
//! [`LinkManager`] owns at most one open port and one read thread at a time.
//! The thread reads newline-terminated lines with a short timeout, decodes
//! each through a [`FrameParser`], stores the result in the [`StateStore`]
//! and hands it to every registered [`FrameSink`]. It never blocks on a sink
//! and never dies on bad input.
//!
//! ```text
//! Disconnected --connect--> Connecting --opened--> Connected
//!      ^                                             |
//!      +------------- disconnect / Error <-----------+
//! ```

use std::io::{self, BufRead, BufReader, Read};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::FrameSink;
use crate::error::{Error, Result};
use crate::parser::FrameParser;
use crate::store::StateStore;
use crate::telemetry::TelemetryFrame;

/// How often `disconnect` checks whether the read loop has exited.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lines longer than this without a newline are discarded as noise.
const MAX_LINE_LEN: usize = 4096;

/// Back-to-back transient faults tolerated before the port is reopened.
const MAX_CONSECUTIVE_FAULTS: u32 = 50;

/// Supported serial symbol rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    /// 9600 baud.
    B9600,
    /// 19200 baud.
    B19200,
    /// 57600 baud.
    B57600,
    /// 115200 baud.
    #[default]
    B115200,
    /// 230400 baud.
    B230400,
    /// 460800 baud.
    B460800,
}

impl BaudRate {
    /// Every supported rate, slowest first.
    pub const ALL: [Self; 6] = [
        Self::B9600,
        Self::B19200,
        Self::B57600,
        Self::B115200,
        Self::B230400,
        Self::B460800,
    ];

    /// The rate in symbols per second.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B19200 => 19_200,
            Self::B57600 => 57_600,
            Self::B115200 => 115_200,
            Self::B230400 => 230_400,
            Self::B460800 => 460_800,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.as_u32() == value)
            .ok_or(Error::UnsupportedBaud(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(baud: BaudRate) -> Self {
        baud.as_u32()
    }
}

impl FromStr for BaudRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = s
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::InvalidBaud(s.to_string()))?;
        Self::try_from(value)
    }
}

impl std::fmt::Display for BaudRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Where the link currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LinkState {
    /// No port is open.
    #[default]
    Disconnected,
    /// A port is being opened or reopened.
    Connecting,
    /// The read loop is running on an open port.
    Connected,
    /// The read loop stopped on an unrecoverable fault. Needs a new `connect`.
    Error(String),
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// What the read loop does about an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Log it and keep reading.
    Continue,
    /// The transport went away: reopen the port.
    Reconnect,
    /// Give up and move the link to [`LinkState::Error`].
    Fatal,
}

/// Classify a read error. Timeouts are not faults and never reach here.
#[must_use]
pub fn classify_fault(err: &io::Error) -> FaultAction {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => FaultAction::Reconnect,
        ErrorKind::PermissionDenied | ErrorKind::NotFound | ErrorKind::Unsupported => {
            FaultAction::Fatal
        }
        _ => FaultAction::Continue,
    }
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A readable transport handle owned by the read loop.
pub type PortReader = Box<dyn Read + Send>;

/// Opens the transport behind a link.
pub trait PortOpener: Send + Sync {
    /// Open `port` at `baud`, with reads timing out after `read_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortUnavailable`] if the port cannot be opened.
    fn open(&self, port: &str, baud: BaudRate, read_timeout: Duration) -> Result<PortReader>;
}

/// Opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, baud: BaudRate, read_timeout: Duration) -> Result<PortReader> {
        let handle = serialport::new(port, baud.as_u32())
            .timeout(read_timeout)
            .open()
            .map_err(|err| Error::port_unavailable(port, err.to_string()))?;
        Ok(Box::new(handle))
    }
}

/// List the serial ports present on this machine.
///
/// # Errors
///
/// Returns an error if the platform enumeration fails.
pub fn list_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// Timing knobs for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Read timeout; also how often the loop checks for a stop request.
    pub read_timeout: Duration,
    /// How long `disconnect` waits for the loop before detaching it.
    pub disconnect_grace: Duration,
    /// Reopen attempts after the transport is lost.
    pub reconnect_attempts: u32,
    /// Pause before each reopen attempt.
    pub reconnect_delay: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            disconnect_grace: Duration::from_millis(500),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Counters describing link activity since the manager was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Non-empty lines read off the port.
    pub lines_read: u64,
    /// Lines no format recognized (stored as zeroed frames).
    pub unrecognized_lines: u64,
    /// Transient read faults that were logged and skipped.
    pub read_faults: u64,
    /// Times the port was reopened after losing the transport.
    pub reconnects: u64,
    /// Most recent fault, if any.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct StateSlot {
    generation: u64,
    state: LinkState,
}

/// State shared between the manager and its read thread.
#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<StateSlot>,
    lines_read: AtomicU64,
    unrecognized_lines: AtomicU64,
    read_faults: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, StateSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new session and return its generation.
    fn begin(&self) -> u64 {
        let mut slot = self.slot();
        slot.generation += 1;
        slot.state = LinkState::Connecting;
        slot.generation
    }

    /// Update the state on behalf of `generation`. Stale sessions are ignored.
    fn set_state(&self, generation: u64, state: LinkState) -> bool {
        let mut slot = self.slot();
        if slot.generation != generation {
            return false;
        }
        if slot.state != state {
            debug!(from = %slot.state, to = %state, "link state changed");
            slot.state = state;
        }
        true
    }

    /// End the current session, whatever its loop is still doing.
    fn retire(&self) {
        let mut slot = self.slot();
        slot.generation += 1;
        slot.state = LinkState::Disconnected;
    }

    fn record_fault(&self, err: &io::Error) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }
}

/// A running connection: its stop flag and read thread.
#[derive(Debug)]
struct Session {
    port: String,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owns the serial connection and its read loop.
pub struct LinkManager {
    opener: Arc<dyn PortOpener>,
    parser: FrameParser,
    store: Arc<StateStore>,
    sinks: Vec<Arc<dyn FrameSink>>,
    settings: LinkSettings,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    lingering: Mutex<Option<Session>>,
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkManager")
            .field("parser", &self.parser)
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LinkManager {
    /// Create a disconnected manager feeding `store`.
    #[must_use]
    pub fn new(
        opener: Arc<dyn PortOpener>,
        parser: FrameParser,
        store: Arc<StateStore>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            opener,
            parser,
            store,
            sinks: Vec::new(),
            settings,
            shared: Arc::new(Shared::default()),
            session: Mutex::new(None),
            lingering: Mutex::new(None),
        }
    }

    /// Add a sink fed with every stored frame. Takes effect on the next connect.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Open `port` and start the read loop.
    ///
    /// Any existing connection is fully disconnected first, so there is never
    /// more than one live handle or loop. A loop detached by an earlier
    /// disconnect gets one more grace period to release its handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortUnavailable`] if the port cannot be opened, or if
    /// a detached loop still holds the previous handle; the link is then
    /// left disconnected.
    pub fn connect(&self, port: &str, baud: BaudRate) -> Result<()> {
        let mut session = self.lock_session();
        self.shutdown(&mut session);
        self.settle_lingering(port)?;

        let generation = self.shared.begin();
        info!(port, %baud, "connecting serial link");

        let reader = match self.opener.open(port, baud, self.settings.read_timeout) {
            Ok(reader) => reader,
            Err(err) => {
                self.shared.retire();
                warn!(port, error = %err, "failed to open serial port");
                return Err(err);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker = ReadLoop {
            generation,
            port: port.to_string(),
            baud,
            reader: BufReader::new(reader),
            stop: Arc::clone(&stop),
            shared: Arc::clone(&self.shared),
            opener: Arc::clone(&self.opener),
            parser: self.parser,
            store: Arc::clone(&self.store),
            sinks: self.sinks.clone(),
            settings: self.settings,
        };

        self.shared.set_state(generation, LinkState::Connected);
        let thread = match thread::Builder::new()
            .name("groundlink-read".to_string())
            .spawn(move || worker.run())
        {
            Ok(thread) => thread,
            Err(err) => {
                self.shared.retire();
                return Err(err.into());
            }
        };

        info!(port, %baud, "serial link connected");
        *session = Some(Session {
            port: port.to_string(),
            stop,
            thread,
        });
        Ok(())
    }

    /// Stop the read loop and release the port. Safe to call at any time.
    ///
    /// Waits at most the configured grace period for the loop to exit. A loop
    /// still stuck in a read after that is detached: it can no longer touch
    /// the link state or the store, and drops its handle as soon as the read
    /// returns. Until then `connect` refuses to open a second handle.
    pub fn disconnect(&self) {
        let mut session = self.lock_session();
        self.shutdown(&mut session);
    }

    /// The current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.shared.slot().state.clone()
    }

    /// Check whether the read loop is running on an open port.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Snapshot of the link counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            lines_read: self.shared.lines_read.load(Ordering::Relaxed),
            unrecognized_lines: self.shared.unrecognized_lines.load(Ordering::Relaxed),
            read_faults: self.shared.read_faults.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lingering(&self) -> MutexGuard<'_, Option<Session>> {
        self.lingering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self, slot: &mut Option<Session>) {
        let Some(session) = slot.take() else {
            return;
        };

        session.stop.store(true, Ordering::SeqCst);
        let port = session.port.clone();
        if let Some(session) = self.finish(session) {
            warn!(
                port = %port,
                grace_ms = self.settings.disconnect_grace.as_millis(),
                "read loop did not stop in time; detaching it"
            );
            *self.lock_lingering() = Some(session);
        }

        self.shared.retire();
        info!(port = %port, "serial link disconnected");
    }

    /// Wait out a loop detached by an earlier disconnect.
    fn settle_lingering(&self, port: &str) -> Result<()> {
        let mut lingering = self.lock_lingering();
        let Some(session) = lingering.take() else {
            return Ok(());
        };

        if let Some(session) = self.finish(session) {
            warn!(port = %session.port, "detached read loop still holds its port");
            let err = Error::port_unavailable(
                port,
                format!("read loop on {} has not released its handle", session.port),
            );
            *lingering = Some(session);
            return Err(err);
        }
        Ok(())
    }

    /// Join `session` if its loop exits within the grace period, otherwise
    /// hand it back.
    fn finish(&self, session: Session) -> Option<Session> {
        let deadline = Instant::now() + self.settings.disconnect_grace;
        while !session.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if !session.thread.is_finished() {
            return Some(session);
        }
        if session.thread.join().is_err() {
            error!(port = %session.port, "serial read loop panicked");
        }
        None
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Everything the read thread owns.
struct ReadLoop {
    generation: u64,
    port: String,
    baud: BaudRate,
    reader: BufReader<PortReader>,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared>,
    opener: Arc<dyn PortOpener>,
    parser: FrameParser,
    store: Arc<StateStore>,
    sinks: Vec<Arc<dyn FrameSink>>,
    settings: LinkSettings,
}

impl ReadLoop {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        debug!(port = %self.port, "read loop started");
        let mut line = Vec::with_capacity(256);
        let mut consecutive_faults = 0u32;

        while !self.stopped() {
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => {
                    // End of input with nothing new: idle like a timeout.
                    if !line.is_empty() {
                        self.ingest(&line);
                        line.clear();
                    }
                    thread::sleep(self.settings.read_timeout);
                    consecutive_faults = 0;
                }
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        self.ingest(&line);
                        line.clear();
                    }
                    consecutive_faults = 0;
                }
                Err(err) if is_idle(&err) => consecutive_faults = 0,
                Err(err) => {
                    self.shared.read_faults.fetch_add(1, Ordering::Relaxed);
                    self.shared.record_fault(&err);
                    consecutive_faults += 1;

                    let mut action = classify_fault(&err);
                    if action == FaultAction::Continue && consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                        action = FaultAction::Reconnect;
                    }

                    match action {
                        FaultAction::Continue => {
                            warn!(port = %self.port, error = %err, "transient read fault");
                            thread::sleep(self.settings.read_timeout);
                        }
                        FaultAction::Reconnect => {
                            warn!(port = %self.port, error = %err, "serial transport lost");
                            line.clear();
                            consecutive_faults = 0;
                            if !self.reopen() {
                                break;
                            }
                        }
                        FaultAction::Fatal => {
                            error!(port = %self.port, error = %err, "unrecoverable read fault");
                            self.shared
                                .set_state(self.generation, LinkState::Error(err.to_string()));
                            break;
                        }
                    }
                }
            }

            if line.len() > MAX_LINE_LEN {
                warn!(port = %self.port, len = line.len(), "discarding overlong line");
                line.clear();
            }
        }
        debug!(port = %self.port, "read loop exited");
    }

    fn ingest(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() || self.stopped() {
            return;
        }

        self.shared.lines_read.fetch_add(1, Ordering::Relaxed);
        trace!(line = text, "received line");

        let (reading, format) = self.parser.decode(text);
        let recognized = format.is_some();
        if !recognized {
            self.shared.unrecognized_lines.fetch_add(1, Ordering::Relaxed);
        }

        let frame = TelemetryFrame::new(reading);
        self.store.set(frame);
        for sink in &self.sinks {
            if recognized || sink.accepts_unrecognized() {
                sink.accept(&frame);
            }
        }
    }

    /// Reopen the port after the transport was lost. Returns `false` if the
    /// loop should exit.
    fn reopen(&mut self) -> bool {
        if !self.shared.set_state(self.generation, LinkState::Connecting) {
            return false;
        }

        // Release the lost handle before opening a new one.
        let released: PortReader = Box::new(io::empty());
        self.reader = BufReader::new(released);

        for attempt in 1..=self.settings.reconnect_attempts {
            if !self.pause(self.settings.reconnect_delay) {
                return false;
            }
            match self
                .opener
                .open(&self.port, self.baud, self.settings.read_timeout)
            {
                Ok(reader) => {
                    self.reader = BufReader::new(reader);
                    self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.shared.set_state(self.generation, LinkState::Connected);
                    info!(port = %self.port, attempt, "serial link reopened");
                    return true;
                }
                Err(err) => {
                    warn!(port = %self.port, attempt, error = %err, "reopen attempt failed");
                }
            }
        }

        let reason = format!(
            "lost {} and could not reopen it after {} attempts",
            self.port, self.settings.reconnect_attempts
        );
        error!(port = %self.port, "{reason}");
        self.shared.set_state(self.generation, LinkState::Error(reason));
        false
    }

    /// Sleep for `duration` unless asked to stop. Returns `false` on stop.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.stopped() {
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL.min(duration));
        }
        !self.stopped()
    }
}
