//! Connection lifecycle and command serialization for one adapter link.
//!
//! The ELM327 link is strictly half duplex request/response: the adapter
//! never answers out of order and never accepts a second command while one
//! is outstanding. [ConnectionManager] enforces that by funnelling every
//! exchange - connect, plain commands and segmented ISO-TP transactions -
//! through a single transport guard. Responses therefore always come back
//! in the order commands were issued.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{
        Arc, Mutex, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    ProtocolError, ProtocolResult,
    dtc::{self, Dtc, DtcKind},
    elm327::{self, AtCommand},
    helpers,
    isotp::{self, IsoTpFrame, Reassembler},
    reconnect::ReconnectionPolicy,
    state::{ConnectionState, StateBroadcaster, StateListener},
    transport::{Transport, TransportError, TransportResult},
};

/// Identifies an adapter to a [TransportFactory]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTarget {
    /// Display name, surfaced in [ConnectionState::Connected]
    pub name: String,
    /// Physical address: MAC, host:port or device path
    pub address: String,
}

impl AdapterTarget {
    /// Convenience constructor
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
        }
    }
}

/// Opens transports to adapters by address.
///
/// Implemented by the discovery/pairing layer above this crate; the
/// factory is the seam between the two. Called once per connect or
/// reconnect attempt.
pub trait TransportFactory: Send + Sync {
    /// Opens a fresh transport to the given target
    fn open(&self, target: &AdapterTarget) -> TransportResult<Box<dyn Transport>>;
}

/// Timeout and retry knobs for a [ConnectionManager]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Budget for one connect attempt in ms
    pub connect_timeout_ms: u32,
    /// Budget for one command/response exchange in ms
    pub command_timeout_ms: u32,
    /// Budget for each further frame while reassembling a segmented
    /// response, in ms
    pub frame_timeout_ms: u32,
    /// Schedule background reconnection when the link drops mid command
    pub auto_reconnect: bool,
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            frame_timeout_ms: 1_000,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
        }
    }
}

/// Slice of the command budget spent per poll of the transport, keeping
/// the close flag responsive while a read blocks
const READ_SLICE_MS: u32 = 100;

/// Owns one adapter link: tracks [ConnectionState], serializes command
/// execution and drives reconnection.
pub struct ConnectionManager {
    transport: Arc<Mutex<Option<Box<dyn Transport>>>>,
    factory: Arc<dyn TransportFactory>,
    state: StateBroadcaster,
    reconnect: ReconnectionPolicy,
    settings: ConnectionSettings,
    /// Set by disconnect() so a blocked exchange bails within one poll tick
    closing: Arc<AtomicBool>,
    /// Last successfully opened target, used by reconnection
    target: Mutex<Option<AdapterTarget>>,
}

impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state.current())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager in the [ConnectionState::Disconnected] state
    pub fn new(factory: Arc<dyn TransportFactory>, settings: ConnectionSettings) -> Self {
        let state = StateBroadcaster::new();
        Self {
            transport: Arc::new(Mutex::new(None)),
            factory,
            reconnect: ReconnectionPolicy::new(state.clone()),
            state,
            settings,
            closing: Arc::new(AtomicBool::new(false)),
            target: Mutex::new(None),
        }
    }

    /// Snapshot of the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Registers a state listener. The current value is replayed first
    pub fn subscribe(&self) -> StateListener {
        self.state.subscribe()
    }

    /// True while a transport is installed
    pub fn is_connected(&self) -> bool {
        self.transport.lock().unwrap().is_some()
    }

    /// Opens a link to `target` through the factory, bounded by the
    /// connect timeout. Publishes `Connecting` then `Connected`/`Error`;
    /// failures come back as values, never panics.
    pub fn connect(&self, target: &AdapterTarget) -> ProtocolResult<()> {
        self.reconnect.cancel();
        self.state.publish(ConnectionState::Connecting);

        // The factory may block arbitrarily (RFCOMM dial, TCP handshake),
        // so it runs on a worker and the result is awaited with a timeout.
        let (tx, rx) = mpsc::channel();
        let factory = self.factory.clone();
        let wanted = target.clone();
        std::thread::spawn(move || {
            let _ = tx.send(factory.open(&wanted));
        });

        let timeout = Duration::from_millis(self.settings.connect_timeout_ms as u64);
        let opened = match rx.recv_timeout(timeout) {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                let message = format!("could not open {}: {e}", target.address);
                error!("{message}");
                self.state.publish(ConnectionState::Error { message });
                return Err(e.into());
            }
            Err(_) => {
                let message = format!("connecting to {} timed out", target.address);
                error!("{message}");
                self.state.publish(ConnectionState::Error { message });
                return Err(ProtocolError::TimedOut);
            }
        };

        self.closing.store(false, Ordering::Relaxed);
        if let Some(mut old) = self.transport.lock().unwrap().replace(opened) {
            old.close();
        }
        *self.target.lock().unwrap() = Some(target.clone());
        info!("connected to {} ({})", target.name, target.address);
        self.state.publish(ConnectionState::Connected {
            name: target.name.clone(),
            address: target.address.clone(),
        });
        Ok(())
    }

    /// Sends one command and returns the adapter's response text with the
    /// prompt stripped and echo removed.
    ///
    /// Adapter reported failures (`NO DATA`, `UNABLE TO CONNECT`, ...)
    /// surface as [ProtocolError::Bus]; an I/O failure tears the link
    /// down, publishes an `Error` state and (when enabled) schedules
    /// reconnection.
    pub fn send(&self, command: &str) -> ProtocolResult<String> {
        self.send_with_timeout(command, self.settings.command_timeout_ms)
    }

    /// [Self::send] with an explicit response budget
    pub fn send_with_timeout(&self, command: &str, timeout_ms: u32) -> ProtocolResult<String> {
        let response = self.run_locked(|transport, closing| {
            let lines = Self::exchange(transport, closing, command, timeout_ms)?;
            Ok(Self::collapse(command, &lines))
        })?;
        if let Some(message) = elm327::find_bus_error(&response) {
            debug!("adapter reported bus error for {command:?}: {message}");
            return Err(ProtocolError::Bus(message));
        }
        Ok(response)
    }

    /// Sends an OBD2 request and reassembles the (possibly segmented)
    /// ISO-TP response into its payload bytes.
    ///
    /// The transport guard is held for the whole transaction, flow
    /// control included, so the half duplex invariant also covers
    /// multi frame responses.
    pub fn transact_isotp(&self, command: &str) -> ProtocolResult<Vec<u8>> {
        let settings = self.settings;
        self.run_locked(move |transport, closing| {
            Self::isotp_exchange(transport, closing, command, &settings)
        })
    }

    /// Reads and decodes trouble codes of the given storage class
    /// (service 03/07/0A)
    pub fn read_dtcs(&self, kind: DtcKind) -> ProtocolResult<Vec<Dtc>> {
        let payload = self.transact_isotp(kind.request())?;
        Ok(dtc::decode_bytes(&payload))
    }

    /// Battery voltage the adapter measures on pin 16 of the OBD port.
    /// None when the adapter does not answer with something parseable.
    pub fn read_battery_voltage(&self) -> Option<f32> {
        let response = self.send(&AtCommand::ReadVoltage.build()).ok()?;
        response
            .trim()
            .trim_end_matches(['V', 'v'])
            .trim()
            .parse()
            .ok()
    }

    /// Tears the link down: cancels any reconnection run, interrupts a
    /// blocked exchange, closes the transport and publishes
    /// `Disconnected`. Best effort, always succeeds.
    pub fn disconnect(&self) {
        self.reconnect.cancel();
        self.closing.store(true, Ordering::Relaxed);
        {
            let mut guard = self.transport.lock().unwrap();
            if let Some(mut transport) = guard.take() {
                transport.close();
            }
        }
        self.closing.store(false, Ordering::Relaxed);
        *self.target.lock().unwrap() = None;
        self.state.publish(ConnectionState::Disconnected);
    }

    /// Runs one operation against the locked transport. An I/O failure
    /// inside the operation drops the dead transport, publishes an
    /// `Error` state and schedules reconnection (unless the failure was
    /// caused by disconnect() itself).
    fn run_locked<T>(
        &self,
        op: impl FnOnce(&mut dyn Transport, &AtomicBool) -> ProtocolResult<T>,
    ) -> ProtocolResult<T> {
        let mut guard = self.transport.lock().unwrap();
        let transport = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        let result = op(transport.as_mut(), &self.closing);
        if let Err(ProtocolError::Transport(e)) = &result {
            if self.closing.load(Ordering::Relaxed) {
                return Err(TransportError::Closed.into());
            }
            error!("adapter link failed: {e}");
            if let Some(mut dead) = guard.take() {
                dead.close();
            }
            drop(guard);
            self.state.publish(ConnectionState::Error {
                message: format!("adapter link failed: {e}"),
            });
            self.schedule_reconnect();
        }
        result
    }

    /// Kicks off the background retry run for the last known target
    fn schedule_reconnect(&self) {
        if !self.settings.auto_reconnect {
            return;
        }
        let Some(target) = self.target.lock().unwrap().clone() else {
            return;
        };
        let factory = self.factory.clone();
        let wanted = target.clone();
        let slot = self.transport.clone();
        self.reconnect.schedule(
            target,
            self.settings.max_reconnect_attempts,
            move || factory.open(&wanted),
            move |transport| {
                *slot.lock().unwrap() = Some(transport);
            },
        );
    }

    /// One raw exchange against the locked transport: drain stale bytes,
    /// write the `\r` terminated command, then collect response lines
    /// until the prompt arrives or the budget runs out.
    fn exchange(
        transport: &mut dyn Transport,
        closing: &AtomicBool,
        command: &str,
        timeout_ms: u32,
    ) -> ProtocolResult<Vec<String>> {
        match transport.read_available() {
            Ok(stale) if !stale.is_empty() => {
                debug!("discarding {} stale bytes", stale.len());
            }
            _ => {}
        }
        let mut wire = command.to_string();
        if !wire.ends_with('\r') {
            wire.push('\r');
        }
        debug!("tx: {:?}", wire.trim_end());
        transport.write(wire.as_bytes())?;
        Self::collect_until_prompt(transport, closing, timeout_ms)
    }

    /// Accumulates trimmed response lines until one carries the ELM
    /// prompt `>`. The prompt itself is removed from the returned lines.
    fn collect_until_prompt(
        transport: &mut dyn Transport,
        closing: &AtomicBool,
        timeout_ms: u32,
    ) -> ProtocolResult<Vec<String>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut lines = Vec::new();
        loop {
            if closing.load(Ordering::Relaxed) {
                return Err(TransportError::Closed.into());
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("no prompt within {timeout_ms} ms");
                return Err(ProtocolError::TimedOut);
            }
            let budget = deadline
                .duration_since(now)
                .min(Duration::from_millis(READ_SLICE_MS as u64));
            match transport.read_line((budget.as_millis() as u32).max(1)) {
                Ok(line) => {
                    let prompt_seen = line.contains('>');
                    let text = line.replace('>', "");
                    let text = text.trim();
                    if !text.is_empty() {
                        debug!("rx: {text:?}");
                        lines.push(text.to_string());
                    }
                    if prompt_seen {
                        return Ok(lines);
                    }
                }
                // Partial input stays buffered in the transport; poll again
                Err(TransportError::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Joins response lines, dropping a leading command echo (present
    /// until `ATE0` takes effect)
    fn collapse(command: &str, lines: &[String]) -> String {
        let echoed = command.trim_end_matches('\r');
        lines
            .iter()
            .map(String::as_str)
            .filter(|line| !line.eq_ignore_ascii_case(echoed))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Drives one ISO-TP transaction: request, classification, flow
    /// control and reassembly.
    fn isotp_exchange(
        transport: &mut dyn Transport,
        closing: &AtomicBool,
        command: &str,
        settings: &ConnectionSettings,
    ) -> ProtocolResult<Vec<u8>> {
        let lines = Self::exchange(transport, closing, command, settings.command_timeout_ms)?;
        if let Some(message) = elm327::find_bus_error(&Self::collapse(command, &lines)) {
            debug!("adapter reported bus error for {command:?}: {message}");
            return Err(ProtocolError::Bus(message));
        }
        let echoed = command.trim_end_matches('\r');
        let mut frames = lines
            .iter()
            .filter(|line| !line.eq_ignore_ascii_case(echoed))
            .filter(|line| helpers::is_hex_line(line))
            .map(|line| {
                let hex = helpers::clean_hex(line);
                IsoTpFrame::parse(isotp::strip_can_header(&hex))
            })
            .collect::<Vec<_>>()
            .into_iter();

        let (total_len, first_data) = match frames.next() {
            Some(IsoTpFrame::Single { data }) => return Ok(data),
            Some(IsoTpFrame::Passthrough { data }) => return Ok(data),
            Some(IsoTpFrame::First { total_len, data }) => (total_len, data),
            Some(IsoTpFrame::Consecutive { .. }) => {
                return Err(ProtocolError::MalformedFrame(
                    "consecutive frame before a first frame".to_string(),
                ));
            }
            Some(IsoTpFrame::FlowControl { .. }) => {
                return Err(ProtocolError::MalformedFrame(
                    "unexpected flow control frame from the vehicle".to_string(),
                ));
            }
            None => {
                return Err(ProtocolError::MalformedFrame(
                    "response carried no frame data".to_string(),
                ));
            }
        };

        let mut reassembler = Reassembler::new(total_len, &first_data);
        // Consecutive frames that arrived in the same burst as the first
        // frame are consumed before any flow control goes out
        for frame in frames {
            if let IsoTpFrame::Consecutive { data, .. } = frame {
                if reassembler.absorb(&data) {
                    return Ok(reassembler.finish());
                }
            }
        }
        if reassembler.is_complete() {
            return Ok(reassembler.finish());
        }

        // Authorize the sender: ContinueToSend, no block limit, 10 ms
        // separation. Written exactly once per transaction.
        let fc = format!("{}\r", isotp::flow_control_continue().to_hex());
        debug!("tx flow control: {:?}", fc.trim_end());
        transport.write(fc.as_bytes())?;

        loop {
            if closing.load(Ordering::Relaxed) {
                return Err(TransportError::Closed.into());
            }
            match transport.read_line(settings.frame_timeout_ms) {
                Ok(line) => {
                    let text = line.replace('>', "");
                    if !helpers::is_hex_line(&text) {
                        continue;
                    }
                    let hex = helpers::clean_hex(&text);
                    if let IsoTpFrame::Consecutive { data, .. } =
                        IsoTpFrame::parse(isotp::strip_can_header(&hex))
                    {
                        debug!(
                            "rx consecutive frame ({}/{} bytes)",
                            reassembler.bytes_received(),
                            total_len
                        );
                        if reassembler.absorb(&data) {
                            return Ok(reassembler.finish());
                        }
                    }
                }
                Err(TransportError::TimedOut) => {
                    warn!(
                        "reassembly stalled at {}/{} bytes",
                        reassembler.bytes_received(),
                        total_len
                    );
                    return Err(ProtocolError::TimedOut);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.reconnect.cancel();
        self.closing.store(true, Ordering::Relaxed);
    }
}
