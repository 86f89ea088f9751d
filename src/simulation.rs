//! Simulated adapters for unit testing the connection stack.
//!
//! [SimulationTransport] behaves like an ELM327 on the wire: every reply
//! is terminated with `\r\r>`, unanswered commands produce silence (reads
//! time out), and multi line replies use `\r` separators. A callback
//! decides the reply per command, so tests can model stateful adapters.

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    connection::{AdapterTarget, TransportFactory},
    transport::{Transport, TransportError, TransportResult},
};

type Responder = dyn FnMut(&str) -> Option<String> + Send;

/// Scripted [Transport]: a responder callback decides each reply
pub struct SimulationTransport {
    responder: Box<Responder>,
    rx: Vec<u8>,
    written: Arc<Mutex<Vec<String>>>,
    closed: bool,
}

impl Debug for SimulationTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "SimulationTransport {{ closed: {}, buffered: {} }}",
            self.closed,
            self.rx.len()
        )
    }
}

impl SimulationTransport {
    /// Builds a transport around a responder callback. Returning None
    /// leaves the request unanswered, so reads time out.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            rx: Vec::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Builds a transport from a fixed command -> reply table
    pub fn scripted(map: HashMap<String, String>) -> Self {
        Self::new(move |cmd| map.get(cmd).cloned())
    }

    /// Shared handle to the raw write log (each entry is the exact text
    /// written, terminator included). Usable after the transport has been
    /// moved into a manager.
    pub fn write_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.written.clone()
    }
}

impl Transport for SimulationTransport {
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let raw = String::from_utf8_lossy(bytes).to_string();
        self.written.lock().unwrap().push(raw.clone());
        let command = raw.trim_end_matches('\r').trim().to_string();
        if let Some(reply) = (self.responder)(&command) {
            self.rx.extend_from_slice(reply.as_bytes());
            self.rx.extend_from_slice(b"\r\r>");
        }
        Ok(())
    }

    fn read_line(&mut self, timeout_ms: u32) -> TransportResult<String> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self
            .rx
            .iter()
            .position(|b| matches!(b, b'\r' | b'\n' | b'>'))
        {
            Some(pos) => {
                let terminator = self.rx[pos];
                let mut line: Vec<u8> = self.rx.drain(..=pos).collect();
                if terminator != b'>' {
                    line.pop();
                }
                Ok(String::from_utf8_lossy(&line).trim().to_string())
            }
            None => {
                // Nothing scripted: emulate a silent adapter without
                // spinning the caller's poll loop
                std::thread::sleep(Duration::from_millis(timeout_ms.min(5) as u64));
                Err(TransportError::TimedOut)
            }
        }
    }

    fn read_available(&mut self) -> TransportResult<String> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let drained: Vec<u8> = self.rx.drain(..).collect();
        Ok(String::from_utf8_lossy(&drained).to_string())
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.clear();
    }
}

type TransportBuilder = dyn FnMut(&AdapterTarget) -> TransportResult<Box<dyn Transport>> + Send;

/// [TransportFactory] backed by a closure, for connect and reconnect
/// tests (hand out one transport, fail the first N opens, and so on)
pub struct SimulationFactory {
    builder: Mutex<Box<TransportBuilder>>,
}

impl Debug for SimulationFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "SimulationFactory")
    }
}

impl SimulationFactory {
    /// Builds a factory from a closure invoked once per open call
    pub fn new<F>(builder: F) -> Self
    where
        F: FnMut(&AdapterTarget) -> TransportResult<Box<dyn Transport>> + Send + 'static,
    {
        Self {
            builder: Mutex::new(Box::new(builder)),
        }
    }

    /// Factory that hands out the given transport exactly once and
    /// reports `Closed` for every open after that
    pub fn single_use(transport: SimulationTransport) -> Self {
        let mut slot = Some(transport);
        Self::new(move |_| {
            slot.take()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or(TransportError::Closed)
        })
    }
}

impl TransportFactory for SimulationFactory {
    fn open(&self, target: &AdapterTarget) -> TransportResult<Box<dyn Transport>> {
        (self.builder.lock().unwrap())(target)
    }
}
