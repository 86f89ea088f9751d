//! Observable connection state.
//!
//! One [ConnectionState] value lives per connection manager. It is written
//! only by the manager and the reconnection task; everyone else observes it
//! through [StateBroadcaster::subscribe], which replays the latest value to
//! new listeners and delivers transitions in publish order.

use std::{
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

/// State of the link between a connection manager and its adapter
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No adapter link
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Adapter link established
    Connected {
        /// Display name of the adapter
        name: String,
        /// Physical address (MAC, host:port or device path)
        address: String,
    },
    /// The link dropped unexpectedly and is being reattached
    Reconnecting {
        /// Current attempt, 1 based
        attempt: u32,
        /// Attempts before giving up
        max_attempts: u32,
        /// Display name of the adapter being reattached
        name: String,
    },
    /// Unrecoverable failure. A fresh connect is required
    Error {
        /// Human readable failure description
        message: String,
    },
}

#[derive(Debug)]
struct Shared {
    /// Latest value plus the live subscriber list, guarded together so a
    /// publish is atomic and listeners see transitions in order
    inner: Mutex<(ConnectionState, Vec<mpsc::Sender<ConnectionState>>)>,
}

/// Publishes [ConnectionState] transitions to any number of listeners
#[derive(Debug, Clone)]
pub struct StateBroadcaster {
    shared: Arc<Shared>,
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBroadcaster {
    /// Creates a broadcaster starting out [ConnectionState::Disconnected]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new((ConnectionState::Disconnected, Vec::new())),
            }),
        }
    }

    /// Snapshot of the latest published value
    pub fn current(&self) -> ConnectionState {
        self.shared.inner.lock().unwrap().0.clone()
    }

    /// Registers a listener. The current value is replayed as its first
    /// message, then every transition follows in publish order.
    pub fn subscribe(&self) -> StateListener {
        let (tx, rx) = mpsc::channel();
        let mut guard = self.shared.inner.lock().unwrap();
        let _ = tx.send(guard.0.clone());
        guard.1.push(tx);
        StateListener { rx }
    }

    /// Publishes a transition. Dead listeners are dropped on the way.
    pub(crate) fn publish(&self, state: ConnectionState) {
        let mut guard = self.shared.inner.lock().unwrap();
        log::debug!("connection state -> {state:?}");
        guard.0 = state.clone();
        guard.1.retain(|tx| tx.send(state.clone()).is_ok());
    }
}

/// Receiving half of a state subscription
#[derive(Debug)]
pub struct StateListener {
    rx: mpsc::Receiver<ConnectionState>,
}

impl StateListener {
    /// Blocks until the next transition. None once the broadcaster is gone.
    pub fn recv(&self) -> Option<ConnectionState> {
        self.rx.recv().ok()
    }

    /// Waits up to `timeout_ms` for the next transition
    pub fn recv_timeout(&self, timeout_ms: u32) -> Option<ConnectionState> {
        self.rx
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
            .ok()
    }

    /// Returns the next transition if one is already queued
    pub fn try_recv(&self) -> Option<ConnectionState> {
        self.rx.try_recv().ok()
    }
}
