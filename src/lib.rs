#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for talking to ELM327 compatible OBD2 adapters over an
//! unreliable, line oriented, half duplex serial channel (Bluetooth
//! RFCOMM, WiFi TCP or USB serial), exposing a reliable request/response
//! diagnostic protocol to higher layers.
//!
//! ## What this crate covers
//!
//! * Connection lifecycle with bounded timeouts and automatic
//!   reconnection with exponential backoff ([connection], [reconnect])
//! * The ELM327 AT command initialization sequence ([elm327])
//! * OBD2 protocol negotiation across the candidate physical layers
//!   ([elm327::ProtocolDetector])
//! * ISO 15765-2 (ISO-TP) single/multi frame reassembly with flow
//!   control ([isotp])
//! * Bit level decoding of mode 03/07/0A trouble code responses ([dtc])
//!
//! ## What it deliberately leaves to others
//!
//! UI state, persistence, DBC signal decoding and manufacturer specific
//! PID tables all live above this crate. Device discovery, pairing and
//! permissions live below it: an already connected byte stream is
//! injected through [transport::Transport] and
//! [connection::TransportFactory].
//!
//! ## Concurrency model
//!
//! One owner context per [connection::ConnectionManager] performs all
//! transport I/O; `send`, `connect` and `disconnect` serialize through a
//! single guard because the adapter cannot pipeline. The only background
//! task is the reconnection retry loop, which acts as a replacement
//! owner while the link is down. Every wait is bounded by an explicit
//! timeout and cancellable within one poll tick.

use transport::TransportError;

pub mod connection;
pub mod dtc;
pub mod elm327;
pub mod helpers;
pub mod isotp;
pub mod reconnect;
pub mod simulation;
pub mod state;
pub mod transport;

/// Protocol operation result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error surfaced by the connection stack
pub enum ProtocolError {
    /// Physical layer failure: socket closed, write failed, link dropped
    #[error("Transport failure")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// No complete response within the command or frame budget
    #[error("Timed out waiting for the adapter")]
    TimedOut,
    /// The adapter itself reported a failure on the vehicle bus
    #[error("Adapter reported '{0}'")]
    Bus(String),
    /// Protocol negotiation exhausted every candidate. Usually means the
    /// ignition is off or the connector is not seated
    #[error("No OBD2 protocol could be negotiated with the vehicle")]
    ProtocolMismatch,
    /// An ISO-TP exchange could not be interpreted
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    /// No adapter link is open
    #[error("Not connected to an adapter")]
    NotConnected,
}
