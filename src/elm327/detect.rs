//! Adapter initialization and OBD2 protocol negotiation.

use std::time::Duration;

use log::{debug, info, warn};

use super::{AtCommand, Obd2Protocol};
use crate::{ProtocolError, ProtocolResult, connection::ConnectionManager, helpers};

/// Pause between manual probe attempts. Switching the physical layer takes
/// the adapter a moment; probing again too quickly gets spurious failures.
const PROBE_DELAY: Duration = Duration::from_millis(300);

/// Response fragment proving a vehicle answered a `0100` support query
const SUPPORTED_PIDS_REPLY: &str = "4100";

/// Negotiates which physical layer protocol the vehicle speaks.
///
/// Runs the AT initialization sequence, prefers the adapter's own auto
/// negotiation, and falls back to probing [Obd2Protocol::PROBE_ORDER]
/// one candidate at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolDetector {
    detected: Option<Obd2Protocol>,
}

impl ProtocolDetector {
    /// Creates a detector with no negotiated protocol
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocol negotiated by the last successful [Self::auto_detect]
    pub fn detected(&self) -> Option<Obd2Protocol> {
        self.detected
    }

    /// Runs the ELM327 initialization sequence, ending with a protocol
    /// select.
    ///
    /// Step failures before the select are logged and tolerated - clones
    /// routinely reject individual setup commands without affecting the
    /// session. A failed protocol select aborts initialization.
    pub fn initialize(
        &self,
        manager: &ConnectionManager,
        protocol: Obd2Protocol,
    ) -> ProtocolResult<()> {
        let steps = [
            AtCommand::Reset,
            AtCommand::EchoOff,
            AtCommand::LinefeedsOff,
            AtCommand::HeadersOn,
            AtCommand::SpacesOff,
            AtCommand::CanAutoFormatOn,
        ];
        for step in steps {
            match manager.send(&step.build()) {
                Ok(resp) => debug!("init {step}: {resp}"),
                Err(e) => warn!("init {step} failed ({e}), continuing"),
            }
        }
        let select = AtCommand::SelectProtocol(protocol);
        manager.send(&select.build()).map(|resp| {
            debug!("init {select}: {resp}");
        })
    }

    /// Initializes the adapter and negotiates a protocol.
    ///
    /// Tries the adapter's own auto negotiation first, then walks the
    /// candidate list. Returns [ProtocolError::ProtocolMismatch] once
    /// every candidate is exhausted.
    pub fn auto_detect(&mut self, manager: &ConnectionManager) -> ProtocolResult<Obd2Protocol> {
        self.detected = None;
        self.initialize(manager, Obd2Protocol::Auto)?;

        if self.test_connection(manager) {
            let proto = match manager.send(&AtCommand::DescribeProtocolNumber.build()) {
                Ok(resp) => Self::parse_protocol(&resp),
                Err(e) => {
                    warn!("ATDPN failed after a successful probe ({e})");
                    Obd2Protocol::Auto
                }
            };
            info!("adapter auto negotiated {proto}");
            self.detected = Some(proto);
            return Ok(proto);
        }

        for candidate in Obd2Protocol::PROBE_ORDER {
            std::thread::sleep(PROBE_DELAY);
            debug!("probing {candidate}");
            let select = AtCommand::SelectProtocol(candidate);
            if let Err(e) = manager.send(&select.build()) {
                debug!("{select} rejected ({e})");
                continue;
            }
            if self.test_connection(manager) {
                info!("vehicle answered on {candidate}");
                self.detected = Some(candidate);
                return Ok(candidate);
            }
        }
        Err(ProtocolError::ProtocolMismatch)
    }

    /// Asks the vehicle for its supported PIDs (`0100`). True when
    /// something on the bus answered.
    pub fn test_connection(&self, manager: &ConnectionManager) -> bool {
        match manager.send("0100") {
            Ok(resp) => helpers::clean_hex(&resp).contains(SUPPORTED_PIDS_REPLY),
            Err(e) => {
                debug!("connection test failed: {e}");
                false
            }
        }
    }

    /// Maps an `ATDPN` (or verbose `ATDP`) response onto the protocol
    /// table, defaulting to [Obd2Protocol::Auto] when unrecognized.
    pub fn parse_protocol(response: &str) -> Obd2Protocol {
        // ATDPN answers with the bare id, prefixed with 'A' when the
        // adapter picked the protocol during auto negotiation ("A6")
        let cleaned = helpers::clean_hex(response);
        let digits = cleaned.strip_prefix('A').unwrap_or(&cleaned);
        if digits.len() == 1 {
            if let Some(proto) = helpers::hex_to_byte(digits.as_bytes()[0])
                .and_then(Obd2Protocol::from_id)
            {
                return proto;
            }
        }
        Obd2Protocol::from_describe_text(response).unwrap_or(Obd2Protocol::Auto)
    }
}
