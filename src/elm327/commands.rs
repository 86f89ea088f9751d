//! AT command templates understood by ELM327 compatible adapters.
//!
//! AT commands are directed at the adapter itself, never at the vehicle.
//! Each variant is an immutable template; [AtCommand::build] renders the
//! text the connection layer terminates with `\r` and puts on the wire.

use std::fmt::{Display, Formatter};

use super::protocol::Obd2Protocol;

/// A command for the adapter chip itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommand {
    /// `ATZ` - full chip reset, reprints the ident banner
    Reset,
    /// `ATE0` - stop echoing commands back
    EchoOff,
    /// `ATL0` - no linefeed after carriage return
    LinefeedsOff,
    /// `ATH1` - include bus headers in responses
    HeadersOn,
    /// `ATS0` - drop spaces between hex pairs
    SpacesOff,
    /// `ATCAF1` - CAN auto formatting (adapter pads/strips ISO-TP frames)
    CanAutoFormatOn,
    /// `ATSP<id>` - select a physical layer protocol
    SelectProtocol(Obd2Protocol),
    /// `ATDP` - describe the active protocol verbosely
    DescribeProtocol,
    /// `ATDPN` - describe the active protocol by number
    DescribeProtocolNumber,
    /// `ATRV` - read battery voltage at pin 16
    ReadVoltage,
    /// `ATI` - adapter ident string
    Identify,
}

impl AtCommand {
    /// Renders the command text, without the trailing `\r`
    pub fn build(&self) -> String {
        match self {
            AtCommand::Reset => "ATZ".into(),
            AtCommand::EchoOff => "ATE0".into(),
            AtCommand::LinefeedsOff => "ATL0".into(),
            AtCommand::HeadersOn => "ATH1".into(),
            AtCommand::SpacesOff => "ATS0".into(),
            AtCommand::CanAutoFormatOn => "ATCAF1".into(),
            AtCommand::SelectProtocol(p) => format!("ATSP{:X}", p.id()),
            AtCommand::DescribeProtocol => "ATDP".into(),
            AtCommand::DescribeProtocolNumber => "ATDPN".into(),
            AtCommand::ReadVoltage => "ATRV".into(),
            AtCommand::Identify => "ATI".into(),
        }
    }
}

impl Display for AtCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.build())
    }
}
