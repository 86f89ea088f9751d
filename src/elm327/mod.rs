//! Module for the ELM327 command surface: AT command templates, the
//! physical layer protocol table, and the initialization/negotiation
//! logic built on top of them.

mod commands;
mod detect;
mod protocol;

pub use commands::*;
pub use detect::*;
pub use protocol::*;

/// Messages the adapter prints when the vehicle side of a request failed.
/// Matched case insensitively against the collapsed response text.
const BUS_ERROR_MARKERS: &[&str] = &[
    "UNABLE TO CONNECT",
    "NO DATA",
    "STOPPED",
    "BUS ERROR",
    "BUS BUSY",
    "CAN ERROR",
    "DATA ERROR",
    "BUFFER FULL",
    "FB ERROR",
    "ERROR",
];

/// Scans a response for an adapter reported bus failure, returning the
/// offending text. A lone `?` is the chip's unknown-command marker.
pub(crate) fn find_bus_error(response: &str) -> Option<String> {
    let up = response.to_ascii_uppercase();
    if BUS_ERROR_MARKERS.iter().any(|marker| up.contains(marker)) {
        return Some(response.trim().to_string());
    }
    if response.trim() == "?" {
        return Some("?".to_string());
    }
    None
}
