//! Bit level decoding of diagnostic trouble code responses.
//!
//! Covers the OBD2 read-DTC services: mode 03 (stored), 07 (pending) and
//! 0A (permanent). Decoding is total - a response that cannot be
//! interpreted yields no codes (with a warn log) instead of an error,
//! since partially garbled adapter output is expected in the field.

use std::fmt::{Display, Formatter};

use crate::helpers;

/// Vehicle system a trouble code belongs to, from the top two bits of its
/// first byte
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DtcCategory {
    /// P codes - engine, transmission and associated drivetrain
    Powertrain,
    /// C codes - brakes, steering, suspension
    Chassis,
    /// B codes - cabin and body systems
    Body,
    /// U codes - network and module communication faults
    Network,
}

impl DtcCategory {
    /// Canonical letter prefix of the category
    pub const fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// Storage class of a trouble code, derived from which read service the
/// response answers
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DtcKind {
    /// Confirmed and stored in non volatile memory (mode 03, response 43)
    Stored,
    /// Failure condition seen but not yet confirmed (mode 07, response 47)
    Pending,
    /// Survives a code clear until the ECU sees a full pass (mode 0A,
    /// response 4A)
    Permanent,
}

impl DtcKind {
    /// Maps a response mode byte to the storage class it reports
    pub fn from_mode_byte(mode: u8) -> Option<DtcKind> {
        match mode {
            0x43 => Some(DtcKind::Stored),
            0x47 => Some(DtcKind::Pending),
            0x4A => Some(DtcKind::Permanent),
            _ => None,
        }
    }

    /// Request string that elicits codes of this class
    pub const fn request(&self) -> &'static str {
        match self {
            DtcKind::Stored => "03",
            DtcKind::Pending => "07",
            DtcKind::Permanent => "0A",
        }
    }
}

/// One decoded diagnostic trouble code
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dtc {
    /// Raw two byte value as reported by the ECU
    pub raw: u16,
    /// Storage class of the code
    pub kind: DtcKind,
}

impl Dtc {
    /// Category from the top two bits of the first byte
    pub const fn category(&self) -> DtcCategory {
        match (self.raw >> 14) & 0b11 {
            0b00 => DtcCategory::Powertrain,
            0b01 => DtcCategory::Chassis,
            0b10 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    /// First digit of the code (0-3), from bits 13..12
    pub const fn first_digit(&self) -> u8 {
        ((self.raw >> 12) & 0b11) as u8
    }

    /// Canonical 5 character code string, e.g. `P0133`
    pub fn code(&self) -> String {
        format!(
            "{}{}{:03X}",
            self.category().letter(),
            self.first_digit(),
            self.raw & 0x0FFF
        )
    }
}

impl Display for Dtc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Decodes a raw mode 03/07/0A response string into trouble codes
pub fn decode(response: &str) -> Vec<Dtc> {
    decode_bytes(&helpers::decode_hex(response))
}

/// Decodes an already byte-decoded mode 03/07/0A response.
///
/// `00 00` pairs are padding and skipped; a trailing partial pair is
/// dropped silently, both matching what adapters put on the wire.
pub fn decode_bytes(bytes: &[u8]) -> Vec<Dtc> {
    let Some(mode) = bytes.first() else {
        log::warn!("empty DTC response");
        return Vec::new();
    };
    let Some(kind) = DtcKind::from_mode_byte(*mode) else {
        log::warn!("unexpected DTC response mode byte 0x{mode:02X}");
        return Vec::new();
    };
    let mut codes = Vec::new();
    let pairs = bytes[1..].chunks_exact(2);
    if !pairs.remainder().is_empty() {
        log::debug!("dropping trailing partial DTC pair");
    }
    for pair in pairs {
        let raw = u16::from_be_bytes([pair[0], pair[1]]);
        if raw == 0 {
            continue;
        }
        codes.push(Dtc { raw, kind });
    }
    codes
}
