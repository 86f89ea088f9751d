//! OBD2 physical layer protocol table.

use std::fmt::{Display, Formatter};

use strum::IntoEnumIterator;
use strum_macros::{EnumIter, FromRepr};

/// Physical layer protocols an ELM327 can be told to use.
///
/// The discriminant is the numeric id passed to `ATSP<id>` (hex encoded
/// for ids above 9) and returned by `ATDPN`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Obd2Protocol {
    /// Let the adapter negotiate on its own
    Auto = 0,
    /// SAE J1850 PWM (41.6 kbaud, Ford)
    SaeJ1850Pwm = 1,
    /// SAE J1850 VPW (10.4 kbaud, GM)
    SaeJ1850Vpw = 2,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141 = 3,
    /// ISO 14230-4 KWP2000, 5 baud init
    Kwp2000Slow = 4,
    /// ISO 14230-4 KWP2000, fast init
    Kwp2000Fast = 5,
    /// ISO 15765-4 CAN, 11 bit identifiers at 500 kbaud
    Can11Bit500k = 6,
    /// ISO 15765-4 CAN, 29 bit identifiers at 500 kbaud
    Can29Bit500k = 7,
    /// ISO 15765-4 CAN, 11 bit identifiers at 250 kbaud
    Can11Bit250k = 8,
    /// ISO 15765-4 CAN, 29 bit identifiers at 250 kbaud
    Can29Bit250k = 9,
    /// SAE J1939 CAN, 29 bit identifiers at 250 kbaud
    SaeJ1939 = 10,
    /// User defined CAN channel 1
    User1Can = 11,
    /// User defined CAN channel 2
    User2Can = 12,
}

impl Obd2Protocol {
    /// Candidate order for manual negotiation, most common layouts first.
    /// Modern CAN variants lead; legacy K-Line and J1850 buses trail.
    pub const PROBE_ORDER: [Obd2Protocol; 9] = [
        Obd2Protocol::Can11Bit500k,
        Obd2Protocol::Can11Bit250k,
        Obd2Protocol::Can29Bit500k,
        Obd2Protocol::Can29Bit250k,
        Obd2Protocol::Kwp2000Fast,
        Obd2Protocol::Kwp2000Slow,
        Obd2Protocol::Iso9141,
        Obd2Protocol::SaeJ1850Pwm,
        Obd2Protocol::SaeJ1850Vpw,
    ];

    /// Numeric id used in the `ATSP<id>` command
    pub const fn id(&self) -> u8 {
        *self as u8
    }

    /// Looks a protocol up by its `ATSP`/`ATDPN` id
    pub fn from_id(id: u8) -> Option<Obd2Protocol> {
        Obd2Protocol::from_repr(id)
    }

    /// Human readable description, following the adapter's `ATDP` wording
    pub const fn description(&self) -> &'static str {
        match self {
            Obd2Protocol::Auto => "Automatic",
            Obd2Protocol::SaeJ1850Pwm => "SAE J1850 PWM",
            Obd2Protocol::SaeJ1850Vpw => "SAE J1850 VPW",
            Obd2Protocol::Iso9141 => "ISO 9141-2",
            Obd2Protocol::Kwp2000Slow => "ISO 14230-4 (KWP 5BAUD)",
            Obd2Protocol::Kwp2000Fast => "ISO 14230-4 (KWP FAST)",
            Obd2Protocol::Can11Bit500k => "ISO 15765-4 (CAN 11/500)",
            Obd2Protocol::Can29Bit500k => "ISO 15765-4 (CAN 29/500)",
            Obd2Protocol::Can11Bit250k => "ISO 15765-4 (CAN 11/250)",
            Obd2Protocol::Can29Bit250k => "ISO 15765-4 (CAN 29/250)",
            Obd2Protocol::SaeJ1939 => "SAE J1939 (CAN 29/250)",
            Obd2Protocol::User1Can => "USER1 CAN",
            Obd2Protocol::User2Can => "USER2 CAN",
        }
    }

    /// True for the ISO 15765 CAN variants
    pub const fn is_can(&self) -> bool {
        matches!(
            self,
            Obd2Protocol::Can11Bit500k
                | Obd2Protocol::Can29Bit500k
                | Obd2Protocol::Can11Bit250k
                | Obd2Protocol::Can29Bit250k
        )
    }

    /// Substring of the verbose `ATDP` output that identifies this
    /// protocol. None for [Obd2Protocol::Auto], which `ATDP` only ever
    /// reports as a prefix of the real answer.
    const fn describe_marker(&self) -> Option<&'static str> {
        match self {
            Obd2Protocol::Auto => None,
            Obd2Protocol::SaeJ1850Pwm => Some("PWM"),
            Obd2Protocol::SaeJ1850Vpw => Some("VPW"),
            Obd2Protocol::Iso9141 => Some("9141"),
            Obd2Protocol::Kwp2000Slow => Some("KWP 5BAUD"),
            Obd2Protocol::Kwp2000Fast => Some("KWP FAST"),
            Obd2Protocol::Can11Bit500k => Some("11/500"),
            Obd2Protocol::Can29Bit500k => Some("29/500"),
            Obd2Protocol::Can11Bit250k => Some("11/250"),
            Obd2Protocol::Can29Bit250k => Some("29/250"),
            Obd2Protocol::SaeJ1939 => Some("J1939"),
            Obd2Protocol::User1Can => Some("USER1"),
            Obd2Protocol::User2Can => Some("USER2"),
        }
    }

    /// Matches a verbose `ATDP` description against the protocol table
    pub fn from_describe_text(text: &str) -> Option<Obd2Protocol> {
        let up = text.to_ascii_uppercase();
        Obd2Protocol::iter()
            .find(|p| p.describe_marker().is_some_and(|marker| up.contains(marker)))
    }
}

impl Display for Obd2Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
