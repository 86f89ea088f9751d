//! ISO 15765-2 (ISO-TP) frame classification and reassembly.
//!
//! Pure framing logic, no I/O. The connection layer feeds cleaned response
//! lines in here one at a time and writes the flow control frame this
//! module builds. All parse functions are total: malformed or truncated
//! input degrades to an empty payload (with a warn log) rather than
//! erroring, since garbled adapter output is expected in the field.

use crate::helpers;

/// One classified ISO-TP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    /// Complete payload in a single frame
    Single {
        /// Frame payload
        data: Vec<u8>,
    },
    /// Opening frame of a segmented payload
    First {
        /// Advertised total payload length (12 bits)
        total_len: usize,
        /// Leading payload bytes carried by this frame
        data: Vec<u8>,
    },
    /// Continuation frame of a segmented payload
    Consecutive {
        /// Rolling sequence nibble (mod 16). Parsed but not validated
        /// against a counter - frames are consumed in arrival order.
        sequence: u8,
        /// Payload bytes
        data: Vec<u8>,
    },
    /// Receiver side frame authorizing further consecutive frames
    FlowControl {
        /// Consecutive frames allowed before the next flow control
        /// (0 = send everything)
        block_size: u8,
        /// Minimum separation time between frames, in milliseconds
        separation_time_ms: u8,
    },
    /// Not an ISO-TP frame: an already complete OBD2 response line
    Passthrough {
        /// Decoded response bytes
        data: Vec<u8>,
    },
}

impl IsoTpFrame {
    /// Classifies one response line by the first nibble of its cleaned hex
    /// text: `0` single, `1` first, `2` consecutive, `3` flow control,
    /// anything else passes through as a direct response.
    pub fn parse(line: &str) -> IsoTpFrame {
        let hex = helpers::clean_hex(line);
        let Some(first) = hex.chars().next() else {
            return IsoTpFrame::Passthrough { data: Vec::new() };
        };
        match first {
            '0' => {
                // Second nibble is the payload length in bytes
                let len = nibble_at(&hex, 1).unwrap_or(0) as usize;
                let data = take_bytes(&hex, 2, len);
                IsoTpFrame::Single { data }
            }
            '1' => {
                // 12 bit total length across nibbles 1..4
                if hex.len() < 4 {
                    log::warn!("first frame too short: {hex}");
                    return IsoTpFrame::First {
                        total_len: 0,
                        data: Vec::new(),
                    };
                }
                let total_len = usize::from_str_radix(&hex[1..4], 16).unwrap_or(0);
                IsoTpFrame::First {
                    total_len,
                    data: helpers::decode_hex(&hex[4..]),
                }
            }
            '2' => IsoTpFrame::Consecutive {
                sequence: nibble_at(&hex, 1).unwrap_or(0),
                data: helpers::decode_hex(hex.get(2..).unwrap_or("")),
            },
            '3' => {
                let bytes = helpers::decode_hex(&hex);
                if bytes.len() < 3 {
                    log::warn!("flow control frame too short: {hex}");
                }
                IsoTpFrame::FlowControl {
                    block_size: bytes.get(1).copied().unwrap_or(0),
                    separation_time_ms: bytes.get(2).copied().unwrap_or(0),
                }
            }
            _ => IsoTpFrame::Passthrough {
                data: helpers::decode_hex(&hex),
            },
        }
    }

    /// Encodes the frame as the raw hex text written to the adapter
    pub fn to_hex(&self) -> String {
        match self {
            IsoTpFrame::Single { data } => {
                format!("0{:X}{}", data.len() & 0xF, helpers::encode_hex(data))
            }
            IsoTpFrame::First { total_len, data } => {
                format!("1{:03X}{}", total_len & 0xFFF, helpers::encode_hex(data))
            }
            IsoTpFrame::Consecutive { sequence, data } => {
                format!("2{:X}{}", sequence & 0xF, helpers::encode_hex(data))
            }
            IsoTpFrame::FlowControl {
                block_size,
                separation_time_ms,
            } => helpers::encode_hex(&[0x30, *block_size, *separation_time_ms]),
            IsoTpFrame::Passthrough { data } => helpers::encode_hex(data),
        }
    }
}

/// The flow control frame this crate answers a first frame with:
/// ContinueToSend, no block limit, 10 ms separation time.
pub fn flow_control_continue() -> IsoTpFrame {
    IsoTpFrame::FlowControl {
        block_size: 0,
        separation_time_ms: 10,
    }
}

/// Strips a leading 11 bit CAN identifier from a cleaned frame line.
///
/// With `ATH1` set the adapter prefixes each frame with its 3 nibble
/// header, leaving an odd nibble count; header-less lines are even and
/// pass through untouched.
pub fn strip_can_header(hex: &str) -> &str {
    if hex.len() % 2 == 1 && hex.len() > 3 {
        &hex[3..]
    } else {
        hex
    }
}

/// Transient accumulator for one segmented receive.
///
/// Consecutive frames are appended in arrival order; the payload is
/// complete once the advertised total length has been reached, and any
/// padding past it is discarded.
#[derive(Debug, Clone, Default)]
pub struct Reassembler {
    total_len: usize,
    frames_seen: usize,
    buffer: Vec<u8>,
}

impl Reassembler {
    /// Starts reassembly from the contents of a first frame
    pub fn new(total_len: usize, first_data: &[u8]) -> Self {
        let mut r = Self {
            total_len,
            frames_seen: 1,
            buffer: Vec::with_capacity(total_len),
        };
        let take = first_data.len().min(total_len);
        r.buffer.extend_from_slice(&first_data[..take]);
        r
    }

    /// Appends one consecutive frame. Returns true once the payload is
    /// complete.
    pub fn absorb(&mut self, data: &[u8]) -> bool {
        let needed = self.total_len.saturating_sub(self.buffer.len());
        let take = needed.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.frames_seen += 1;
        self.is_complete()
    }

    /// True once the advertised length has been reached
    pub fn is_complete(&self) -> bool {
        self.buffer.len() >= self.total_len
    }

    /// Bytes accumulated so far
    pub fn bytes_received(&self) -> usize {
        self.buffer.len()
    }

    /// Frames absorbed so far, first frame included
    pub fn frames_seen(&self) -> usize {
        self.frames_seen
    }

    /// Consumes the accumulator, yielding exactly the advertised number
    /// of payload bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.buffer.truncate(self.total_len);
        self.buffer
    }
}

fn nibble_at(hex: &str, idx: usize) -> Option<u8> {
    helpers::hex_to_byte(*hex.as_bytes().get(idx)?)
}

/// Decodes `count` payload bytes starting at nibble `start`, degrading to
/// an empty payload when the line is shorter than advertised
fn take_bytes(hex: &str, start: usize, count: usize) -> Vec<u8> {
    let end = start + count * 2;
    match hex.get(start..end) {
        Some(chunk) => helpers::decode_hex(chunk),
        None => {
            log::warn!("frame advertises {count} bytes but carries fewer: {hex}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_single_frame() {
        let frame = IsoTpFrame::parse("06 41 00 BE 3F E8 11");
        assert_eq!(
            frame,
            IsoTpFrame::Single {
                data: vec![0x41, 0x00, 0xBE, 0x3F, 0xE8, 0x11]
            }
        );
    }

    #[test]
    fn single_frame_truncates_to_advertised_length() {
        // Length nibble says 2, trailing padding must be dropped
        let frame = IsoTpFrame::parse("02 41 0C CC CC CC CC CC");
        assert_eq!(
            frame,
            IsoTpFrame::Single {
                data: vec![0x41, 0x0C]
            }
        );
    }

    #[test]
    fn short_single_frame_degrades_to_empty() {
        let frame = IsoTpFrame::parse("06 41 00");
        assert_eq!(frame, IsoTpFrame::Single { data: Vec::new() });
    }

    #[test]
    fn classifies_first_frame_with_length() {
        let frame = IsoTpFrame::parse("10 14 49 02 01 57 30 4B");
        assert_eq!(
            frame,
            IsoTpFrame::First {
                total_len: 0x014,
                data: vec![0x49, 0x02, 0x01, 0x57, 0x30, 0x4B]
            }
        );
    }

    #[test]
    fn classifies_consecutive_frame() {
        let frame = IsoTpFrame::parse("21 49 41 4D 41 43 41 52");
        assert_eq!(
            frame,
            IsoTpFrame::Consecutive {
                sequence: 1,
                data: vec![0x49, 0x41, 0x4D, 0x41, 0x43, 0x41, 0x52]
            }
        );
    }

    #[test]
    fn direct_response_passes_through() {
        let frame = IsoTpFrame::parse("41 0C 1A F8");
        assert_eq!(
            frame,
            IsoTpFrame::Passthrough {
                data: vec![0x41, 0x0C, 0x1A, 0xF8]
            }
        );
    }

    #[test]
    fn empty_input_is_an_empty_passthrough() {
        assert_eq!(
            IsoTpFrame::parse(""),
            IsoTpFrame::Passthrough { data: Vec::new() }
        );
    }

    #[test]
    fn flow_control_round_trips() {
        let fc = flow_control_continue();
        assert_eq!(fc.to_hex(), "30000A");
        assert_eq!(IsoTpFrame::parse("30 00 0A"), fc);
    }

    #[test]
    fn reassembles_vin_response_to_exact_length() {
        // 20 byte VIN-style payload: 6 from the first frame, 7 + 7 from
        // the consecutive frames with the last byte of padding dropped
        let IsoTpFrame::First { total_len, data } =
            IsoTpFrame::parse("10 14 49 02 01 57 30 4B")
        else {
            panic!("expected a first frame");
        };
        let mut r = Reassembler::new(total_len, &data);
        assert!(!r.absorb(&[0x49, 0x41, 0x4D, 0x41, 0x43, 0x41, 0x52]));
        assert!(r.absorb(&[0x30, 0x30, 0x30, 0x30, 0x30, 0x30, 0x31]));
        assert_eq!(r.frames_seen(), 3);
        let payload = r.finish();
        assert_eq!(payload.len(), 20);
        assert_eq!(&payload[..3], &[0x49, 0x02, 0x01]);
        assert_eq!(payload[19], 0x31);
    }

    #[test]
    fn reassembler_discards_padding_in_final_frame() {
        let mut r = Reassembler::new(8, &[1, 2, 3, 4, 5, 6]);
        assert!(r.absorb(&[7, 8, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]));
        assert_eq!(r.finish(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn strips_11_bit_header_from_odd_length_lines() {
        assert_eq!(strip_can_header("7E8064100BE3FE811"), "064100BE3FE811");
        assert_eq!(strip_can_header("064100BE3FE811"), "064100BE3FE811");
    }
}
