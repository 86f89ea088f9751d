//! Hex-string helpers shared by the wire codecs.
//!
//! ELM327 adapters talk ASCII hex with optional spaces between byte pairs
//! (controlled by `ATS0`/`ATS1`), so everything in here is tolerant of
//! whitespace and of odd trailing nibbles.

const HEX: [u8; 16] = *b"0123456789ABCDEF";

/// Strips everything that is not an ASCII hex digit and uppercases the rest.
pub fn clean_hex(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Converts a single ASCII hex digit to its value
pub fn hex_to_byte(hex: u8) -> Option<u8> {
    match hex {
        b'0'..=b'9' => Some(hex - b'0'),
        b'a'..=b'f' => Some(hex - b'a' + 10),
        b'A'..=b'F' => Some(hex - b'A' + 10),
        _ => None,
    }
}

/// Decodes a hex string into bytes, ignoring whitespace.
/// A trailing odd nibble is dropped.
pub fn decode_hex(input: &str) -> Vec<u8> {
    let nibbles: Vec<u8> = input.bytes().filter_map(hex_to_byte).collect();
    nibbles
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect()
}

/// Encodes bytes as an uppercase hex string without separators
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[*b as usize >> 4] as char);
        out.push(HEX[*b as usize & 0xF] as char);
    }
    out
}

/// True when the line consists entirely of hex digits and whitespace,
/// with at least one digit. Distinguishes frame lines from adapter
/// chatter such as `SEARCHING...`.
pub fn is_hex_line(line: &str) -> bool {
    let mut seen_digit = false;
    for c in line.chars() {
        if c.is_ascii_hexdigit() {
            seen_digit = true;
        } else if !c.is_whitespace() {
            return false;
        }
    }
    seen_digit
}
