//! Byte-level codec primitives
//!
//! CRC16 and the escaping scheme used by the traffic unit's binary frames.
//! Everything in here is pure; no I/O.

use crc::{Crc, CRC_16_XMODEM};

use super::ProtocolError;

/// CRC algorithm shared by both device protocols (CCITT polynomial 0x1021,
/// zero initial value).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC16 of a byte span
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Incremental CRC16 accumulator
///
/// The recorder protocol mixes header and payload contributions into a single
/// running value, and validates a capture by checking that the accumulator
/// returns to zero after the trailing CRC bytes have been folded in. XMODEM
/// has no init/xorout adjustments, so the running value can be resumed
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16 {
    state: u16,
}

impl Crc16 {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut digest = CRC16.digest_with_initial(self.state);
        digest.update(data);
        self.state = digest.finalize();
    }

    pub fn update_byte(&mut self, byte: u8) {
        self.update(&[byte]);
    }

    pub fn finish(self) -> u16 {
        self.state
    }

    /// Peek at the running value without consuming the accumulator
    pub fn value(&self) -> u16 {
        self.state
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame start marker of the traffic unit's binary protocol
pub const FRAME_START: u8 = 0x73;
/// Escape marker
pub const FRAME_ESCAPE: u8 = 0x78;
/// Substitute for an escaped start marker
pub const ESCAPED_START: u8 = 0x31;
/// Substitute for an escaped escape marker
pub const ESCAPED_ESCAPE: u8 = 0x55;

/// Escape a payload for transmission inside a traffic-unit frame
///
/// Start and escape markers are replaced by two-byte escape sequences; all
/// other bytes pass through unchanged.
pub fn escape_frame(src: &[u8], dst: &mut Vec<u8>) {
    for &byte in src {
        match byte {
            FRAME_START => {
                dst.push(FRAME_ESCAPE);
                dst.push(ESCAPED_START);
            }
            FRAME_ESCAPE => {
                dst.push(FRAME_ESCAPE);
                dst.push(ESCAPED_ESCAPE);
            }
            _ => dst.push(byte),
        }
    }
}

/// Resolve an escape substitute back to the original byte
pub fn unescape_byte(substitute: u8) -> Result<u8, ProtocolError> {
    match substitute {
        ESCAPED_START => Ok(FRAME_START),
        ESCAPED_ESCAPE => Ok(FRAME_ESCAPE),
        other => Err(ProtocolError::UnknownEscape(other)),
    }
}

/// Unescape a complete buffer
///
/// Used by tests and by callers that already hold the whole escaped span; the
/// receive path unescapes on the fly instead, because an escape marker can be
/// the last byte of a read chunk.
pub fn unescape_frame(raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(&byte) = iter.next() {
        if byte == FRAME_ESCAPE {
            let &substitute = iter.next().ok_or(ProtocolError::TruncatedRecord)?;
            out.push(unescape_byte(substitute)?);
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}
