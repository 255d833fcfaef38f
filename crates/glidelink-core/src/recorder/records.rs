//! Binary log record grammar
//!
//! The recorder's memory dumps are a stream of variable-shape tagged records;
//! the top three bits of the leading byte select the record type, the rest of
//! the layout follows from type and binary format version. Shared here: the
//! record-type constants, the tagged-field ids used inside variable records,
//! a bounds-checked cursor, and the small numeric conversions both decode
//! passes need.

use crate::protocol::ProtocolError;

/// Mask selecting the record type from the leading byte
pub const TYPE_MASK: u8 = 0xE0;

/// Variable-length record with a relative timestamp
pub const REC_VAR_TIMED: u8 = 0x00;
/// Variable-length record without a timestamp
pub const REC_VAR_UNTIMED: u8 = 0x20;
/// Flight separator; low bits carry the binary format version
pub const REC_SEPARATOR: u8 = 0x40;
/// End-of-data / security record
pub const REC_END: u8 = 0x60;
/// Uncompressed position fix
pub const REC_FIX_FULL: u8 = 0x80;
/// Time and date anchor
pub const REC_TIME_DATE: u8 = 0xA0;
/// Fill byte
pub const REC_FILL: u8 = 0xC0;
/// Delta-compressed position fix
pub const REC_FIX_COMPRESSED: u8 = 0xE0;

/// Highest binary format version this decoder understands
pub const MAX_FORMAT_VERSION: u8 = 1;

/// Length of the security record inside a flight dump
pub const SECURITY_RECORD_LEN: usize = 41;
/// Length of the end record inside a directory dump
pub const DIRECTORY_END_LEN: usize = 7;

/// Size of a full fix record, by binary format version
pub fn full_fix_len(version: u8) -> usize {
    match version {
        0 => 11,
        _ => 12,
    }
}

/// Size of a compressed fix record; version 0 has none
pub fn compressed_fix_len(version: u8) -> Option<usize> {
    match version {
        0 => None,
        _ => Some(9),
    }
}

/// Tagged-field ids used inside variable records and the declaration area
pub mod field {
    /// Pilot name, four consecutive 16-character fragments
    pub const PILOT1: u8 = 0x01;
    pub const PILOT2: u8 = 0x02;
    pub const PILOT3: u8 = 0x03;
    pub const PILOT4: u8 = 0x04;
    pub const GLIDER_TYPE: u8 = 0x05;
    pub const GLIDER_ID: u8 = 0x06;
    pub const COMPETITION_ID: u8 = 0x07;
    pub const COMPETITION_CLASS: u8 = 0x08;
    /// Takeoff / home point, packed waypoint
    pub const TAKEOFF: u8 = 0x09;
    pub const START: u8 = 0x0A;
    pub const FINISH: u8 = 0x0B;
    pub const LANDING: u8 = 0x0C;
    /// First of twelve consecutive turnpoint ids
    pub const TURNPOINT1: u8 = 0x0D;
    pub const TURNPOINT_COUNT: u8 = 0x19;
    pub const TASK_ID: u8 = 0x1A;
    /// Expected date of flight, three bytes day/month/year
    pub const FLIGHT_DATE: u8 = 0x1B;
    /// Signed quarter-hour timezone offset
    pub const TIMEZONE: u8 = 0x1C;
    /// Serial number, datum, hardware/firmware versions, fix accuracy
    pub const HEADER_INFO: u8 = 0x1D;
    /// Pilot pressed the event button
    pub const EVENT_BUTTON: u8 = 0x1E;
    /// Takeoff detected by the recorder
    pub const EVENT_TAKEOFF: u8 = 0x1F;

    /// Number of turnpoint slots in a task declaration
    pub const TURNPOINT_SLOTS: usize = 12;
}

/// Bounds-checked reader over a raw memory dump
///
/// Every read validates against the remaining length first; a truncated or
/// corrupt dump yields [`ProtocolError::TruncatedRecord`] instead of reading
/// past the end.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Look at the next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Borrow the next `n` bytes without consuming them
    pub fn peek_slice(&self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::TruncatedRecord);
        }
        Ok(&self.data[self.pos..self.pos + n])
    }

    /// Consume the next `n` bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let slice = self.peek_slice(n)?;
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }
}

/// Big-endian 24-bit value from three bytes
pub fn u24_be(bytes: &[u8]) -> u32 {
    debug_assert!(bytes.len() >= 3);
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

/// Two-digit BCD byte to its decimal value
pub fn bcd(byte: u8) -> u32 {
    u32::from(byte >> 4) * 10 + u32::from(byte & 0x0f)
}

/// HDOP code to the approximate fix-accuracy figure reported in the log
pub fn hdop_to_fix_accuracy(hdop: u8) -> u32 {
    (f32::from(hdop) * 100.01 / 3.0) as u32
}

/// Non-linear transform of the raw engine-noise level
pub fn enl_filter(enl: i32) -> i32 {
    if enl < 500 {
        enl / 2
    } else if enl < 750 {
        250 + 2 * (enl - 500)
    } else {
        (750.0 + f64::from(enl - 750) * 1.5) as i32
    }
}

/// Clamp an engine-noise level to the reporting range
pub fn enl_limit(enl: i32) -> i32 {
    enl.min(999)
}

/// Calendar date and second-of-day decoded from a time/date anchor record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDateAnchor {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub second_of_day: u32,
    /// Relative-time delta the record itself carries
    pub delta: u32,
}

/// Decode an 8-byte time/date anchor record (leading type byte included)
pub fn decode_time_date(record: &[u8]) -> Result<TimeDateAnchor, ProtocolError> {
    if record.len() < 8 {
        return Err(ProtocolError::TruncatedRecord);
    }
    let mut year = bcd(record[5]) as i32 + 1900;
    if year < 1980 {
        year += 100;
    }
    Ok(TimeDateAnchor {
        year,
        month: bcd(record[6]),
        day: bcd(record[7]),
        second_of_day: u24_be(&record[2..5]),
        delta: u32::from(record[1]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_refuses_reads_past_end() {
        let mut c = Cursor::new(&[1, 2, 3]);
        assert_eq!(c.take(2).unwrap(), &[1, 2]);
        assert!(matches!(c.take(2), Err(ProtocolError::TruncatedRecord)));
        // A failed read consumes nothing
        assert_eq!(c.take_u8().unwrap(), 3);
        assert!(c.is_empty());
    }

    #[test]
    fn bcd_digits() {
        assert_eq!(bcd(0x00), 0);
        assert_eq!(bcd(0x42), 42);
        assert_eq!(bcd(0x99), 99);
    }

    #[test]
    fn time_date_anchor_with_y2k_wrap() {
        // 03:25:45 on 2004-07-15; 45945 seconds = 0x00B379
        let rec = [REC_TIME_DATE, 5, 0x00, 0xB3, 0x79, 0x04, 0x07, 0x15];
        let anchor = decode_time_date(&rec).unwrap();
        assert_eq!(anchor.year, 2004);
        assert_eq!(anchor.month, 7);
        assert_eq!(anchor.day, 15);
        assert_eq!(anchor.second_of_day, 3 * 3600 + 25 * 60 + 45);
        assert_eq!(anchor.delta, 5);
    }

    #[test]
    fn time_date_anchor_pre_2000() {
        let rec = [REC_TIME_DATE, 0, 0, 0, 0, 0x95, 0x06, 0x01];
        assert_eq!(decode_time_date(&rec).unwrap().year, 1995);
    }

    #[test]
    fn enl_curve_pieces() {
        assert_eq!(enl_filter(0), 0);
        assert_eq!(enl_filter(400), 200);
        assert_eq!(enl_filter(600), 450);
        assert_eq!(enl_filter(800), 825);
        assert_eq!(enl_limit(enl_filter(1020)), 999);
    }

    #[test]
    fn fix_sizes_per_version() {
        assert_eq!(full_fix_len(0), 11);
        assert_eq!(full_fix_len(1), 12);
        assert_eq!(compressed_fix_len(0), None);
        assert_eq!(compressed_fix_len(1), Some(9));
    }
}
