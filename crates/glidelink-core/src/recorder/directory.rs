//! Flight directory decoding
//!
//! The directory dump uses the same record grammar as a flight dump, but only
//! the metadata records matter: position fixes are skipped, and every end
//! record closes one directory entry. Flight start and end times are derived
//! from the most recent time/date anchor and the offsets carried by the end
//! record.

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tracing::debug;

use super::records::{
    self, compressed_fix_len, decode_time_date, field, full_fix_len, Cursor, DIRECTORY_END_LEN,
    MAX_FORMAT_VERSION, TYPE_MASK,
};
use crate::protocol::ProtocolError;

/// One logged flight, as listed by the recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub serial_number: u16,
    pub pilot_name: String,
    pub competition_id: String,
    pub glider_id: String,
    /// Recorder detected a takeoff during this log
    pub took_off: bool,
    pub first_fix_time: NaiveDateTime,
    pub last_fix_time: NaiveDateTime,
    pub recording_duration: Duration,
}

/// Longest string value accepted from a tagged field
const MAX_FIELD_STRING: usize = 64;

/// Decode a tagged string field: the record's own extent up to the first NUL.
/// Trailing blanks stay, a fragment may continue in the next field.
pub(crate) fn field_string(value: &[u8]) -> String {
    let cut = value
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(value.len())
        .min(MAX_FIELD_STRING);
    String::from_utf8_lossy(&value[..cut]).to_string()
}

fn anchor_datetime(record: &[u8]) -> Result<NaiveDateTime, ProtocolError> {
    let anchor = decode_time_date(record)?;
    let date = NaiveDate::from_ymd_opt(anchor.year, anchor.month, anchor.day)
        .ok_or(ProtocolError::TruncatedRecord)?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt + TimeDelta::seconds(i64::from(anchor.second_of_day)))
        .ok_or(ProtocolError::TruncatedRecord)
}

/// In-progress entry state, reset at every separator
#[derive(Default)]
struct PendingEntry {
    serial_number: u16,
    pilot: [String; 4],
    competition_id: String,
    glider_id: String,
    took_off: bool,
}

/// Scan a raw directory dump into the list of logged flights
///
/// Metadata records accumulate into a pending entry; the end record closes it
/// using the offsets it carries: bytes 1..4 are the recording duration in
/// seconds, bytes 4..7 the seconds between the recording start and the most
/// recent time/date anchor.
pub fn decode_directory(data: &[u8]) -> Result<Vec<DirectoryEntry>, ProtocolError> {
    let mut flights = Vec::new();
    let mut cur = Cursor::new(data);
    let mut version: u8 = 0;
    let mut pending = PendingEntry::default();
    let mut anchor: Option<NaiveDateTime> = None;

    while let Some(lead) = cur.peek() {
        match lead & TYPE_MASK {
            records::REC_SEPARATOR => {
                version = lead & !TYPE_MASK;
                if version > MAX_FORMAT_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(version));
                }
                pending = PendingEntry::default();
                cur.skip(1)?;
            }
            records::REC_VAR_TIMED | records::REC_VAR_UNTIMED => {
                let header_len = if lead & TYPE_MASK == records::REC_VAR_TIMED {
                    3
                } else {
                    2
                };
                let total = cur.peek_slice(2)?[1] as usize;
                if total <= header_len {
                    return Err(ProtocolError::TruncatedRecord);
                }
                let record = cur.take(total)?;
                let id = record[header_len];
                let value = &record[header_len + 1..];
                match id {
                    field::PILOT1 => pending.pilot[0] = field_string(value),
                    field::PILOT2 => pending.pilot[1] = field_string(value),
                    field::PILOT3 => pending.pilot[2] = field_string(value),
                    field::PILOT4 => pending.pilot[3] = field_string(value),
                    field::COMPETITION_ID => pending.competition_id = field_string(value),
                    field::GLIDER_ID => pending.glider_id = field_string(value),
                    field::HEADER_INFO => {
                        if value.len() < 2 {
                            return Err(ProtocolError::TruncatedRecord);
                        }
                        pending.serial_number = u16::from(value[0]) * 256 + u16::from(value[1]);
                    }
                    field::EVENT_TAKEOFF => pending.took_off = true,
                    _ => {}
                }
            }
            records::REC_FILL => cur.skip(1)?,
            records::REC_FIX_FULL => cur.skip(full_fix_len(version))?,
            records::REC_FIX_COMPRESSED => {
                if cur.peek_slice(3)?[2] & 0x80 != 0 {
                    // end condition used by some firmware revisions
                    break;
                }
                let len = compressed_fix_len(version)
                    .ok_or(ProtocolError::UnsupportedVersion(version))?;
                cur.skip(len)?;
            }
            records::REC_TIME_DATE => {
                anchor = Some(anchor_datetime(cur.take(8)?)?);
            }
            records::REC_END => {
                let record = cur.take(DIRECTORY_END_LEN)?;
                let anchor = anchor.ok_or(ProtocolError::TruncatedRecord)?;
                let duration = records::u24_be(&record[1..4]);
                let start_offset = records::u24_be(&record[4..7]);

                let first = anchor - TimeDelta::seconds(i64::from(start_offset));
                let pilot_name = pending
                    .pilot
                    .iter()
                    .map(String::as_str)
                    .collect::<String>()
                    .trim_end()
                    .to_string();
                flights.push(DirectoryEntry {
                    serial_number: pending.serial_number,
                    pilot_name,
                    competition_id: std::mem::take(&mut pending.competition_id),
                    glider_id: std::mem::take(&mut pending.glider_id),
                    took_off: pending.took_off,
                    first_fix_time: first,
                    last_fix_time: first + TimeDelta::seconds(i64::from(duration)),
                    recording_duration: Duration::from_secs(u64::from(duration)),
                });
            }
            _ => return Err(ProtocolError::TruncatedRecord),
        }
    }

    debug!(flights = flights.len(), "directory decoded");
    Ok(flights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn var_record(id: u8, value: &[u8]) -> Vec<u8> {
        let mut rec = vec![records::REC_VAR_UNTIMED, (3 + value.len()) as u8, id];
        rec.extend_from_slice(value);
        rec
    }

    fn time_date(seconds: u32, y: u8, m: u8, d: u8) -> Vec<u8> {
        vec![
            records::REC_TIME_DATE,
            0,
            (seconds >> 16) as u8,
            (seconds >> 8) as u8,
            seconds as u8,
            y,
            m,
            d,
        ]
    }

    fn end_record(duration: u32, start_offset: u32) -> Vec<u8> {
        vec![
            records::REC_END,
            (duration >> 16) as u8,
            (duration >> 8) as u8,
            duration as u8,
            (start_offset >> 16) as u8,
            (start_offset >> 8) as u8,
            start_offset as u8,
        ]
    }

    fn one_flight(pilot: &str, duration: u32) -> Vec<u8> {
        let mut dump = vec![records::REC_SEPARATOR | 1];
        dump.extend(var_record(field::PILOT1, pilot.as_bytes()));
        dump.extend(var_record(field::HEADER_INFO, &[0x01, 0x41, 100, 0x33, 0x16, 0, 6]));
        dump.extend(var_record(field::EVENT_TAKEOFF, &[0]));
        // Anchor at 12:00:00 on 2004-07-15
        dump.extend(time_date(12 * 3600, 0x04, 0x07, 0x15));
        dump.extend(end_record(duration, 600));
        dump
    }

    #[test]
    fn single_flight_entry() {
        let flights = decode_directory(&one_flight("HARRY HAWK", 3600)).unwrap();
        assert_eq!(flights.len(), 1);
        let f = &flights[0];
        assert_eq!(f.pilot_name, "HARRY HAWK");
        assert_eq!(f.serial_number, 0x0141);
        assert!(f.took_off);
        assert_eq!(f.recording_duration, Duration::from_secs(3600));
        // Start 600 s before the anchor, end an hour later
        let expected_first = NaiveDate::from_ymd_opt(2004, 7, 15)
            .unwrap()
            .and_hms_opt(11, 50, 0)
            .unwrap();
        assert_eq!(f.first_fix_time, expected_first);
        assert_eq!(
            f.last_fix_time,
            expected_first + TimeDelta::seconds(3600)
        );
    }

    #[test]
    fn entry_count_matches_end_markers() {
        let mut dump = Vec::new();
        for i in 0..3 {
            dump.extend(one_flight(&format!("PILOT {i}"), 100 * (i as u32 + 1)));
        }
        let flights = decode_directory(&dump).unwrap();
        assert_eq!(flights.len(), 3);
        assert_eq!(flights[2].pilot_name, "PILOT 2");
    }

    #[test]
    fn pilot_fragments_concatenate() {
        let mut dump = vec![records::REC_SEPARATOR | 1];
        dump.extend(var_record(field::PILOT1, b"JOHN "));
        dump.extend(var_record(field::PILOT2, b"DOE"));
        dump.extend(time_date(0, 0x04, 0x01, 0x01));
        dump.extend(end_record(10, 0));
        let flights = decode_directory(&dump).unwrap();
        assert_eq!(flights[0].pilot_name, "JOHN DOE");
    }

    #[test]
    fn empty_dump_has_no_flights() {
        assert!(decode_directory(&[]).unwrap().is_empty());
    }

    #[test]
    fn unsupported_version_rejected() {
        let dump = [records::REC_SEPARATOR | 2];
        assert!(matches!(
            decode_directory(&dump),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn truncation_never_panics() {
        let dump = one_flight("TRUNCATED", 3600);
        for cut in 0..dump.len() {
            // Every prefix must either fail cleanly or yield fewer entries
            match decode_directory(&dump[..cut]) {
                Ok(flights) => assert!(flights.is_empty()),
                Err(e) => assert!(matches!(
                    e,
                    ProtocolError::TruncatedRecord | ProtocolError::UnsupportedVersion(_)
                )),
            }
        }
    }

    #[test]
    fn fixes_are_skipped() {
        let mut dump = vec![records::REC_SEPARATOR | 1];
        dump.extend(time_date(1000, 0x04, 0x01, 0x01));
        // One full fix (12 bytes under version 1), ignored by the scan
        let mut fix = vec![records::REC_FIX_FULL | 0x10];
        fix.extend_from_slice(&[0; 11]);
        dump.extend(&fix);
        dump.extend(end_record(50, 0));
        let flights = decode_directory(&dump).unwrap();
        assert_eq!(flights.len(), 1);
    }
}
