//! Flight log decoding
//!
//! Turns a raw flight dump into a structured log. The dump is walked twice:
//! the first pass collects header metadata and the task declaration and pins
//! down the absolute time of the first fix (time/date anchors re-anchor it
//! whenever they appear); the second pass replays the stream and emits fixes
//! and event markers in recorded order, now with absolute timestamps.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tracing::debug;

use super::records::{
    self, compressed_fix_len, decode_time_date, field, full_fix_len, Cursor, MAX_FORMAT_VERSION,
    SECURITY_RECORD_LEN, TYPE_MASK,
};
use crate::protocol::ProtocolError;

/// Header metadata of one flight
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogHeader {
    /// A header-info field was present in the dump
    pub device_info: bool,
    pub serial_number: u16,
    pub pilot: String,
    pub glider_type: String,
    pub glider_id: String,
    pub competition_id: String,
    pub competition_class: String,
    /// GPS datum code as recorded by the device
    pub gps_datum: u8,
    /// Hardware revision, both nibbles of the raw byte
    pub hardware_version: (u8, u8),
    pub firmware_version: (u8, u8),
    pub fix_accuracy: u8,
}

/// Task waypoint as carried in the declaration, coordinates in thousandths of
/// minutes (1/60000 degree)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskWaypoint {
    pub name: String,
    pub kind: u8,
    pub lat: i32,
    pub lon: i32,
}

impl TaskWaypoint {
    /// Decode the packed 13-byte waypoint layout
    pub fn from_packed(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < 13 {
            return Err(ProtocolError::TruncatedRecord);
        }
        let mut lat =
            (i32::from(p[7] & 0x7f) << 16) | (i32::from(p[8]) << 8) | i32::from(p[9]);
        if p[7] & 0x80 != 0 {
            lat = -lat;
        }
        let mut lon = (i32::from(p[10]) << 16) | (i32::from(p[11]) << 8) | i32::from(p[12]);
        if p[6] & 0x80 != 0 {
            lon = -lon;
        }
        Ok(Self {
            name: String::from_utf8_lossy(&p[0..6]).to_string(),
            kind: p[6] & 0x7f,
            lat,
            lon,
        })
    }
}

/// Task declaration reconstructed from the tagged fields of a flight dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDeclaration {
    pub declaration_time: NaiveDateTime,
    /// Expected date of flight (day, month, two-digit year), all zero when the
    /// recorder never sent one
    pub flight_date: [u8; 3],
    pub task_id: u32,
    pub turnpoint_count: usize,
    pub takeoff: TaskWaypoint,
    pub start: TaskWaypoint,
    pub finish: TaskWaypoint,
    pub landing: TaskWaypoint,
    pub turnpoints: Vec<TaskWaypoint>,
}

/// One position fix with absolute timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fix {
    pub time: NaiveDateTime,
    /// GPS reported a valid position
    pub valid: bool,
    /// Thousandths of minutes, signed
    pub lat: i32,
    pub lon: i32,
    /// Raw 12-bit barometric pressure code
    pub pressure_code: u32,
    /// GPS altitude in meters
    pub gps_altitude: i32,
    pub fix_accuracy: u32,
    /// Engine noise level after the reporting curve and clamp
    pub engine_noise: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    ButtonPressed,
    TakeoffDetected,
}

/// Entries of the replayed log, in recorded order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogItem {
    Fix(Fix),
    Event { kind: LogEvent, time: NaiveDateTime },
}

/// Fully decoded flight
#[derive(Debug, Clone, PartialEq)]
pub struct FlightLog {
    pub header: LogHeader,
    pub first_fix_time: NaiveDateTime,
    pub task: Option<TaskDeclaration>,
    pub items: Vec<LogItem>,
    /// Timezone offset in minutes from the declaration field, when present
    pub timezone_minutes: Option<i32>,
    /// Timezone estimate in minutes derived from the longitude of the first
    /// valid fix
    pub timezone_estimate_minutes: i32,
    /// Number of leading bytes covered by the appended signature block
    pub signed_length: usize,
}

impl FlightLog {
    pub fn fixes(&self) -> impl Iterator<Item = &Fix> {
        self.items.iter().filter_map(|item| match item {
            LogItem::Fix(fix) => Some(fix),
            LogItem::Event { .. } => None,
        })
    }
}

/// Metadata gathered by the first pass
#[derive(Default)]
struct MetadataPass {
    header: LogHeader,
    version: u8,
    first_fix_time: Option<NaiveDateTime>,
    /// Relative seconds accumulated since the start of the recording
    time_relative: i64,
    /// Relative time at which the declaration was completed
    declaration_time: Option<i64>,
    flight_date: [u8; 3],
    task_id: u32,
    turnpoint_count: usize,
    takeoff: TaskWaypoint,
    start: TaskWaypoint,
    finish: TaskWaypoint,
    landing: TaskWaypoint,
    turnpoints: Vec<TaskWaypoint>,
    timezone_minutes: Option<i32>,
    /// Longitude used for the timezone estimate: the last one stored before
    /// the first valid fix
    estimate_lon: i32,
    estimate_pinned: bool,
    /// Running longitude for applying compressed-fix deltas
    lon: i32,
    signed_length: usize,
}

fn anchor_datetime(record: &[u8]) -> Result<(NaiveDateTime, u32), ProtocolError> {
    let anchor = decode_time_date(record)?;
    let date = NaiveDate::from_ymd_opt(anchor.year, anchor.month, anchor.day)
        .ok_or(ProtocolError::TruncatedRecord)?;
    let dt = date
        .and_hms_opt(0, 0, 0)
        .ok_or(ProtocolError::TruncatedRecord)?
        + TimeDelta::seconds(i64::from(anchor.second_of_day));
    Ok((dt, anchor.delta))
}

/// Split a variable record into (field id, value, relative-time delta)
fn split_var_record<'a>(
    cur: &mut Cursor<'a>,
    lead: u8,
) -> Result<(u8, &'a [u8], u32), ProtocolError> {
    let timed = lead & TYPE_MASK == records::REC_VAR_TIMED;
    let header_len = if timed { 3 } else { 2 };
    let total = cur.peek_slice(2)?[1] as usize;
    if total <= header_len {
        return Err(ProtocolError::TruncatedRecord);
    }
    let record = cur.take(total)?;
    let delta = if timed { u32::from(record[2]) } else { 0 };
    Ok((record[header_len], &record[header_len + 1..], delta))
}

impl MetadataPass {
    fn run(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut meta = Self::default();
        let mut cur = Cursor::new(data);

        loop {
            let Some(lead) = cur.peek() else {
                // Ran off the end without an end record
                return Err(ProtocolError::TruncatedRecord);
            };
            match lead & TYPE_MASK {
                records::REC_SEPARATOR => {
                    meta.time_relative = 0;
                    meta.version = lead & !TYPE_MASK;
                    if meta.version > MAX_FORMAT_VERSION {
                        return Err(ProtocolError::UnsupportedVersion(meta.version));
                    }
                    cur.skip(1)?;
                }
                records::REC_FILL => cur.skip(1)?,
                records::REC_TIME_DATE => {
                    let (anchor, delta) = anchor_datetime(cur.take(8)?)?;
                    meta.time_relative += i64::from(delta);
                    // Re-anchor: the anchor is `time_relative` seconds into
                    // the recording
                    meta.first_fix_time = Some(anchor - TimeDelta::seconds(meta.time_relative));
                }
                records::REC_FIX_FULL | records::REC_FIX_COMPRESSED => {
                    let head = cur.peek_slice(3)?;
                    if head[2] & 0x80 != 0 {
                        // end condition folded into a fix record
                        meta.signed_length = cur.position();
                        break;
                    }
                    meta.time_relative += i64::from(head[2]);
                    let valid = head[0] & 0x10 != 0;

                    if lead & TYPE_MASK == records::REC_FIX_FULL {
                        let rec = cur.take(full_fix_len(meta.version))?;
                        let mut lon = records::u24_be(&rec[6..9]) as i32;
                        if rec[9] & 0x80 != 0 {
                            lon = -lon;
                        }
                        meta.lon = lon;
                    } else {
                        let len = compressed_fix_len(meta.version)
                            .ok_or(ProtocolError::UnsupportedVersion(meta.version))?;
                        let rec = cur.take(len)?;
                        let mut delta_lon =
                            (i32::from(rec[3] & 0x78) << 5) | i32::from(rec[5]);
                        if rec[6] & 0x80 != 0 {
                            delta_lon = -delta_lon;
                        }
                        meta.lon += delta_lon;
                    }

                    if !meta.estimate_pinned {
                        meta.estimate_lon = meta.lon;
                        if valid {
                            meta.estimate_pinned = true;
                        }
                    }
                }
                records::REC_END => {
                    let consumed = SECURITY_RECORD_LEN.min(cur.remaining());
                    cur.skip(consumed)?;
                    meta.signed_length = cur.position();
                    break;
                }
                records::REC_VAR_TIMED | records::REC_VAR_UNTIMED => {
                    let (id, value, delta) = split_var_record(&mut cur, lead)?;
                    meta.time_relative += i64::from(delta);
                    meta.apply_field(id, value)?;
                }
                _ => {
                    meta.signed_length = cur.position();
                    break;
                }
            }
        }

        Ok(meta)
    }

    fn apply_field(&mut self, id: u8, value: &[u8]) -> Result<(), ProtocolError> {
        use super::directory::field_string;
        match id {
            field::PILOT1..=field::PILOT4 => {
                self.header.pilot.push_str(&field_string(value));
            }
            field::GLIDER_TYPE => self.header.glider_type = field_string(value),
            field::GLIDER_ID => self.header.glider_id = field_string(value),
            field::COMPETITION_ID => self.header.competition_id = field_string(value),
            field::COMPETITION_CLASS => self.header.competition_class = field_string(value),
            field::HEADER_INFO => {
                // Older firmware sends only the seven bytes read here
                if value.len() < 7 {
                    return Err(ProtocolError::TruncatedRecord);
                }
                self.header.device_info = true;
                self.header.serial_number = u16::from(value[0]) * 256 + u16::from(value[1]);
                self.header.gps_datum = value[2];
                self.header.hardware_version = (value[3] >> 4, value[3] & 0x0f);
                self.header.firmware_version = (value[4] >> 4, value[4] & 0x0f);
                self.header.fix_accuracy = value[6];
            }
            field::TURNPOINT_COUNT => {
                if value.is_empty() {
                    return Err(ProtocolError::TruncatedRecord);
                }
                self.turnpoint_count = value[0] as usize;
                self.declaration_time = Some(self.time_relative);
            }
            field::TASK_ID => {
                if value.len() < 2 {
                    return Err(ProtocolError::TruncatedRecord);
                }
                self.task_id = u32::from(value[0]) * 256 + u32::from(value[1]);
                self.declaration_time = Some(self.time_relative);
            }
            field::FLIGHT_DATE => {
                if value.len() < 3 {
                    return Err(ProtocolError::TruncatedRecord);
                }
                self.flight_date.copy_from_slice(&value[0..3]);
            }
            field::TIMEZONE => {
                if value.is_empty() {
                    return Err(ProtocolError::TruncatedRecord);
                }
                self.timezone_minutes = Some(15 * i32::from(value[0] as i8));
            }
            field::TAKEOFF => self.takeoff = TaskWaypoint::from_packed(value)?,
            field::START => self.start = TaskWaypoint::from_packed(value)?,
            field::FINISH => self.finish = TaskWaypoint::from_packed(value)?,
            field::LANDING => self.landing = TaskWaypoint::from_packed(value)?,
            id if (field::TURNPOINT1
                ..field::TURNPOINT1 + field::TURNPOINT_SLOTS as u8)
                .contains(&id) =>
            {
                let index = (id - field::TURNPOINT1) as usize;
                if self.turnpoints.len() <= index {
                    self.turnpoints
                        .resize_with(index + 1, TaskWaypoint::default);
                }
                self.turnpoints[index] = TaskWaypoint::from_packed(value)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Decode a raw flight dump
pub fn decode_flight(data: &[u8]) -> Result<FlightLog, ProtocolError> {
    let meta = MetadataPass::run(data)?;
    let first_fix_time = meta
        .first_fix_time
        .ok_or(ProtocolError::TruncatedRecord)?;

    // Timezone estimate: whole hours from the longitude, 15 degrees per hour
    let estimate_hours = ((f64::from(meta.estimate_lon) + 450_000.0) / 900_000.0).floor();
    let timezone_estimate_minutes = 60 * estimate_hours as i32;

    let task = meta.declaration_time.map(|decl| TaskDeclaration {
        declaration_time: first_fix_time + TimeDelta::seconds(decl),
        flight_date: meta.flight_date,
        task_id: meta.task_id,
        turnpoint_count: meta.turnpoint_count.min(field::TURNPOINT_SLOTS),
        takeoff: meta.takeoff.clone(),
        start: meta.start.clone(),
        finish: meta.finish.clone(),
        landing: meta.landing.clone(),
        turnpoints: meta.turnpoints.clone(),
    });

    let items = replay_items(data, &meta, first_fix_time)?;
    debug!(
        fixes = items
            .iter()
            .filter(|i| matches!(i, LogItem::Fix(_)))
            .count(),
        "flight decoded"
    );

    Ok(FlightLog {
        header: meta.header,
        first_fix_time,
        task,
        items,
        timezone_minutes: meta.timezone_minutes,
        timezone_estimate_minutes,
        signed_length: meta.signed_length,
    })
}

/// Second pass: replay the stream and emit fixes and events with absolute
/// timestamps
fn replay_items(
    data: &[u8],
    meta: &MetadataPass,
    first_fix_time: NaiveDateTime,
) -> Result<Vec<LogItem>, ProtocolError> {
    let mut items = Vec::new();
    let mut cur = Cursor::new(data);
    let mut realtime = first_fix_time;
    let mut lat: i32 = 0;
    let mut lon: i32 = 0;
    let version = meta.version;

    while let Some(lead) = cur.peek() {
        match lead & TYPE_MASK {
            records::REC_SEPARATOR | records::REC_FILL => cur.skip(1)?,
            records::REC_TIME_DATE => {
                let rec = cur.take(8)?;
                realtime += TimeDelta::seconds(i64::from(rec[1]));
            }
            records::REC_END => break,
            records::REC_FIX_FULL | records::REC_FIX_COMPRESSED => {
                let head = cur.peek_slice(3)?;
                if head[2] & 0x80 != 0 {
                    break;
                }
                realtime += TimeDelta::seconds(i64::from(head[2]));
                let valid = head[0] & 0x10 != 0;
                let pressure_code =
                    (u32::from(head[0] & 0x0f) << 8) | u32::from(head[1]);

                let (gps_alt_code, fix_accuracy, raw_enl);
                if lead & TYPE_MASK == records::REC_FIX_FULL {
                    let rec = cur.take(full_fix_len(version))?;
                    let mut new_lat = (i32::from(rec[3] & 0x7f) << 16)
                        | (i32::from(rec[4]) << 8)
                        | i32::from(rec[5]);
                    if rec[3] & 0x80 != 0 {
                        new_lat = -new_lat;
                    }
                    let mut new_lon = records::u24_be(&rec[6..9]) as i32;
                    if rec[9] & 0x80 != 0 {
                        new_lon = -new_lon;
                    }
                    lat = new_lat;
                    lon = new_lon;
                    gps_alt_code = (u32::from(rec[9] & 0x70) << 4) | u32::from(rec[10]);
                    fix_accuracy = records::hdop_to_fix_accuracy(rec[9] & 0x0f);
                    // The noise byte only exists from format version 1 on
                    raw_enl = if rec.len() > 11 { 4 * i32::from(rec[11]) } else { 0 };
                } else {
                    let len = compressed_fix_len(version)
                        .ok_or(ProtocolError::UnsupportedVersion(version))?;
                    let rec = cur.take(len)?;
                    let mut delta_lat =
                        (i32::from(rec[3] & 0x07) << 8) | i32::from(rec[4]);
                    if rec[3] & 0x80 != 0 {
                        delta_lat = -delta_lat;
                    }
                    let mut delta_lon =
                        (i32::from(rec[3] & 0x78) << 5) | i32::from(rec[5]);
                    if rec[6] & 0x80 != 0 {
                        delta_lon = -delta_lon;
                    }
                    lat += delta_lat;
                    lon += delta_lon;
                    gps_alt_code = (u32::from(rec[6] & 0x70) << 4) | u32::from(rec[7]);
                    fix_accuracy = records::hdop_to_fix_accuracy(rec[6] & 0x0f);
                    raw_enl = 4 * i32::from(rec[8]);
                }

                let engine_noise = records::enl_limit(records::enl_filter(raw_enl));
                items.push(LogItem::Fix(Fix {
                    time: realtime,
                    valid,
                    lat,
                    lon,
                    pressure_code,
                    gps_altitude: 10 * gps_alt_code as i32 - 1000,
                    fix_accuracy,
                    engine_noise,
                }));
            }
            records::REC_VAR_TIMED | records::REC_VAR_UNTIMED => {
                let (id, _value, delta) = split_var_record(&mut cur, lead)?;
                realtime += TimeDelta::seconds(i64::from(delta));
                let kind = match id {
                    field::EVENT_BUTTON => Some(LogEvent::ButtonPressed),
                    field::EVENT_TAKEOFF => Some(LogEvent::TakeoffDetected),
                    _ => None,
                };
                if let Some(kind) = kind {
                    items.push(LogItem::Event {
                        kind,
                        time: realtime,
                    });
                }
            }
            _ => break,
        }
    }
    Ok(items)
}
