//! IGC text rendering
//!
//! Renders a decoded flight into the IGC plain-text log format, emulating
//! converter version 4.24 of the manufacturer's own tool so downstream
//! validation software accepts the files. The appended G record encodes the
//! signed span of the raw binary dump.

use std::fmt::Write;

use chrono::Timelike;

use super::flight::{FlightLog, LogEvent, LogItem, TaskWaypoint};

/// Converter version emulated by this renderer (major*100 + minor)
pub const CONVERTER_VERSION: u32 = 424;

/// Manufacturer three-letter code used in the A record
const MANUFACTURER_ID: &str = "GCS";
/// FR TYPE header line contents
const RECORDER_TYPE: &str = "GARRECHT INGENIEURGESELLSCHAFT,VOLKSLOGGER 1.0";

/// Highest serial number expressible as three base-36 digits
const MAX_SERIAL: u16 = 46655;

/// Logger id: the serial number as three base-36 digits
pub fn serial_to_logger_id(serial: u16) -> String {
    let mut value = u32::from(serial.min(MAX_SERIAL));
    let mut id = [b'0'; 3];
    for slot in id.iter_mut().rev() {
        let digit = (value % 36) as u8;
        *slot = if digit < 10 {
            b'0' + digit
        } else {
            b'A' + digit - 10
        };
        value /= 36;
    }
    String::from_utf8_lossy(&id).to_string()
}

/// Drop characters the IGC format reserves or cannot carry
pub fn igc_filter(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            c.is_ascii()
                && (' '..='~').contains(&c)
                && !matches!(c, '$' | '*' | '!' | '\\' | '^' | '~' | ',')
        })
        .collect()
}

/// Barometric altitude in meters from the raw 12-bit pressure code
///
/// The code counts 25 Pa steps; the ISA barometric formula maps the pressure
/// to a pressure altitude.
pub fn pressure_altitude(code: u32) -> i64 {
    let pressure = f64::from(code) * 25.0;
    (44_330.8 * (1.0 - (pressure / 101_325.0).powf(0.190_263))).round() as i64
}

fn hardware_at_least_3_3(log: &FlightLog) -> bool {
    let (maj, min) = log.header.hardware_version;
    log.header.device_info && format!("{maj:X}.{min:X}").as_str() >= "3.3"
}

fn format_time(t: chrono::NaiveDateTime) -> String {
    format!("{:02}{:02}{:02}", t.hour(), t.minute(), t.second())
}

/// One C-record line for a task point; coordinates are clamped to the
/// printable range
fn push_c_line(out: &mut String, wpt: &TaskWaypoint) {
    let lat = i64::from(wpt.lat).unsigned_abs().min(5_400_000);
    let lon = i64::from(wpt.lon).unsigned_abs().min(10_800_000);
    let _ = writeln!(
        out,
        "C{:02}{:05}{}{:03}{:05}{}{}",
        lat / 60000,
        lat % 60000,
        if wpt.lat < 0 { 'S' } else { 'N' },
        lon / 60000,
        lon % 60000,
        if wpt.lon < 0 { 'W' } else { 'E' },
        igc_filter(&wpt.name)
    );
}

/// Render the complete IGC text for a decoded flight
///
/// With `fill_empty` set, mandatory-but-absent header lines are emitted as HO
/// placeholder records and the converter version is noted in an L record.
pub fn render_igc(log: &FlightLog, fill_empty: bool) -> String {
    let mut out = String::new();
    let header = &log.header;
    let with_enl = hardware_at_least_3_3(log);

    let _ = writeln!(
        out,
        "A{}{}",
        MANUFACTURER_ID,
        serial_to_logger_id(header.serial_number)
    );

    let date = log.first_fix_time.date();
    let _ = writeln!(
        out,
        "HFDTE{}",
        date.format("%d%m%y")
    );
    let _ = writeln!(out, "HFFXA{:03}", header.fix_accuracy);

    let pilot = igc_filter(&header.pilot);
    if !pilot.is_empty() {
        let _ = writeln!(out, "HFPLTPILOT:{pilot}");
    } else if fill_empty {
        out.push_str("HOPLTPILOT:\n");
    }

    let glider_type = igc_filter(&header.glider_type);
    if !glider_type.is_empty() {
        let _ = writeln!(out, "HFGTYGLIDERTYPE:{glider_type}");
    } else if fill_empty {
        out.push_str("HOGTYGLIDERTYPE:\n");
    }

    let glider_id = igc_filter(&header.glider_id);
    if !glider_id.is_empty() {
        let _ = writeln!(out, "HFGIDGLIDERID:{glider_id}");
    } else if fill_empty {
        out.push_str("HOGIDGLIDERID:\n");
    }

    let _ = writeln!(out, "HFDTM{:03}GPSDATUM:WGS84", header.gps_datum);

    if header.device_info {
        let (fmaj, fmin) = header.firmware_version;
        let (hmaj, hmin) = header.hardware_version;
        let _ = writeln!(out, "HFRFWFIRMWAREVERSION:{fmaj:X}.{fmin:X}");
        let _ = writeln!(out, "HFRHWHARDWAREVERSION:{hmaj:X}.{hmin:X}");
        let _ = writeln!(out, "HFFTYFR TYPE:{RECORDER_TYPE}");
    } else {
        out.push_str("HFRFWFIRMWAREVERSION:\n");
        out.push_str("HFRHWHARDWAREVERSION:\n");
    }

    let competition_id = igc_filter(&header.competition_id);
    if !competition_id.is_empty() {
        let _ = writeln!(out, "HFCIDCOMPETITIONID:{competition_id}");
    }
    let competition_class = igc_filter(&header.competition_class);
    if !competition_class.is_empty() {
        let _ = writeln!(out, "HFCCLCOMPETITIONCLASS:{competition_class}");
    }

    // Timezone: prefer the recorded field, fall back to the longitude-derived
    // estimate
    let tzn = log
        .timezone_minutes
        .unwrap_or(log.timezone_estimate_minutes);
    let _ = writeln!(
        out,
        "HFTZNTIMEZONE:UTC{}{:02}:{:02}",
        if tzn < 0 { '-' } else { '+' },
        tzn.abs() / 60,
        tzn.abs() % 60
    );

    if with_enl {
        out.push_str("I023638FXA3941ENL\n");
    } else {
        out.push_str("I013638FXA\n");
    }

    if fill_empty {
        let _ = writeln!(
            out,
            "LCONV-VER:{}.{:02}",
            CONVERTER_VERSION / 100,
            CONVERTER_VERSION % 100
        );
    }

    if let Some(task) = &log.task {
        let ntp = task.turnpoint_count.min(12);
        let tid = task.task_id.min(9999);
        let _ = writeln!(
            out,
            "C{}000000{:04}{:02}",
            task.declaration_time.format("%d%m%y%H%M%S"),
            tid,
            ntp
        );
        push_c_line(&mut out, &task.takeoff);
        push_c_line(&mut out, &task.start);
        for i in 0..ntp {
            let wpt = task.turnpoints.get(i).cloned().unwrap_or_default();
            push_c_line(&mut out, &wpt);
        }
        push_c_line(&mut out, &task.finish);
        push_c_line(&mut out, &task.landing);
    }

    for item in &log.items {
        match item {
            LogItem::Fix(fix) => {
                let lat = i64::from(fix.lat).unsigned_abs();
                let lon = i64::from(fix.lon).unsigned_abs();
                let _ = write!(
                    out,
                    "B{}{:02}{:05}{}{:03}{:05}{}{}{:05}{:05}{:03}",
                    format_time(fix.time),
                    lat / 60000,
                    lat % 60000,
                    if fix.lat < 0 { 'S' } else { 'N' },
                    lon / 60000,
                    lon % 60000,
                    if fix.lon < 0 { 'W' } else { 'E' },
                    if fix.valid { 'A' } else { 'V' },
                    pressure_altitude(fix.pressure_code),
                    fix.gps_altitude,
                    fix.fix_accuracy
                );
                if with_enl {
                    let _ = write!(out, "{:03}", fix.engine_noise);
                }
                out.push('\n');
            }
            LogItem::Event { kind, time } => match kind {
                LogEvent::ButtonPressed => {
                    let _ = writeln!(out, "E{}PEVEVENTBUTTON PRESSED", format_time(*time));
                }
                LogEvent::TakeoffDetected => {
                    let _ = writeln!(out, "LGCSTKF{}TAKEOFF DETECTED", format_time(*time));
                }
            },
        }
    }

    out
}

/// Integrity block over the signed span of the raw dump: 6-bit groups mapped
/// into the printable range, 36 characters per G line
pub fn g_record(binary: &[u8]) -> String {
    let mut bits: Vec<u8> = Vec::with_capacity(binary.len() * 4 / 3 + 4);
    for chunk in binary.chunks(3) {
        let mut word: u32 = 0;
        for (i, &b) in chunk.iter().enumerate() {
            word |= u32::from(b) << (16 - 8 * i);
        }
        // One 6-bit group per input byte, plus the remainder group
        let groups = chunk.len() + 1;
        for g in 0..groups {
            bits.push((((word >> (18 - 6 * g)) & 0x3f) as u8) + 0x30);
        }
    }

    let mut out = String::new();
    for line in bits.chunks(36) {
        out.push('G');
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out
}
