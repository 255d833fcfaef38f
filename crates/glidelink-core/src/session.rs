//! Device sessions
//!
//! High-level operations against a connected device. A session borrows the
//! transport for its whole lifetime: it suspends the application's background
//! receiver on open, runs commands and bulk transfers through the protocol
//! engines, and restores the original line state when dropped, whether the
//! operations succeeded or not.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::operation::{OperationEnv, Phase};
use crate::protocol::recorder::ACK;
use crate::protocol::{
    FrameType, Port, ProtocolError, RecorderCommand, RecorderProtocol, TrafficProtocol,
    DEFAULT_BAUD_RATE,
};
use crate::recorder::database::IMAGE_SIZE;
use crate::recorder::{
    decode_directory, decode_flight, g_record, render_igc, Database, Declaration, DirectoryEntry,
    MemoryImage,
};

/// Upper bound on a raw flight or directory dump
const LOG_BUFFER_SIZE: usize = 81920;

/// First connect attempt; a powered recorder answers well within this
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
/// Retry deadline, generous enough for a recorder still busy writing flash
const CONNECT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);
const INFO_TIMEOUT: Duration = Duration::from_secs(10);
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(30);
const DATABASE_TIMEOUT: Duration = Duration::from_secs(60);
/// The recorder prepares a flight for transfer before sending the first byte
const FLIGHT_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(300);
/// Erasing the old database block before an upload takes a while
const ERASE_TIMEOUT: Duration = Duration::from_secs(60);

const TRAFFIC_ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-frame deadline during a traffic unit flight download
const TRAFFIC_DATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Line-speed configuration for a recorder session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Baud rate for the connect handshake and command exchange
    pub baud_rate: u32,
    /// Baud rate negotiated for bulk transfers
    pub bulk_baud_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            bulk_baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Identity block reported by the recorder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub session_id: u16,
    pub serial_number: u16,
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub firmware_build: u8,
}

impl DeviceInfo {
    /// Parse the 8-byte information block: big-endian session id and serial
    /// number, firmware version packed in nibbles, build number last
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 8 {
            return Err(ProtocolError::InvalidResponse);
        }
        Ok(Self {
            session_id: u16::from(data[0]) * 256 + u16::from(data[1]),
            serial_number: u16::from(data[2]) * 256 + u16::from(data[3]),
            firmware_major: data[4] >> 4,
            firmware_minor: data[4] & 0x0f,
            firmware_build: data[7],
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s/n {} firmware {}.{} build {}",
            self.serial_number, self.firmware_major, self.firmware_minor, self.firmware_build
        )
    }
}

/// Supported device families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// IGC flight recorder
    Recorder,
    /// Traffic awareness unit
    Traffic,
}

/// Operations every device family supports, for family-agnostic callers
pub trait DeviceSession {
    fn family(&self) -> DeviceFamily;

    /// Cheap liveness check
    fn ping(&mut self) -> bool;

    /// Return the device to its normal operating mode
    fn reset(&mut self) -> Result<(), ProtocolError>;

    /// One display line per stored flight, in download order
    fn flights(&mut self) -> Result<Vec<String>, ProtocolError>;

    /// Download the flight at `index` as an IGC document
    fn fetch_flight(&mut self, index: u8) -> Result<String, ProtocolError>;
}

/// Session against a flight recorder
///
/// Every public operation re-runs the connect handshake first; the recorder
/// falls back out of command mode between operations.
pub struct RecorderSession<'a> {
    port: &'a mut dyn Port,
    env: &'a dyn OperationEnv,
    config: SessionConfig,
    original_baud: u32,
}

impl<'a> RecorderSession<'a> {
    pub fn open(
        port: &'a mut dyn Port,
        env: &'a dyn OperationEnv,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        port.pause_receiver();
        let original_baud = port.baud_rate();
        if original_baud != config.baud_rate {
            port.set_baud_rate(config.baud_rate)?;
        }
        Ok(Self {
            port,
            env,
            config,
            original_baud,
        })
    }

    fn proto(&mut self) -> RecorderProtocol<'_> {
        RecorderProtocol::new(&mut *self.port, self.env)
    }

    /// Wake the recorder's command interpreter, retrying once with a longer
    /// deadline for a device still busy with its previous task
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        let first = self.proto().connect(CONNECT_TIMEOUT);
        match first {
            Err(ProtocolError::NoAnswer | ProtocolError::Timeout) => {
                debug!("first connect attempt failed, retrying");
                self.proto().connect(CONNECT_RETRY_TIMEOUT)
            }
            other => other,
        }
    }

    /// Put the command baud rate back after a bulk transfer, successful or not
    fn restore_command_baud(&mut self) {
        if self.port.baud_rate() != self.config.baud_rate {
            if let Err(e) = self.port.set_baud_rate(self.config.baud_rate) {
                warn!(error = %e, "could not restore command baud rate");
            }
        }
    }

    /// Read the device identity block
    pub fn read_info(&mut self) -> Result<DeviceInfo, ProtocolError> {
        self.connect()?;
        let mut proto = self.proto();
        proto.send_command(RecorderCommand::ReadInfo, 0, 0)?;
        let raw = proto.read_bulk(8, INFO_TIMEOUT)?;
        let device = DeviceInfo::parse(&raw)?;
        info!(%device, "recorder identified");
        Ok(device)
    }

    /// List the logged flights
    ///
    /// The listing is small and transfers at the command rate; only database
    /// and flight downloads negotiate the bulk rate. An empty answer from the
    /// device means there is nothing to download and is reported as
    /// [`ProtocolError::NoFlights`].
    pub fn read_directory(&mut self) -> Result<Vec<DirectoryEntry>, ProtocolError> {
        self.connect()?;
        let mut proto = self.proto();
        proto.send_command(RecorderCommand::ReadDirectory, 0, 0)?;
        let raw = proto.read_bulk(LOG_BUFFER_SIZE, DIRECTORY_TIMEOUT)?;
        if raw.is_empty() {
            return Err(ProtocolError::NoFlights);
        }
        decode_directory(&raw)
    }

    /// Download one flight and render it as an IGC document
    ///
    /// `index` is the flight's position in the directory listing. With
    /// `signed`, the recorder fills in the security record and the session
    /// fetches the signature block afterwards; the signature only transfers
    /// at the command baud rate.
    pub fn download_flight(&mut self, index: u8, signed: bool) -> Result<String, ProtocolError> {
        self.connect()?;
        let cmd = if signed {
            RecorderCommand::ReadFlightSigned
        } else {
            RecorderCommand::ReadFlight
        };
        let bulk = self.config.bulk_baud_rate;
        let mut proto = self.proto();
        let raw = proto
            .send_command_at_baud(cmd, index, bulk)
            .and_then(|_| proto.read_bulk(LOG_BUFFER_SIZE, FLIGHT_FIRST_BYTE_TIMEOUT));
        self.restore_command_baud();
        let mut raw = raw?;
        if raw.is_empty() {
            return Err(ProtocolError::NoData);
        }

        if signed {
            let mut proto = self.proto();
            proto.send_command(RecorderCommand::ReadSignature, 0, 0)?;
            let signature = proto.read_bulk(LOG_BUFFER_SIZE, INFO_TIMEOUT)?;
            raw.extend_from_slice(&signature);
        }

        let log = decode_flight(&raw)?;
        let mut igc = render_igc(&log, true);
        let signed_len = log.signed_length.min(raw.len());
        igc.push_str(&g_record(&raw[..signed_len]));
        debug!(index, bytes = raw.len(), "flight downloaded");
        Ok(igc)
    }

    /// Download one flight and write the IGC document to `path`
    pub fn download_flight_to(
        &mut self,
        index: u8,
        signed: bool,
        path: &Path,
    ) -> Result<(), ProtocolError> {
        let igc = self.download_flight(index, signed)?;
        fs::write(path, igc)?;
        info!(index, path = %path.display(), "flight saved");
        Ok(())
    }

    /// Download the raw database/declaration memory image
    pub fn read_database_image(&mut self) -> Result<MemoryImage, ProtocolError> {
        self.connect()?;
        let bulk = self.config.bulk_baud_rate;
        let mut proto = self.proto();
        let raw = proto
            .send_command_at_baud(RecorderCommand::ReadDatabase, 0, bulk)
            .and_then(|_| proto.read_bulk(IMAGE_SIZE, DATABASE_TIMEOUT));
        self.restore_command_baud();
        let raw = raw?;
        if raw.is_empty() {
            return Err(ProtocolError::NoData);
        }
        MemoryImage::from_bytes(&raw)
    }

    /// Download and decode the waypoint/pilot/route database together with
    /// the task declaration
    pub fn read_database(&mut self) -> Result<(Database, Declaration), ProtocolError> {
        let image = self.read_database_image()?;
        Ok((
            Database::from_image(&image)?,
            Declaration::from_image(&image)?,
        ))
    }

    /// Upload a database and task declaration
    ///
    /// The device erases its old block first and signals completion with a
    /// single ACK control byte before it will accept the new image.
    pub fn write_database(
        &mut self,
        database: &Database,
        declaration: &Declaration,
    ) -> Result<(), ProtocolError> {
        let mut image = MemoryImage::new();
        database.write_into(&mut image)?;
        declaration.write_into(&mut image)?;
        self.write_database_image(&image)
    }

    /// Upload a prebuilt memory image
    pub fn write_database_image(&mut self, image: &MemoryImage) -> Result<(), ProtocolError> {
        self.connect()?;
        self.env.set_phase(Phase::WritingDatabase);
        self.proto()
            .send_command(RecorderCommand::WriteDatabase, 0, 0)?;

        self.env.set_phase(Phase::AwaitingDevice);
        if !self.port.wait_for_byte(ACK, ERASE_TIMEOUT)? {
            return Err(ProtocolError::Timeout);
        }

        self.proto().write_bulk(&image.to_bytes())?;
        info!("database written");
        Ok(())
    }

    /// Erase all logged flights
    pub fn clear_flights(&mut self) -> Result<(), ProtocolError> {
        self.connect()?;
        self.proto().send_command(RecorderCommand::ClearFlights, 0, 0)
    }

    /// Raw dump of the whole log memory, for recovering a corrupt directory
    pub fn emergency_readout(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.connect()?;
        let bulk = self.config.bulk_baud_rate;
        let mut proto = self.proto();
        let raw = proto
            .send_command_at_baud(RecorderCommand::EmergencyReadout, 0, bulk)
            .and_then(|_| proto.read_bulk(LOG_BUFFER_SIZE, FLIGHT_FIRST_BYTE_TIMEOUT));
        self.restore_command_baud();
        let raw = raw?;
        if raw.is_empty() {
            return Err(ProtocolError::NoData);
        }
        Ok(raw)
    }
}

impl DeviceSession for RecorderSession<'_> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Recorder
    }

    fn ping(&mut self) -> bool {
        self.connect().is_ok()
    }

    /// Drop out of command mode; the recorder resumes logging and never
    /// acknowledges
    fn reset(&mut self) -> Result<(), ProtocolError> {
        self.proto()
            .send_command_no_wait(RecorderCommand::Reset, 0, 0)
    }

    fn flights(&mut self) -> Result<Vec<String>, ProtocolError> {
        let entries = self.read_directory()?;
        Ok(entries
            .iter()
            .map(|e| {
                format!(
                    "{} {} {}",
                    e.first_fix_time.format("%d.%m.%Y %H:%M"),
                    e.glider_id,
                    e.pilot_name
                )
                .trim_end()
                .to_string()
            })
            .collect())
    }

    fn fetch_flight(&mut self, index: u8) -> Result<String, ProtocolError> {
        self.download_flight(index, true)
    }
}

impl Drop for RecorderSession<'_> {
    fn drop(&mut self) {
        self.restore_original_baud();
        self.port.resume_receiver();
    }
}

impl RecorderSession<'_> {
    fn restore_original_baud(&mut self) {
        if self.port.baud_rate() != self.original_baud {
            if let Err(e) = self.port.set_baud_rate(self.original_baud) {
                warn!(error = %e, "could not restore original baud rate");
            }
        }
    }
}

/// Session against a traffic unit already switched into binary mode
pub struct TrafficSession<'a> {
    proto: TrafficProtocol<'a>,
    env: &'a dyn OperationEnv,
}

impl<'a> TrafficSession<'a> {
    pub fn open(port: &'a mut dyn Port, env: &'a dyn OperationEnv) -> Self {
        port.pause_receiver();
        Self {
            proto: TrafficProtocol::new(port, env),
            env,
        }
    }

    /// Liveness check; `false` when nothing answers in time
    pub fn ping(&mut self) -> Result<bool, ProtocolError> {
        match self.proto.transact(FrameType::Ping, &[], TRAFFIC_ACK_TIMEOUT) {
            Ok((FrameType::Ack, _)) => Ok(true),
            Ok(_) => Ok(false),
            Err(ProtocolError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Leave binary mode; the unit resumes its normal text output
    pub fn exit(&mut self) -> Result<(), ProtocolError> {
        match self.proto.transact(FrameType::Exit, &[], TRAFFIC_ACK_TIMEOUT)? {
            (FrameType::Ack, _) => Ok(()),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Select the stored flight at `index`; `false` when no such record exists
    pub fn select_record(&mut self, index: u8) -> Result<bool, ProtocolError> {
        let (kind, _) =
            self.proto
                .transact(FrameType::SelectRecord, &[index], TRAFFIC_ACK_TIMEOUT)?;
        Ok(kind == FrameType::Ack)
    }

    /// Human-readable summary line of the selected flight
    pub fn read_record_info(&mut self) -> Result<String, ProtocolError> {
        let (kind, payload) =
            self.proto
                .transact(FrameType::GetRecordInfo, &[], TRAFFIC_ACK_TIMEOUT)?;
        if kind != FrameType::Ack || payload.len() < 2 {
            return Err(ProtocolError::InvalidResponse);
        }
        let text = &payload[2..];
        let cut = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        Ok(String::from_utf8_lossy(&text[..cut]).to_string())
    }

    /// Download the selected flight's IGC document
    ///
    /// Each data frame answers with the echoed sequence number, a progress
    /// byte and a chunk of IGC text; an EOF byte inside a chunk terminates
    /// the transfer.
    pub fn download_flight(&mut self) -> Result<String, ProtocolError> {
        const EOF: u8 = 0x1A;

        self.env.set_phase(Phase::Transferring);
        let mut igc: Vec<u8> = Vec::new();
        loop {
            if self.env.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            let (kind, payload) =
                self.proto
                    .transact(FrameType::GetIgcData, &[], TRAFFIC_DATA_TIMEOUT)?;
            if kind != FrameType::Ack || payload.len() < 3 {
                return Err(ProtocolError::InvalidResponse);
            }
            self.env.set_progress(payload[2].min(100));

            let chunk = &payload[3..];
            match chunk.iter().position(|&b| b == EOF) {
                Some(end) => {
                    igc.extend_from_slice(&chunk[..end]);
                    break;
                }
                None => igc.extend_from_slice(chunk),
            }
        }
        debug!(bytes = igc.len(), "flight download complete");
        Ok(String::from_utf8_lossy(&igc).to_string())
    }
}

impl DeviceSession for TrafficSession<'_> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Traffic
    }

    fn ping(&mut self) -> bool {
        TrafficSession::ping(self).unwrap_or(false)
    }

    /// Fire the exit frame without waiting; the unit leaves binary mode
    /// whether or not the acknowledgement makes it back
    fn reset(&mut self) -> Result<(), ProtocolError> {
        self.proto.send_frame(FrameType::Exit, &[]).map(|_| ())
    }

    /// The unit numbers its records from zero; the first refused index ends
    /// the list
    fn flights(&mut self) -> Result<Vec<String>, ProtocolError> {
        let mut lines = Vec::new();
        for index in 0..=u8::MAX {
            if !self.select_record(index)? {
                break;
            }
            lines.push(self.read_record_info()?);
        }
        Ok(lines)
    }

    fn fetch_flight(&mut self, index: u8) -> Result<String, ProtocolError> {
        if !self.select_record(index)? {
            return Err(ProtocolError::NoData);
        }
        self.download_flight()
    }
}

impl Drop for TrafficSession<'_> {
    fn drop(&mut self) {
        self.proto.port_mut().resume_receiver();
    }
}
