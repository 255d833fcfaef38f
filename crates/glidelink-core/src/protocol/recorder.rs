//! Flight recorder command protocol
//!
//! Command/response protocol of the flight recorder: a probe handshake, 8-byte
//! command packets acknowledged with a single status byte, DLE-framed
//! CRC-checked bulk reads, and paced bulk writes. High-speed transfers
//! renegotiate the line to a bulk baud rate; the session layer restores the
//! original rate afterward.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::codec::Crc16;
use super::{crc16, Port, ProtocolError};
use crate::operation::{OperationEnv, Phase};

/// Start of text, opens a DLE-framed capture
pub const STX: u8 = 0x02;
/// End of text, closes a DLE-framed capture
pub const ETX: u8 = 0x03;
/// Enquiry, announces a command packet
pub const ENQ: u8 = 0x05;
/// Acknowledge, also used to request the next bulk byte
pub const ACK: u8 = 0x06;
/// Data link escape
pub const DLE: u8 = 0x10;
/// Negative acknowledge
pub const NAK: u8 = 0x15;
/// Cancel, resets the remote command interpreter
pub const CAN: u8 = 0x18;

/// Deadline for the single acknowledgement byte after a command packet
const ACK_TIMEOUT: Duration = Duration::from_secs(4);
/// Deadline between consecutive bytes of a bulk read
const INTER_BYTE_TIMEOUT: Duration = Duration::from_secs(4);
/// Deadline for the final acknowledgement after a bulk write; the device
/// verifies the whole block before answering
const WRITE_ACK_TIMEOUT: Duration = Duration::from_secs(180);
/// Bulk writes are paced in chunks so the receiver's buffer cannot overrun
const WRITE_CHUNK_SIZE: usize = 400;
const WRITE_CHUNK_PAUSE: Duration = Duration::from_millis(100);

/// Command opcodes understood by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderCommand {
    /// Device information block
    ReadInfo = 0x00,
    /// Flight directory dump
    ReadDirectory = 0x01,
    /// One flight, unsigned
    ReadFlight = 0x02,
    /// One flight with the security record filled in
    ReadFlightSigned = 0x03,
    /// Waypoint/route/pilot database and declaration block
    ReadDatabase = 0x04,
    /// Single parameter write
    WriteParameter = 0x05,
    /// Erase all logged flights
    ClearFlights = 0x06,
    /// Database and declaration upload
    WriteDatabase = 0x07,
    /// Cryptographic signature of the most recently read flight
    ReadSignature = 0x08,
    /// Emergency readout of the whole log memory
    EmergencyReadout = 0x09,
    /// Leave command mode and resume logging
    Reset = 0x0C,
}

/// Discrete bulk transfer rates the recorder can negotiate
///
/// The wire carries a one-byte index, not the rate itself; both sides switch
/// simultaneously after the command is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkBaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl BulkBaudRate {
    /// Map a requested rate to its wire index; `None` for rates the device
    /// cannot do
    pub fn from_rate(rate: u32) -> Option<Self> {
        match rate {
            9600 => Some(Self::B9600),
            19200 => Some(Self::B19200),
            38400 => Some(Self::B38400),
            57600 => Some(Self::B57600),
            115200 => Some(Self::B115200),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::B9600 => 1,
            Self::B19200 => 2,
            Self::B38400 => 3,
            Self::B57600 => 4,
            Self::B115200 => 5,
        }
    }

    pub fn rate(self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B19200 => 19200,
            Self::B38400 => 38400,
            Self::B57600 => 57600,
            Self::B115200 => 115200,
        }
    }
}

/// Recorder protocol engine, borrowing the session's transport and environment
pub struct RecorderProtocol<'a> {
    port: &'a mut dyn Port,
    env: &'a dyn OperationEnv,
}

impl<'a> RecorderProtocol<'a> {
    pub fn new(port: &'a mut dyn Port, env: &'a dyn OperationEnv) -> Self {
        Self { port, env }
    }

    /// Wake the recorder's command interpreter
    ///
    /// Resets the interpreter with a burst of cancel bytes, then probes with
    /// `R` until the recorder answers `L`. A live recorder confirms with four
    /// consecutive `L` bytes; anything else means some other device (or noise)
    /// is on the line.
    pub fn connect(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        self.env.set_phase(Phase::Connecting);
        self.port.flush()?;

        for _ in 0..10 {
            self.port.write_byte(CAN)?;
            self.env.sleep(Duration::from_millis(1));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.env.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            if Instant::now() >= deadline {
                debug!("connect probe expired without response");
                return Err(ProtocolError::NoAnswer);
            }
            self.port.write_byte(b'R')?;
            self.env.sleep(Duration::from_millis(30));
            match self.port.read_byte(Duration::ZERO)? {
                Some(b'L') => break,
                Some(other) => trace!(byte = other, "discarding probe noise"),
                None => {}
            }
        }

        // Three more confirmation bytes complete the handshake
        for _ in 0..3 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout);
            }
            match self.port.read_byte(remaining)? {
                Some(b'L') => {}
                Some(other) => {
                    warn!(byte = other, "unexpected byte during handshake");
                    return Err(ProtocolError::NoAnswer);
                }
                None => return Err(ProtocolError::Timeout),
            }
        }

        // Let the interpreter settle before the first command
        self.env.sleep(Duration::from_millis(300));
        self.port.flush()?;
        debug!("recorder handshake complete");
        Ok(())
    }

    /// Reset the interpreter and send one command packet
    fn write_command_packet(
        &mut self,
        cmd: RecorderCommand,
        param1: u8,
        param2: u8,
    ) -> Result<(), ProtocolError> {
        self.env.set_phase(Phase::SendingCommand);
        self.env.sleep(Duration::from_millis(100));
        self.port.flush()?;

        for _ in 0..6 {
            self.port.write_byte(CAN)?;
            self.env.sleep(Duration::from_millis(2));
        }
        self.port.write_byte(ENQ)?;

        let packet = [cmd as u8, param1, param2, 0, 0, 0, 0, 0];
        self.port.write_all(&packet)?;
        self.port.write_all(&crc16(&packet).to_be_bytes())?;
        trace!(cmd = ?cmd, param1, param2, "command packet sent");
        Ok(())
    }

    /// Send a command packet and wait for its acknowledgement byte
    pub fn send_command(
        &mut self,
        cmd: RecorderCommand,
        param1: u8,
        param2: u8,
    ) -> Result<(), ProtocolError> {
        self.write_command_packet(cmd, param1, param2)?;
        match self.port.read_byte(ACK_TIMEOUT)? {
            Some(0) => Ok(()),
            Some(code) => {
                warn!(cmd = ?cmd, code, "device rejected command");
                Err(ProtocolError::DeviceError(code))
            }
            None => Err(ProtocolError::Timeout),
        }
    }

    /// Send a command packet without waiting for an acknowledgement
    ///
    /// The reset command drops the device out of command mode; it never
    /// answers, so waiting would only burn the ack timeout.
    pub fn send_command_no_wait(
        &mut self,
        cmd: RecorderCommand,
        param1: u8,
        param2: u8,
    ) -> Result<(), ProtocolError> {
        self.write_command_packet(cmd, param1, param2)
    }

    /// Send a command with a negotiated bulk baud rate as its second
    /// parameter, then switch the local port to match
    ///
    /// Unsupported rates fail before anything is written, leaving the
    /// interpreter in a known state.
    pub fn send_command_at_baud(
        &mut self,
        cmd: RecorderCommand,
        param1: u8,
        bulk_baud: u32,
    ) -> Result<(), ProtocolError> {
        let rate = BulkBaudRate::from_rate(bulk_baud)
            .ok_or(ProtocolError::UnsupportedBaudRate(bulk_baud))?;

        self.send_command(cmd, param1, rate.index())?;
        self.port.set_baud_rate(rate.rate())?;
        debug!(baud = rate.rate(), "switched to bulk baud rate");
        Ok(())
    }

    /// Stream a DLE-framed block from the recorder
    ///
    /// Every byte is requested with an ACK. DLE+STX opens the capture and
    /// zeroes the CRC accumulator; DLE+ETX closes it; DLE+DLE yields a literal
    /// DLE byte. Captured bytes past `max_len` are still counted and folded
    /// into the CRC so an oversized block fails checksum validation instead of
    /// silently truncating. The trailing two bytes of the capture are the
    /// block's own CRC; folding them in must bring the accumulator back to
    /// zero.
    pub fn read_bulk(
        &mut self,
        max_len: usize,
        first_byte_timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.env.set_phase(Phase::Transferring);
        // Let the recorder finish preparing the transfer
        self.env.sleep(Duration::from_millis(300));

        let mut out: Vec<u8> = Vec::new();
        let mut count: usize = 0;
        let mut crc = Crc16::new();
        let mut capturing = false;
        let mut dle_seen = false;
        let mut timeout = first_byte_timeout;

        loop {
            if self.env.is_cancelled() {
                self.abort()?;
                return Err(ProtocolError::Cancelled);
            }

            self.port.write_byte(ACK)?;
            let byte = self
                .port
                .read_byte(timeout)?
                .ok_or(ProtocolError::Timeout)?;
            timeout = INTER_BYTE_TIMEOUT;

            if dle_seen {
                dle_seen = false;
                match byte {
                    STX => {
                        capturing = true;
                        out.clear();
                        count = 0;
                        crc = Crc16::new();
                    }
                    ETX => break,
                    DLE => {
                        if capturing {
                            if out.len() < max_len {
                                out.push(DLE);
                            }
                            count += 1;
                            crc.update_byte(DLE);
                        }
                    }
                    other => {
                        warn!(byte = other, "unknown DLE sequence in bulk stream");
                        return Err(ProtocolError::UnknownEscape(other));
                    }
                }
            } else if byte == DLE {
                dle_seen = true;
            } else if capturing {
                if out.len() < max_len {
                    out.push(byte);
                }
                count += 1;
                crc.update_byte(byte);

                if count % 1024 == 0 && max_len > 0 {
                    let pct = ((count * 100) / max_len).min(100) as u8;
                    self.env.set_progress(pct);
                }
            }
        }

        let residue = crc.finish();
        if residue != 0 {
            return Err(ProtocolError::CrcMismatch {
                expected: 0,
                actual: residue,
            });
        }
        if count < 2 {
            out.clear();
            return Ok(out);
        }

        // Strip the trailing CRC bytes from the payload
        out.truncate(count - 2);
        debug!(len = out.len(), "bulk read complete");
        Ok(out)
    }

    /// Upload a block, paced in chunks, with the CRC16 appended
    pub fn write_bulk(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.env.set_phase(Phase::Transferring);

        let mut crc = Crc16::new();
        let total = data.len().max(1);
        let mut sent = 0usize;

        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            if self.env.is_cancelled() {
                self.abort()?;
                return Err(ProtocolError::Cancelled);
            }

            self.port.write_all(chunk)?;
            crc.update(chunk);
            sent += chunk.len();
            self.env.set_progress(((sent * 100) / total).min(100) as u8);
            self.env.sleep(WRITE_CHUNK_PAUSE);
        }

        self.port.write_all(&crc.finish().to_be_bytes())?;

        // The device checks the whole block before answering, which can take
        // minutes for a full database
        self.env.set_phase(Phase::AwaitingDevice);
        match self.port.read_byte(WRITE_ACK_TIMEOUT)? {
            Some(0) => Ok(()),
            Some(code) => Err(ProtocolError::DeviceError(code)),
            None => Err(ProtocolError::Timeout),
        }
    }

    /// Signal the recorder to abandon the current transfer
    pub fn abort(&mut self) -> Result<(), ProtocolError> {
        self.port.write_all(&[CAN, CAN, CAN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::NullEnv;
    use crate::protocol::serial::fake::FakePort;
    use pretty_assertions::assert_eq;

    /// Frame a payload the way the recorder does: DLE-stuffed capture with the
    /// block CRC appended before the closing sequence
    fn frame_block(payload: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        body.extend_from_slice(&crc16(payload).to_be_bytes());

        let mut framed = vec![DLE, STX];
        for &b in &body {
            framed.push(b);
            if b == DLE {
                framed.push(DLE);
            }
        }
        framed.extend_from_slice(&[DLE, ETX]);
        framed
    }

    #[test]
    fn connect_accepts_four_confirmations() {
        let mut port = FakePort::with_rx(b"LLLL");
        let env = NullEnv;
        RecorderProtocol::new(&mut port, &env)
            .connect(Duration::from_secs(1))
            .unwrap();

        // Interpreter reset burst followed by at least one probe
        assert_eq!(&port.tx[..10], &[CAN; 10]);
        assert!(port.tx[10..].contains(&b'R'));
    }

    #[test]
    fn connect_rejects_wrong_confirmation() {
        let mut port = FakePort::with_rx(b"LLX");
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .connect(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoAnswer));
    }

    #[test]
    fn connect_reports_silence() {
        let mut port = FakePort::new();
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .connect(Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoAnswer));
    }

    #[test]
    fn send_command_packet_layout() {
        let mut port = FakePort::with_rx(&[0]);
        let env = NullEnv;
        RecorderProtocol::new(&mut port, &env)
            .send_command(RecorderCommand::ReadInfo, 0x12, 0x34)
            .unwrap();

        let expected_packet = [0x00, 0x12, 0x34, 0, 0, 0, 0, 0];
        let mut expected = vec![CAN; 6];
        expected.push(ENQ);
        expected.extend_from_slice(&expected_packet);
        expected.extend_from_slice(&crc16(&expected_packet).to_be_bytes());
        assert_eq!(port.tx, expected);
    }

    #[test]
    fn send_command_surfaces_device_error() {
        let mut port = FakePort::with_rx(&[2]);
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .send_command(RecorderCommand::ReadDirectory, 0, 0)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceError(2)));
    }

    #[test]
    fn unsupported_bulk_baud_fails_before_sending() {
        let mut port = FakePort::new();
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .send_command_at_baud(RecorderCommand::ReadDatabase, 0, 12345)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedBaudRate(12345)));
        assert!(port.tx.is_empty());
        assert!(port.baud_changes.is_empty());
    }

    #[test]
    fn bulk_baud_switches_port_after_ack() {
        let mut port = FakePort::with_rx(&[0]);
        let env = NullEnv;
        RecorderProtocol::new(&mut port, &env)
            .send_command_at_baud(RecorderCommand::ReadDatabase, 0, 57600)
            .unwrap();
        assert_eq!(port.baud_changes, vec![57600]);
        // Index 4 rides in the second parameter slot
        let packet_start = port.tx.len() - 10;
        assert_eq!(port.tx[packet_start + 2], 4);
    }

    #[test]
    fn read_bulk_recovers_payload_with_stuffed_dle() {
        let payload = [0x01, DLE, 0x02, DLE, DLE, 0x03, 0xff, 0x00];
        let mut port = FakePort::with_rx(&frame_block(&payload));
        let env = NullEnv;
        let got = RecorderProtocol::new(&mut port, &env)
            .read_bulk(1024, Duration::from_millis(50))
            .unwrap();
        assert_eq!(got, payload);
        // One ACK per received byte
        assert!(port.tx.iter().all(|&b| b == ACK));
    }

    #[test]
    fn read_bulk_rejects_corrupted_crc() {
        let mut framed = frame_block(b"flight data");
        let n = framed.len();
        framed[n - 3] ^= 0x40; // flip a bit in the trailing CRC
        let mut port = FakePort::with_rx(&framed);
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .read_bulk(1024, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CrcMismatch { .. }));
    }

    #[test]
    fn read_bulk_empty_capture_yields_nothing() {
        let mut port = FakePort::with_rx(&[DLE, STX, DLE, ETX]);
        let env = NullEnv;
        let got = RecorderProtocol::new(&mut port, &env)
            .read_bulk(1024, Duration::from_millis(50))
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn read_bulk_times_out_without_first_byte() {
        let mut port = FakePort::new();
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .read_bulk(1024, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }

    #[test]
    fn write_bulk_appends_crc_and_waits_for_ack() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let mut port = FakePort::with_rx(&[0]);
        let env = NullEnv;
        RecorderProtocol::new(&mut port, &env)
            .write_bulk(&data)
            .unwrap();

        let mut expected = data.clone();
        expected.extend_from_slice(&crc16(&data).to_be_bytes());
        assert_eq!(port.tx, expected);
    }

    #[test]
    fn write_bulk_surfaces_rejection() {
        let mut port = FakePort::with_rx(&[1]);
        let env = NullEnv;
        let err = RecorderProtocol::new(&mut port, &env)
            .write_bulk(b"abc")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceError(1)));
    }
}
