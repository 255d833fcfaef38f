//! Traffic unit binary protocol
//!
//! Escaped binary frames with a fixed little-endian header, CRC16 integrity
//! and per-frame sequence numbers. The unit acknowledges every request with an
//! ACK or NACK frame echoing the request's sequence number; stray frames
//! (periodic traffic broadcasts, answers to earlier requests) are skipped by
//! the ack-wait loop.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::codec::{escape_frame, unescape_byte, Crc16, FRAME_ESCAPE, FRAME_START};
use super::{Port, ProtocolError};
use crate::operation::OperationEnv;

/// Size of the frame header on the wire (before escaping)
pub const HEADER_SIZE: usize = 8;

/// Frame types of the binary protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Error,
    Ping,
    SetBaudRate,
    FlashUpload,
    Exit,
    SelectRecord,
    GetRecordInfo,
    GetIgcData,
    Ack,
    Nack,
    /// Anything this implementation does not know; carried so the ack-wait
    /// loop can skip it
    Unknown(u8),
}

impl FrameType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Error => 0x00,
            Self::Ping => 0x01,
            Self::SetBaudRate => 0x02,
            Self::FlashUpload => 0x10,
            Self::Exit => 0x12,
            Self::SelectRecord => 0x20,
            Self::GetRecordInfo => 0x21,
            Self::GetIgcData => 0x22,
            Self::Ack => 0xA0,
            Self::Nack => 0xB7,
            Self::Unknown(b) => b,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Error,
            0x01 => Self::Ping,
            0x02 => Self::SetBaudRate,
            0x10 => Self::FlashUpload,
            0x12 => Self::Exit,
            0x20 => Self::SelectRecord,
            0x21 => Self::GetRecordInfo,
            0x22 => Self::GetIgcData,
            0xA0 => Self::Ack,
            0xB7 => Self::Nack,
            other => Self::Unknown(other),
        }
    }
}

/// A received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficFrame {
    pub frame_type: FrameType,
    pub sequence: u16,
    pub version: u8,
    pub payload: Vec<u8>,
}

/// Traffic unit protocol engine
///
/// Owns the running sequence counter; one instance per session.
pub struct TrafficProtocol<'a> {
    port: &'a mut dyn Port,
    env: &'a dyn OperationEnv,
    sequence: u16,
}

impl<'a> TrafficProtocol<'a> {
    pub fn new(port: &'a mut dyn Port, env: &'a dyn OperationEnv) -> Self {
        Self {
            port,
            env,
            sequence: 0,
        }
    }

    /// Access the underlying transport
    pub fn port_mut(&mut self) -> &mut dyn Port {
        &mut *self.port
    }

    /// Build and send one frame; returns the sequence number it carried
    pub fn send_frame(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<u16, ProtocolError> {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut header[0..2], (HEADER_SIZE + payload.len()) as u16);
        header[2] = 0; // protocol version
        LittleEndian::write_u16(&mut header[3..5], sequence);
        header[5] = frame_type.to_byte();

        let mut crc = Crc16::new();
        crc.update(&header[0..6]);
        crc.update(payload);
        LittleEndian::write_u16(&mut header[6..8], crc.finish());

        let mut wire = Vec::with_capacity(1 + 2 * (HEADER_SIZE + payload.len()));
        wire.push(FRAME_START);
        escape_frame(&header, &mut wire);
        escape_frame(payload, &mut wire);
        self.port.write_all(&wire)?;
        trace!(?frame_type, sequence, len = payload.len(), "frame sent");
        Ok(sequence)
    }

    /// Read one unescaped in-frame byte, `None` on timeout
    ///
    /// A raw start marker inside a frame means the sender restarted; the
    /// caller resynchronizes by discarding the partial frame.
    fn read_unescaped(&mut self, deadline: Instant) -> Result<Option<u8>, ProtocolError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.port.read_byte(remaining)? {
            None => Ok(None),
            Some(FRAME_ESCAPE) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.port.read_byte(remaining)? {
                    None => Ok(None),
                    Some(substitute) => Ok(Some(unescape_byte(substitute)?)),
                }
            }
            Some(byte) => Ok(Some(byte)),
        }
    }

    /// Attempt to read one frame starting after a start marker; any malformed
    /// content yields an error so the outer loop can resynchronize
    fn read_frame_body(&mut self, deadline: Instant) -> Result<TrafficFrame, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        for slot in header.iter_mut() {
            *slot = self
                .read_unescaped(deadline)?
                .ok_or(ProtocolError::Timeout)?;
        }

        let length = LittleEndian::read_u16(&header[0..2]) as usize;
        if length < HEADER_SIZE {
            return Err(ProtocolError::InvalidResponse);
        }

        let mut payload = vec![0u8; length - HEADER_SIZE];
        for slot in payload.iter_mut() {
            *slot = self
                .read_unescaped(deadline)?
                .ok_or(ProtocolError::Timeout)?;
        }

        let mut crc = Crc16::new();
        crc.update(&header[0..6]);
        crc.update(&payload);
        let actual = crc.finish();
        let expected = LittleEndian::read_u16(&header[6..8]);
        if actual != expected {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        Ok(TrafficFrame {
            frame_type: FrameType::from_byte(header[5]),
            sequence: LittleEndian::read_u16(&header[3..5]),
            version: header[2],
            payload,
        })
    }

    /// Wait for the next intact frame, skipping corrupt ones, until `timeout`
    pub fn receive_frame(&mut self, timeout: Duration) -> Result<TrafficFrame, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.env.is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout);
            }
            if !self.port.wait_for_byte(FRAME_START, remaining)? {
                return Err(ProtocolError::Timeout);
            }
            match self.read_frame_body(deadline) {
                Ok(frame) => {
                    trace!(frame_type = ?frame.frame_type, sequence = frame.sequence,
                           len = frame.payload.len(), "frame received");
                    return Ok(frame);
                }
                Err(ProtocolError::Timeout) => return Err(ProtocolError::Timeout),
                Err(e) => {
                    // Corrupt frame; stay in the loop and resynchronize on the
                    // next start marker
                    debug!(error = %e, "discarding malformed frame");
                }
            }
        }
    }

    /// Wait for the ACK or NACK answering the request with sequence number
    /// `sequence`
    ///
    /// Frames of other types, short payloads, and acknowledgements for other
    /// sequence numbers are ignored.
    pub fn wait_for_ack(
        &mut self,
        sequence: u16,
        timeout: Duration,
    ) -> Result<(FrameType, Vec<u8>), ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout);
            }
            let frame = self.receive_frame(remaining)?;

            if !matches!(frame.frame_type, FrameType::Ack | FrameType::Nack) {
                continue;
            }
            if frame.payload.len() < 2 {
                continue;
            }
            if LittleEndian::read_u16(&frame.payload[0..2]) != sequence {
                trace!(
                    got = LittleEndian::read_u16(&frame.payload[0..2]),
                    want = sequence,
                    "acknowledgement for another request, skipping"
                );
                continue;
            }
            return Ok((frame.frame_type, frame.payload));
        }
    }

    /// Send a frame and wait for its acknowledgement in one step
    pub fn transact(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(FrameType, Vec<u8>), ProtocolError> {
        let sequence = self.send_frame(frame_type, payload)?;
        self.wait_for_ack(sequence, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::NullEnv;
    use crate::protocol::serial::fake::FakePort;
    use pretty_assertions::assert_eq;

    /// Encode a frame the way the device would send it
    fn device_frame(frame_type: FrameType, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut header[0..2], (HEADER_SIZE + payload.len()) as u16);
        header[2] = 0;
        LittleEndian::write_u16(&mut header[3..5], sequence);
        header[5] = frame_type.to_byte();
        let mut crc = Crc16::new();
        crc.update(&header[0..6]);
        crc.update(payload);
        LittleEndian::write_u16(&mut header[6..8], crc.finish());

        let mut wire = vec![FRAME_START];
        escape_frame(&header, &mut wire);
        escape_frame(payload, &mut wire);
        wire
    }

    fn ack_payload(sequence: u16) -> Vec<u8> {
        let mut p = vec![0u8; 2];
        LittleEndian::write_u16(&mut p, sequence);
        p
    }

    #[test]
    fn sent_frames_parse_back() {
        // Payload chosen to force escaping of both reserved bytes
        let payload = [0x11, FRAME_START, FRAME_ESCAPE, 0x22];
        let mut sender = FakePort::new();
        let env = NullEnv;
        let seq = TrafficProtocol::new(&mut sender, &env)
            .send_frame(FrameType::SelectRecord, &payload)
            .unwrap();
        assert_eq!(seq, 0);

        // Only the leading start marker may be a raw 0x73
        assert_eq!(sender.tx[0], FRAME_START);
        assert!(!sender.tx[1..].contains(&FRAME_START));

        let mut receiver = FakePort::with_rx(&sender.tx);
        let frame = TrafficProtocol::new(&mut receiver, &env)
            .receive_frame(Duration::from_millis(50))
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::SelectRecord);
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn sequence_numbers_increment() {
        let mut port = FakePort::new();
        let env = NullEnv;
        let mut proto = TrafficProtocol::new(&mut port, &env);
        assert_eq!(proto.send_frame(FrameType::Ping, &[]).unwrap(), 0);
        assert_eq!(proto.send_frame(FrameType::Ping, &[]).unwrap(), 1);
        assert_eq!(proto.send_frame(FrameType::Exit, &[]).unwrap(), 2);
    }

    #[test]
    fn corrupt_frame_is_skipped_then_good_one_accepted() {
        let mut bad = device_frame(FrameType::Ack, 7, &ack_payload(7));
        let n = bad.len();
        bad[n - 1] ^= 0xff; // corrupt the payload, CRC no longer matches
        let good = device_frame(FrameType::Ack, 7, &ack_payload(7));

        let mut port = FakePort::new();
        port.queue(&bad);
        port.queue(&good);
        let env = NullEnv;
        let frame = TrafficProtocol::new(&mut port, &env)
            .receive_frame(Duration::from_millis(100))
            .unwrap();
        assert_eq!(frame.sequence, 7);
    }

    #[test]
    fn ack_for_other_sequence_is_ignored() {
        let mut port = FakePort::new();
        port.queue(&device_frame(FrameType::Ack, 100, &ack_payload(4)));
        port.queue(&device_frame(FrameType::Ack, 101, &ack_payload(5)));
        let env = NullEnv;
        let (kind, payload) = TrafficProtocol::new(&mut port, &env)
            .wait_for_ack(5, Duration::from_millis(100))
            .unwrap();
        assert_eq!(kind, FrameType::Ack);
        assert_eq!(LittleEndian::read_u16(&payload[0..2]), 5);
    }

    #[test]
    fn short_ack_payload_is_ignored() {
        let mut port = FakePort::new();
        port.queue(&device_frame(FrameType::Ack, 100, &[5]));
        let env = NullEnv;
        let err = TrafficProtocol::new(&mut port, &env)
            .wait_for_ack(5, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }

    #[test]
    fn nack_is_reported_with_its_payload() {
        let mut port = FakePort::new();
        port.queue(&device_frame(FrameType::Nack, 100, &ack_payload(9)));
        let env = NullEnv;
        let (kind, _) = TrafficProtocol::new(&mut port, &env)
            .wait_for_ack(9, Duration::from_millis(50))
            .unwrap();
        assert_eq!(kind, FrameType::Nack);
    }

    #[test]
    fn receive_times_out_on_silence() {
        let mut port = FakePort::new();
        let env = NullEnv;
        let err = TrafficProtocol::new(&mut port, &env)
            .receive_frame(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }
}
