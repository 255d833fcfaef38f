//! Device communication protocols
//!
//! Two wire protocols live here. The flight recorder speaks a DLE-framed
//! command/response protocol with CRC16-protected bulk transfers
//! ([`recorder`]); the traffic unit speaks an escaped binary frame protocol
//! with sequence-numbered acknowledgements ([`traffic`]). Both run over the
//! blocking [`Port`] transport.

pub mod codec;
pub mod error;
pub mod recorder;
pub mod serial;
pub mod traffic;

pub use codec::{crc16, Crc16};
pub use error::ProtocolError;
pub use recorder::{BulkBaudRate, RecorderCommand, RecorderProtocol};
pub use serial::{list_ports, open_port, Port, PortInfo, SystemPort, DEFAULT_BAUD_RATE};
pub use traffic::{FrameType, TrafficFrame, TrafficProtocol};
