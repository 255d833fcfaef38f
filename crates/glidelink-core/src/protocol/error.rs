//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a device
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Device did not answer the connect probe")]
    NoAnswer,

    #[error("Not connected to device")]
    NotConnected,

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Unknown escape sequence: {0:#04x}")]
    UnknownEscape(u8),

    #[error("Device rejected command with code {0}")]
    DeviceError(u8),

    #[error("Device holds no flights")]
    NoFlights,

    #[error("Transfer yielded no data")]
    NoData,

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Record stream truncated or corrupt")]
    TruncatedRecord,

    #[error("Unsupported binary format version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported bulk baud rate {0}")]
    UnsupportedBaudRate(u32),

    #[error("Invalid response from device")]
    InvalidResponse,

    #[error("Database memory block is full")]
    DatabaseFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
