//! Serial port handling
//!
//! Provides the blocking transport contract the device protocols are written
//! against, plus a `serialport`-backed implementation and port discovery
//! helpers.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::fmt;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::Read;
use std::time::{Duration, Instant};

use super::ProtocolError;

/// Default command-exchange baud rate for the flight recorder
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Blocking serial transport used by the device protocols
///
/// All reads take an explicit timeout and report expiry by returning a zero
/// count (`read`) or `false` (`wait_for_byte`); hard transport failures are
/// errors. Sessions suspend the application's background telemetry reader
/// through `pause_receiver`/`resume_receiver` for their whole lifetime.
pub trait Port {
    /// Write the whole buffer
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Read up to `buf.len()` bytes, blocking until at least one byte arrives
    /// or the timeout expires. Returns the number of bytes read; 0 means the
    /// timeout passed without data.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError>;

    /// Discard pending input and output
    fn flush(&mut self) -> Result<(), ProtocolError>;

    /// Current baud rate
    fn baud_rate(&self) -> u32;

    /// Reconfigure the line speed
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ProtocolError>;

    /// Suspend the application's background receiver, if any
    fn pause_receiver(&mut self) {}

    /// Resume the application's background receiver
    fn resume_receiver(&mut self) {}

    /// Write a single byte
    fn write_byte(&mut self, byte: u8) -> Result<(), ProtocolError> {
        self.write_all(&[byte])
    }

    /// Read a single byte, `None` on timeout
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ProtocolError> {
        let mut buf = [0u8; 1];
        Ok(if self.read(&mut buf, timeout)? == 1 {
            Some(buf[0])
        } else {
            None
        })
    }

    /// Consume input until `value` is seen; `false` on timeout
    fn wait_for_byte(&mut self, value: u8, timeout: Duration) -> Result<bool, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if self.read_byte(remaining)? == Some(value) {
                return Ok(true);
            }
        }
    }

    /// Drain input until the line has been quiet for `quiet_period`, then
    /// discard buffers. Gives up after `timeout`.
    fn full_flush(&mut self, quiet_period: Duration, timeout: Duration) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut scratch = [0u8; 64];
        while Instant::now() < deadline {
            if self.read(&mut scratch, quiet_period)? == 0 {
                break;
            }
        }
        self.flush()
    }
}

/// A discovered serial port with whatever USB identity the OS reports
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    /// Device path ("/dev/ttyUSB0") or platform name ("COM3")
    pub name: String,
    /// USB vendor id, when the port is a USB adapter
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn named(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn from_system(info: SerialPortInfo) -> Self {
        let mut port = Self::named(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}

/// Ordering for discovered ports: USB-serial adapters first (ttyACM before
/// ttyUSB, numeric suffix order), everything else alphabetically after them
fn discovery_order(name: &str) -> (u8, usize, String) {
    let base = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyACM"), (1, "ttyUSB")] {
        if let Some(suffix) = base.strip_prefix(prefix) {
            let index = suffix.parse().unwrap_or(usize::MAX);
            return (rank, index, base.to_string());
        }
    }
    (2, 0, base.to_string())
}

/// Enumerate candidate device ports in a deterministic order
///
/// On Linux the /dev tree is scanned as well; USB serial nodes sometimes
/// exist there before the enumeration API reports them.
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from_system)
        .collect();

    #[cfg(target_os = "linux")]
    if let Ok(dir) = fs::read_dir("/dev") {
        for node in dir.flatten() {
            let file = node.file_name();
            let Some(file) = file.to_str() else { continue };
            if !(file.starts_with("ttyACM") || file.starts_with("ttyUSB")) {
                continue;
            }
            let path = format!("/dev/{file}");
            if !found.iter().any(|p| p.name == path) {
                found.push(PortInfo::named(path));
            }
        }
    }

    found.sort_by_key(|p| discovery_order(&p.name));
    found.dedup_by(|a, b| a.name == b.name);
    found
}

fn serial_err(e: impl fmt::Display) -> ProtocolError {
    ProtocolError::SerialError(e.to_string())
}

/// Open `name` at `baud_rate` (command-exchange default when `None`),
/// configured 8N1 without flow control and with empty buffers
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<SystemPort, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    // The inherent timeout stays short; Port::read layers real deadlines
    // over bytes_to_read() polling
    let port = serialport::new(name, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(serial_err)?;

    port.clear(serialport::ClearBuffer::All)
        .map_err(serial_err)?;
    Ok(SystemPort { inner: port, baud })
}

/// `Port` implementation over a system serial port
pub struct SystemPort {
    inner: Box<dyn SerialPort>,
    baud: u32,
}

impl Port for SystemPort {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        std::io::Write::write_all(&mut self.inner, data).map_err(serial_err)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let available = self.inner.bytes_to_read().map_err(serial_err)? as usize;
            if available > 0 {
                let want = available.min(buf.len());
                match self.inner.read(&mut buf[..want]) {
                    Ok(n) => return Ok(n),
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(serial_err(e)),
                }
            }

            if Instant::now() >= deadline {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn flush(&mut self) -> Result<(), ProtocolError> {
        self.inner
            .clear(serialport::ClearBuffer::All)
            .map_err(serial_err)
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ProtocolError> {
        self.inner.set_baud_rate(baud).map_err(serial_err)?;
        self.baud = baud;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory transport for protocol tests

    use super::*;
    use std::collections::VecDeque;

    /// Test double: canned device output in `rx`, captured writes in `tx`
    #[derive(Default)]
    pub(crate) struct FakePort {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub baud: u32,
        pub baud_changes: Vec<u32>,
        pub pauses: u32,
        pub resumes: u32,
        pub flushes: u32,
    }

    impl FakePort {
        pub fn new() -> Self {
            Self {
                baud: DEFAULT_BAUD_RATE,
                ..Self::default()
            }
        }

        pub fn with_rx(rx: &[u8]) -> Self {
            let mut port = Self::new();
            port.queue(rx);
            port
        }

        pub fn queue(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }
    }

    impl Port for FakePort {
        fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
            self.tx.extend_from_slice(data);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ProtocolError> {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn flush(&mut self) -> Result<(), ProtocolError> {
            self.flushes += 1;
            Ok(())
        }

        fn baud_rate(&self) -> u32 {
            self.baud
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<(), ProtocolError> {
            self.baud = baud;
            self.baud_changes.push(baud);
            Ok(())
        }

        fn pause_receiver(&mut self) {
            self.pauses += 1;
        }

        fn resume_receiver(&mut self) {
            self.resumes += 1;
        }
    }
}
