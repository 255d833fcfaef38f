//! # GlideLink Core Library
//!
//! Device communication core for glide-flight computers.
//!
//! This library provides:
//! - Serial transport and port discovery
//! - The flight recorder command protocol (DLE-framed, CRC16-protected)
//! - The traffic unit binary frame protocol
//! - Flight directory, flight log and database decoding
//! - IGC document rendering with integrity records
//! - Task declaration upload
//!
//! ## Supported devices
//!
//! - Volkslogger-compatible IGC flight recorders
//! - FLARM-compatible traffic units in binary data mode
//!
//! ## Example
//!
//! ```rust,ignore
//! use glidelink_core::protocol::open_port;
//! use glidelink_core::session::{RecorderSession, SessionConfig};
//! use glidelink_core::NullEnv;
//!
//! let mut port = open_port("/dev/ttyUSB0", None)?;
//! let env = NullEnv;
//! let mut session = RecorderSession::open(&mut port, &env, SessionConfig::default())?;
//!
//! for (i, flight) in session.read_directory()?.iter().enumerate() {
//!     println!("{i}: {} {}", flight.first_fix_time, flight.pilot_name);
//! }
//! let igc = session.download_flight(0, true)?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod operation;
pub mod protocol;
pub mod recorder;
pub mod session;

pub use operation::{CancelFlagEnv, NullEnv, OperationEnv, Phase};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::operation::{CancelFlagEnv, NullEnv, OperationEnv, Phase};
    pub use crate::protocol::{
        list_ports, open_port, Port, PortInfo, ProtocolError, SystemPort, DEFAULT_BAUD_RATE,
    };
    pub use crate::recorder::{
        decode_directory, decode_flight, render_igc, Database, Declaration, DirectoryEntry,
        FlightLog, MemoryImage, Waypoint,
    };
    pub use crate::session::{
        DeviceFamily, DeviceInfo, DeviceSession, RecorderSession, SessionConfig, TrafficSession,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
