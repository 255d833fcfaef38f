//! Flight recorder data formats
//!
//! Everything the recorder stores or exchanges as raw memory dumps: the tagged
//! record grammar ([`records`]), the flight directory ([`directory`]), full
//! flight logs ([`flight`]) and their IGC rendering ([`igc`]), plus the
//! database image with its packed records and the task declaration
//! ([`database`], [`declaration`]).

pub mod database;
pub mod declaration;
pub mod directory;
pub mod flight;
pub mod igc;
pub mod records;

pub use database::MemoryImage;
pub use declaration::{Database, Declaration, DeclarationWaypoint, OzShape, Pilot, Route, Waypoint};
pub use directory::{decode_directory, DirectoryEntry};
pub use flight::{decode_flight, Fix, FlightLog, LogEvent, LogHeader, LogItem, TaskDeclaration};
pub use igc::{g_record, render_igc};
