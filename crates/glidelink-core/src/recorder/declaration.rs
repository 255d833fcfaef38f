//! Packed database records and the task declaration
//!
//! Fixed-layout binary structures stored in the database image: waypoints
//! (13 bytes), pilots (16), routes (144), and the declaration's tagged fields.
//! Coordinates are packed as thousandths of minutes with sign bits folded into
//! the type byte and the high coordinate byte.

use tracing::debug;

use super::database::{table, MemoryImage};
use super::directory::field_string;
use super::records::field;
use crate::protocol::ProtocolError;

pub const WAYPOINT_LEN: usize = 13;
pub const DECL_WAYPOINT_LEN: usize = 16;
pub const PILOT_LEN: usize = 16;
pub const ROUTE_NAME_LEN: usize = 14;
pub const ROUTE_WAYPOINTS: usize = 10;
pub const ROUTE_LEN: usize = ROUTE_NAME_LEN + ROUTE_WAYPOINTS * WAYPOINT_LEN;

/// Upper-case and space-pad a name into a fixed-width slot
fn copy_padded(dst: &mut [u8], name: &str) {
    dst.fill(b' ');
    for (slot, byte) in dst.iter_mut().zip(name.to_ascii_uppercase().bytes()) {
        *slot = byte;
    }
}

fn fixed_name(bytes: &[u8]) -> String {
    let cut = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..cut])
        .to_ascii_uppercase()
        .trim_end()
        .to_string()
}

/// Database waypoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waypoint {
    /// At most six characters; stored upper-cased and space-padded
    pub name: String,
    pub kind: u8,
    /// Degrees, positive north
    pub lat: f64,
    /// Degrees, positive east
    pub lon: f64,
}

impl Waypoint {
    pub fn decode(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < WAYPOINT_LEN {
            return Err(ProtocolError::TruncatedRecord);
        }
        let mut lat = f64::from(
            (u32::from(p[7] & 0x7f) << 16) | (u32::from(p[8]) << 8) | u32::from(p[9]),
        ) / 60000.0;
        if p[7] & 0x80 != 0 {
            lat = -lat;
        }
        let mut lon =
            f64::from((u32::from(p[10]) << 16) | (u32::from(p[11]) << 8) | u32::from(p[12]))
                / 60000.0;
        if p[6] & 0x80 != 0 {
            lon = -lon;
        }
        Ok(Self {
            name: fixed_name(&p[0..6]),
            kind: p[6] & 0x7f,
            lat,
            lon,
        })
    }

    pub fn encode(&self, p: &mut [u8]) {
        debug_assert!(p.len() >= WAYPOINT_LEN);
        copy_padded(&mut p[0..6], &self.name);
        let llat = (self.lat * 60000.0).round().abs() as u32;
        let llon = (self.lon * 60000.0).round().abs() as u32;
        p[6] = (self.kind & 0x7f) | if self.lon < 0.0 { 0x80 } else { 0 };
        p[7] = ((llat >> 16) as u8 & 0x7f) | if self.lat < 0.0 { 0x80 } else { 0 };
        p[8] = (llat >> 8) as u8;
        p[9] = llat as u8;
        p[10] = (llon >> 16) as u8;
        p[11] = (llon >> 8) as u8;
        p[12] = llon as u8;
    }

    pub fn to_packed(&self) -> [u8; WAYPOINT_LEN] {
        let mut p = [0u8; WAYPOINT_LEN];
        self.encode(&mut p);
        p
    }
}

/// Observation zone shape of a declared turnpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OzShape {
    #[default]
    CylinderSector,
    Cylinder,
    Sector,
    Line,
}

impl OzShape {
    fn to_byte(self) -> u8 {
        match self {
            Self::CylinderSector => 0,
            Self::Cylinder => 1,
            Self::Sector => 2,
            Self::Line => 3,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Cylinder,
            2 => Self::Sector,
            3 => Self::Line,
            _ => Self::CylinderSector,
        }
    }
}

/// Declared task point: a waypoint plus its observation zone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclarationWaypoint {
    pub waypoint: Waypoint,
    pub shape: OzShape,
    /// Zone orientation in degrees
    pub direction: u16,
    /// Cylinder radius in meters, 100 m steps
    pub cylinder_radius: u32,
    /// Sector radius in meters, 1000 m steps
    pub sector_radius: u32,
    /// Line width in meters, for line-shaped zones
    pub line_width: u32,
}

impl DeclarationWaypoint {
    pub fn decode(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < DECL_WAYPOINT_LEN {
            return Err(ProtocolError::TruncatedRecord);
        }
        let shape = OzShape::from_byte(p[15]);
        let mut decoded = Self {
            waypoint: Waypoint::decode(p)?,
            shape,
            direction: u16::from(p[13]) * 2,
            ..Self::default()
        };
        if shape == OzShape::Line {
            decoded.line_width = u32::from(p[14] & 0x0f) * u32::from(p[14] >> 4);
        } else {
            decoded.cylinder_radius = u32::from(p[14] & 0x0f) * 100;
            decoded.sector_radius = u32::from(p[14] >> 4) * 1000;
        }
        Ok(decoded)
    }

    pub fn to_packed(&self) -> [u8; DECL_WAYPOINT_LEN] {
        let mut p = [0u8; DECL_WAYPOINT_LEN];
        self.waypoint.encode(&mut p);
        p[13] = (self.direction / 2) as u8;
        p[15] = self.shape.to_byte();
        if self.shape == OzShape::Line {
            // Two nibble factors whose product approximates the line width
            let lw = self.line_width;
            let mut packed = 0u8;
            for i in 1..=15 {
                if lw % i == 0 && lw / i <= 15 {
                    packed = ((i as u8) << 4) + (lw / i) as u8;
                    break;
                }
            }
            p[14] = packed;
        } else {
            p[14] = ((self.cylinder_radius / 100) as u8 & 0x0f)
                | (((self.sector_radius / 1000) as u8) << 4);
        }
        p
    }
}

/// Pilot list entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pilot {
    pub name: String,
}

impl Pilot {
    pub fn decode(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < PILOT_LEN {
            return Err(ProtocolError::TruncatedRecord);
        }
        Ok(Self {
            name: fixed_name(&p[0..PILOT_LEN]),
        })
    }

    pub fn to_packed(&self) -> [u8; PILOT_LEN] {
        let mut p = [0u8; PILOT_LEN];
        copy_padded(&mut p[0..PILOT_LEN - 1], &self.name);
        p
    }
}

/// Stored route: a name and ten waypoint slots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    pub name: String,
    pub waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn decode(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < ROUTE_LEN {
            return Err(ProtocolError::TruncatedRecord);
        }
        let mut waypoints = Vec::with_capacity(ROUTE_WAYPOINTS);
        for i in 0..ROUTE_WAYPOINTS {
            let at = ROUTE_NAME_LEN + i * WAYPOINT_LEN;
            waypoints.push(Waypoint::decode(&p[at..at + WAYPOINT_LEN])?);
        }
        Ok(Self {
            name: fixed_name(&p[0..ROUTE_NAME_LEN]),
            waypoints,
        })
    }

    pub fn to_packed(&self) -> [u8; ROUTE_LEN] {
        let mut p = [0u8; ROUTE_LEN];
        copy_padded(&mut p[0..ROUTE_NAME_LEN], &self.name);
        for i in 0..ROUTE_WAYPOINTS {
            let wpt = self.waypoints.get(i).cloned().unwrap_or_default();
            wpt.encode(&mut p[ROUTE_NAME_LEN + i * WAYPOINT_LEN..]);
        }
        p
    }
}

/// The waypoint/pilot/route database
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    pub waypoints: Vec<Waypoint>,
    pub pilots: Vec<Pilot>,
    pub routes: Vec<Route>,
}

impl Database {
    /// Decode the record tables of a memory image
    pub fn from_image(image: &MemoryImage) -> Result<Self, ProtocolError> {
        let mut db = Self::default();
        for record in image.records(table::WAYPOINTS) {
            db.waypoints.push(Waypoint::decode(record)?);
        }
        for record in image.records(table::PILOTS) {
            db.pilots.push(Pilot::decode(record)?);
        }
        for record in image.records(table::ROUTES) {
            db.routes.push(Route::decode(record)?);
        }
        debug!(
            waypoints = db.waypoints.len(),
            pilots = db.pilots.len(),
            routes = db.routes.len(),
            "database decoded"
        );
        Ok(db)
    }

    /// Write all tables into a memory image
    pub fn write_into(&self, image: &mut MemoryImage) -> Result<(), ProtocolError> {
        for wpt in &self.waypoints {
            image.add_record(table::WAYPOINTS, &wpt.to_packed())?;
        }
        for pilot in &self.pilots {
            image.add_record(table::PILOTS, &pilot.to_packed())?;
        }
        for route in &self.routes {
            image.add_record(table::ROUTES, &route.to_packed())?;
        }
        Ok(())
    }
}

/// Number of fixed-width slots the pilot name is split into
const PILOT_SLOTS: usize = 4;
/// Characters per pilot-name slot
const PILOT_SLOT_LEN: usize = 16;

/// Task declaration exchanged with the recorder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declaration {
    pub pilot: String,
    pub glider_type: String,
    pub glider_id: String,
    pub competition_class: String,
    pub competition_id: String,
    /// Home / takeoff point
    pub home: DeclarationWaypoint,
    pub start: DeclarationWaypoint,
    pub finish: DeclarationWaypoint,
    pub turnpoints: Vec<DeclarationWaypoint>,
}

impl Declaration {
    /// Read the declaration fields out of a memory image
    pub fn from_image(image: &MemoryImage) -> Result<Self, ProtocolError> {
        let mut decl = Self::default();

        for slot in 0..PILOT_SLOTS {
            if let Some(value) = image.find_field(field::PILOT1 + slot as u8) {
                decl.pilot.push_str(&field_string(value));
            }
        }
        if let Some(value) = image.find_field(field::GLIDER_TYPE) {
            decl.glider_type = field_string(value);
        }
        if let Some(value) = image.find_field(field::GLIDER_ID) {
            decl.glider_id = field_string(value);
        }
        if let Some(value) = image.find_field(field::COMPETITION_CLASS) {
            decl.competition_class = field_string(value);
        }
        if let Some(value) = image.find_field(field::COMPETITION_ID) {
            decl.competition_id = field_string(value);
        }
        if let Some(value) = image.find_field(field::TAKEOFF) {
            decl.home = DeclarationWaypoint::decode(value)?;
        }
        if let Some(value) = image.find_field(field::START) {
            decl.start = DeclarationWaypoint::decode(value)?;
        }
        if let Some(value) = image.find_field(field::FINISH) {
            decl.finish = DeclarationWaypoint::decode(value)?;
        }
        let count = image
            .find_field(field::TURNPOINT_COUNT)
            .and_then(|v| v.first().copied())
            .unwrap_or(0) as usize;
        for i in 0..count.min(field::TURNPOINT_SLOTS) {
            if let Some(value) = image.find_field(field::TURNPOINT1 + i as u8) {
                decl.turnpoints.push(DeclarationWaypoint::decode(value)?);
            }
        }
        Ok(decl)
    }

    /// Append the declaration fields to a memory image, pilot name split
    /// across four fixed-width slots
    pub fn write_into(&self, image: &mut MemoryImage) -> Result<(), ProtocolError> {
        let pilot = self.pilot.to_ascii_uppercase();
        let bytes = pilot.as_bytes();
        for slot in 0..PILOT_SLOTS {
            let start = (slot * PILOT_SLOT_LEN).min(bytes.len());
            let end = ((slot + 1) * PILOT_SLOT_LEN).min(bytes.len());
            let mut value = vec![0u8; PILOT_SLOT_LEN + 1];
            value[..end - start].copy_from_slice(&bytes[start..end]);
            image.add_field(field::PILOT1 + slot as u8, &value)?;
        }

        for (id, text) in [
            (field::GLIDER_TYPE, &self.glider_type),
            (field::GLIDER_ID, &self.glider_id),
            (field::COMPETITION_CLASS, &self.competition_class),
            (field::COMPETITION_ID, &self.competition_id),
        ] {
            let mut value = text.to_ascii_uppercase().into_bytes();
            value.push(0);
            image.add_field(id, &value)?;
        }

        image.add_field(field::TAKEOFF, &self.home.to_packed())?;
        let count = self.turnpoints.len().min(field::TURNPOINT_SLOTS) as u8;
        image.add_field(field::TURNPOINT_COUNT, &[count])?;
        image.add_field(field::START, &self.start.to_packed())?;
        image.add_field(field::FINISH, &self.finish.to_packed())?;
        for (i, tp) in self
            .turnpoints
            .iter()
            .take(field::TURNPOINT_SLOTS)
            .enumerate()
        {
            image.add_field(field::TURNPOINT1 + i as u8, &tp.to_packed())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn waypoint_round_trip_over_grid() {
        // Sweep both hemispheres at the packed format's own resolution
        for lat_step in -3..=3 {
            for lon_step in -3..=3 {
                let wpt = Waypoint {
                    name: "ALPHA".into(),
                    kind: 0x12,
                    lat: f64::from(lat_step) * 29.999_983, // odd thousandth-minute values
                    lon: f64::from(lon_step) * 59.999_983,
                };
                let decoded = Waypoint::decode(&wpt.to_packed()).unwrap();
                assert!(
                    (decoded.lat - wpt.lat).abs() < 1.0 / 60000.0,
                    "lat {} vs {}",
                    decoded.lat,
                    wpt.lat
                );
                assert!((decoded.lon - wpt.lon).abs() < 1.0 / 60000.0);
                assert_eq!(decoded.name, "ALPHA");
                assert_eq!(decoded.kind, 0x12);
            }
        }
    }

    #[test]
    fn waypoint_name_upper_cased_and_padded() {
        let wpt = Waypoint {
            name: "abc".into(),
            ..Waypoint::default()
        };
        let packed = wpt.to_packed();
        assert_eq!(&packed[0..6], b"ABC   ");
        assert_eq!(Waypoint::decode(&packed).unwrap().name, "ABC");
    }

    #[test]
    fn cylinder_zone_nibbles() {
        let tp = DeclarationWaypoint {
            shape: OzShape::Cylinder,
            direction: 180,
            cylinder_radius: 500,
            sector_radius: 10000,
            ..DeclarationWaypoint::default()
        };
        let packed = tp.to_packed();
        assert_eq!(packed[13], 90);
        assert_eq!(packed[14], 0xA5);
        assert_eq!(packed[15], 1);
        let decoded = DeclarationWaypoint::decode(&packed).unwrap();
        assert_eq!(decoded.cylinder_radius, 500);
        assert_eq!(decoded.sector_radius, 10000);
        assert_eq!(decoded.direction, 180);
    }

    #[test]
    fn line_zone_factors() {
        let tp = DeclarationWaypoint {
            shape: OzShape::Line,
            line_width: 45,
            ..DeclarationWaypoint::default()
        };
        let packed = tp.to_packed();
        // 45 = 3 * 15, the first factor pair with both nibbles in range
        assert_eq!(packed[14], 0x3F);
        assert_eq!(DeclarationWaypoint::decode(&packed).unwrap().line_width, 45);
    }

    #[test]
    fn database_round_trip() {
        let db = Database {
            waypoints: vec![
                Waypoint {
                    name: "FIRST".into(),
                    kind: 1,
                    lat: 47.5,
                    lon: 11.25,
                },
                Waypoint {
                    name: "SECOND".into(),
                    kind: 2,
                    lat: -33.85,
                    lon: 151.2,
                },
            ],
            pilots: vec![Pilot {
                name: "HARRY HAWK".into(),
            }],
            routes: vec![Route {
                name: "EVENING".into(),
                waypoints: vec![Waypoint {
                    name: "ONLY".into(),
                    kind: 0,
                    lat: 47.0,
                    lon: 11.0,
                }],
            }],
        };

        let mut image = MemoryImage::new();
        db.write_into(&mut image).unwrap();
        let reread = Database::from_image(&MemoryImage::from_bytes(&image.to_bytes()).unwrap())
            .unwrap();

        assert_eq!(reread.waypoints.len(), 2);
        assert_eq!(reread.waypoints[0].name, "FIRST");
        assert!((reread.waypoints[1].lat + 33.85).abs() < 1.0 / 60000.0);
        assert_eq!(reread.pilots[0].name, "HARRY HAWK");
        assert_eq!(reread.routes[0].name, "EVENING");
        // Unused route slots come back as empty waypoints
        assert_eq!(reread.routes[0].waypoints.len(), ROUTE_WAYPOINTS);
        assert_eq!(reread.routes[0].waypoints[0].name, "ONLY");
        assert_eq!(reread.routes[0].waypoints[9].name, "");
    }

    #[test]
    fn declaration_round_trip_with_long_pilot_name() {
        let decl = Declaration {
            pilot: "Maximiliane Habichtswald-Lindenberger".into(),
            glider_type: "ask-21".into(),
            glider_id: "D-1234".into(),
            competition_class: "club".into(),
            competition_id: "XY".into(),
            home: DeclarationWaypoint {
                waypoint: Waypoint {
                    name: "HOME".into(),
                    kind: 0,
                    lat: 47.5,
                    lon: 11.25,
                },
                ..DeclarationWaypoint::default()
            },
            start: DeclarationWaypoint::default(),
            finish: DeclarationWaypoint::default(),
            turnpoints: vec![
                DeclarationWaypoint {
                    shape: OzShape::Cylinder,
                    cylinder_radius: 300,
                    ..DeclarationWaypoint::default()
                },
                DeclarationWaypoint::default(),
            ],
        };

        let mut image = MemoryImage::new();
        decl.write_into(&mut image).unwrap();
        let reread = Declaration::from_image(&image).unwrap();

        // The name crosses slot boundaries and comes back upper-cased
        assert_eq!(reread.pilot, decl.pilot.to_ascii_uppercase());
        assert_eq!(reread.glider_type, "ASK-21");
        assert_eq!(reread.competition_class, "CLUB");
        assert_eq!(reread.turnpoints.len(), 2);
        assert_eq!(reread.turnpoints[0].cylinder_radius, 300);
        assert!((reread.home.waypoint.lat - 47.5).abs() < 1.0 / 60000.0);
    }
}
