//! Database memory image
//!
//! The recorder's waypoint/pilot/route database and the declaration metadata
//! share one fixed-size memory block. The first part holds up to eight
//! fixed-layout record tables behind a 48-byte header; the trailing part is a
//! sequential tagged-field area for the declaration. This type builds and
//! parses that image; the packed record layouts themselves live in
//! [`super::declaration`].

use tracing::warn;

use crate::protocol::ProtocolError;

/// Size of the record-table part of the image
pub const BLOCK_SIZE: usize = 0x3000;
/// Size of the tagged-field (declaration) part
pub const FDF_SIZE: usize = 0x1000;
/// Total image size transferred to and from the device
pub const IMAGE_SIZE: usize = BLOCK_SIZE + FDF_SIZE;

const HEADER_ENTRIES: usize = 8;
const HEADER_SIZE: usize = HEADER_ENTRIES * 6;
/// Marker for an unused table slot
const EMPTY: u16 = 0xffff;

/// Record and key lengths of the tables the device knows
pub mod table {
    pub const WAYPOINTS: usize = 0;
    pub const PILOTS: usize = 1;
    pub const ROUTES: usize = 3;
}

/// (record length, key length) per table slot; unused slots stay empty
const TABLE_LAYOUT: [(u8, u8); HEADER_ENTRIES] = [
    (13, 6),
    (16, 16),
    (7, 7),
    (144, 14),
    (0, 0),
    (0, 0),
    (0, 0),
    (0, 0),
];

#[derive(Debug, Clone, Copy)]
struct TableHeader {
    /// Offset of the first record, `EMPTY` when the table has none
    first: u16,
    /// Offset of the last record (not one past it)
    last: u16,
    record_len: u8,
    key_len: u8,
}

impl TableHeader {
    fn empty(layout: (u8, u8)) -> Self {
        Self {
            first: EMPTY,
            last: EMPTY,
            record_len: layout.0,
            key_len: layout.1,
        }
    }
}

/// In-memory database image
#[derive(Debug)]
pub struct MemoryImage {
    block: Vec<u8>,
    fdf: Vec<u8>,
    headers: [TableHeader; HEADER_ENTRIES],
    data_cursor: usize,
    fdf_cursor: usize,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImage {
    /// Fresh empty image
    pub fn new() -> Self {
        let mut headers = [TableHeader::empty((0, 0)); HEADER_ENTRIES];
        for (h, layout) in headers.iter_mut().zip(TABLE_LAYOUT) {
            *h = TableHeader::empty(layout);
        }
        Self {
            block: vec![0xff; BLOCK_SIZE],
            fdf: vec![0xff; FDF_SIZE],
            headers,
            data_cursor: HEADER_SIZE,
            fdf_cursor: 0,
        }
    }

    /// Parse an image read back from the device
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < IMAGE_SIZE {
            return Err(ProtocolError::TruncatedRecord);
        }
        let mut image = Self::new();
        image.block.copy_from_slice(&buf[..BLOCK_SIZE]);
        image.fdf.copy_from_slice(&buf[BLOCK_SIZE..IMAGE_SIZE]);

        let mut data_cursor = HEADER_SIZE;
        for (i, h) in image.headers.iter_mut().enumerate() {
            let at = i * 6;
            let first = u16::from_be_bytes([image.block[at], image.block[at + 1]]);
            let last = u16::from_be_bytes([image.block[at + 2], image.block[at + 3]]);
            let record_len = image.block[at + 4];
            let key_len = image.block[at + 5];
            if first == EMPTY || record_len == 0 {
                continue;
            }
            let end = usize::from(last) + usize::from(record_len);
            if usize::from(first) < HEADER_SIZE || end > BLOCK_SIZE || last < first {
                warn!(table = i, "ignoring corrupt table header");
                continue;
            }
            *h = TableHeader {
                first,
                last,
                record_len,
                key_len,
            };
            data_cursor = data_cursor.max(end);
        }
        image.data_cursor = data_cursor;
        image.fdf_cursor = image.fdf_end();
        Ok(image)
    }

    /// Serialize into the wire image
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IMAGE_SIZE);
        out.extend_from_slice(&self.block);
        out.extend_from_slice(&self.fdf);
        for (i, h) in self.headers.iter().enumerate() {
            let at = i * 6;
            out[at..at + 2].copy_from_slice(&h.first.to_be_bytes());
            out[at + 2..at + 4].copy_from_slice(&h.last.to_be_bytes());
            out[at + 4] = h.record_len;
            out[at + 5] = h.key_len;
        }
        out
    }

    /// Append one record to a table; records of one table must be added
    /// consecutively
    pub fn add_record(&mut self, table: usize, data: &[u8]) -> Result<(), ProtocolError> {
        let header = self
            .headers
            .get_mut(table)
            .ok_or(ProtocolError::InvalidResponse)?;
        let record_len = usize::from(header.record_len);
        if record_len == 0 || data.len() != record_len {
            return Err(ProtocolError::InvalidResponse);
        }
        if self.data_cursor + record_len > BLOCK_SIZE {
            return Err(ProtocolError::DatabaseFull);
        }

        let at = self.data_cursor as u16;
        if header.first == EMPTY {
            header.first = at;
        }
        header.last = at;
        self.block[self.data_cursor..self.data_cursor + record_len].copy_from_slice(data);
        self.data_cursor += record_len;
        Ok(())
    }

    /// Number of records in a table
    pub fn record_count(&self, table: usize) -> usize {
        let Some(h) = self.headers.get(table) else {
            return 0;
        };
        if h.first == EMPTY || h.record_len == 0 {
            return 0;
        }
        1 + usize::from(h.last - h.first) / usize::from(h.record_len)
    }

    /// Borrow record `index` of a table
    pub fn record(&self, table: usize, index: usize) -> Option<&[u8]> {
        if index >= self.record_count(table) {
            return None;
        }
        let h = &self.headers[table];
        let at = usize::from(h.first) + index * usize::from(h.record_len);
        self.block.get(at..at + usize::from(h.record_len))
    }

    /// Iterate the records of a table
    pub fn records(&self, table: usize) -> impl Iterator<Item = &[u8]> {
        (0..self.record_count(table)).filter_map(move |i| self.record(table, i))
    }

    /// Append a tagged declaration field
    pub fn add_field(&mut self, id: u8, data: &[u8]) -> Result<(), ProtocolError> {
        let total = data.len() + 2;
        if total > usize::from(u8::MAX) {
            return Err(ProtocolError::InvalidResponse);
        }
        if self.fdf_cursor + total > FDF_SIZE {
            return Err(ProtocolError::DatabaseFull);
        }
        self.fdf[self.fdf_cursor] = total as u8;
        self.fdf[self.fdf_cursor + 1] = id;
        self.fdf[self.fdf_cursor + 2..self.fdf_cursor + total].copy_from_slice(data);
        self.fdf_cursor += total;
        Ok(())
    }

    /// Linear scan of the tagged-field area
    ///
    /// A zero length byte would never advance the scan, so it terminates it;
    /// that also guards against looping forever on corrupt data.
    pub fn find_field(&self, id: u8) -> Option<&[u8]> {
        let mut pos = 0;
        while pos + 2 <= FDF_SIZE {
            let total = usize::from(self.fdf[pos]);
            if total < 2 || pos + total > FDF_SIZE {
                return None;
            }
            if self.fdf[pos + 1] == id {
                return Some(&self.fdf[pos + 2..pos + total]);
            }
            pos += total;
        }
        None
    }

    /// Offset just past the last well-formed tagged field
    fn fdf_end(&self) -> usize {
        let mut pos = 0;
        while pos + 2 <= FDF_SIZE {
            let total = usize::from(self.fdf[pos]);
            if total < 2 || pos + total > FDF_SIZE {
                break;
            }
            pos += total;
        }
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_round_trip() {
        let mut image = MemoryImage::new();
        let a = [1u8; 13];
        let b = [2u8; 13];
        image.add_record(table::WAYPOINTS, &a).unwrap();
        image.add_record(table::WAYPOINTS, &b).unwrap();
        image.add_record(table::PILOTS, &[3u8; 16]).unwrap();

        let reread = MemoryImage::from_bytes(&image.to_bytes()).unwrap();
        assert_eq!(reread.record_count(table::WAYPOINTS), 2);
        assert_eq!(reread.record(table::WAYPOINTS, 0).unwrap(), &a);
        assert_eq!(reread.record(table::WAYPOINTS, 1).unwrap(), &b);
        assert_eq!(reread.record_count(table::PILOTS), 1);
        assert_eq!(reread.record_count(table::ROUTES), 0);
    }

    #[test]
    fn wrong_record_length_rejected() {
        let mut image = MemoryImage::new();
        assert!(matches!(
            image.add_record(table::WAYPOINTS, &[0u8; 14]),
            Err(ProtocolError::InvalidResponse)
        ));
    }

    #[test]
    fn block_overflow_reported() {
        let mut image = MemoryImage::new();
        let route = [0u8; 144];
        loop {
            match image.add_record(table::ROUTES, &route) {
                Ok(()) => {}
                Err(ProtocolError::DatabaseFull) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        // All added records survive serialization
        let reread = MemoryImage::from_bytes(&image.to_bytes()).unwrap();
        assert_eq!(
            reread.record_count(table::ROUTES),
            (BLOCK_SIZE - HEADER_SIZE) / 144
        );
    }

    #[test]
    fn field_lookup() {
        let mut image = MemoryImage::new();
        image.add_field(0x05, b"ASK-21").unwrap();
        image.add_field(0x06, b"D-1234").unwrap();
        assert_eq!(image.find_field(0x05).unwrap(), b"ASK-21");
        assert_eq!(image.find_field(0x06).unwrap(), b"D-1234");
        assert_eq!(image.find_field(0x07), None);
    }

    #[test]
    fn fields_survive_round_trip() {
        let mut image = MemoryImage::new();
        image.add_field(0x09, &[7u8; 16]).unwrap();
        let reread = MemoryImage::from_bytes(&image.to_bytes()).unwrap();
        assert_eq!(reread.find_field(0x09).unwrap(), &[7u8; 16]);
        // Appending continues after the existing fields
        let mut reread = reread;
        reread.add_field(0x0A, &[8u8; 16]).unwrap();
        assert_eq!(reread.find_field(0x09).unwrap(), &[7u8; 16]);
        assert_eq!(reread.find_field(0x0A).unwrap(), &[8u8; 16]);
    }

    #[test]
    fn zero_length_field_terminates_scan() {
        let mut image = MemoryImage::new();
        image.add_field(0x05, b"X").unwrap();
        // Corrupt the area behind the first field with a zero length byte
        image.fdf[3] = 0;
        assert_eq!(image.find_field(0x05).unwrap(), b"X");
        assert_eq!(image.find_field(0x99), None);
    }

    #[test]
    fn corrupt_table_header_ignored() {
        let mut image = MemoryImage::new();
        image.add_record(table::WAYPOINTS, &[1u8; 13]).unwrap();
        let mut bytes = image.to_bytes();
        // Point the pilot table outside the block
        bytes[6..8].copy_from_slice(&0x2ffeu16.to_be_bytes());
        bytes[8..10].copy_from_slice(&0x2ffeu16.to_be_bytes());
        bytes[10] = 16;
        let reread = MemoryImage::from_bytes(&bytes).unwrap();
        assert_eq!(reread.record_count(table::PILOTS), 0);
        assert_eq!(reread.record_count(table::WAYPOINTS), 1);
    }
}
