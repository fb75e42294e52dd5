//! Immutable sorted runs persisted by flushes.
//!
//! On-disk layout (all integers little-endian):
//!
//! ```text
//! +-----------+-------------+--------------+----------+----------+----
//! | MAGIC (4B)| VERSION (1B)| REP CODE (1B)| record 0 | record 1 | ...
//! +-----------+-------------+--------------+----------+----------+----
//! ```
//!
//! Each record frames one key/value pair behind a checksum:
//!
//! ```text
//! +----------+-----------+-----------+-----+-------+
//! | CRC (4B) | KLEN (4B) | VLEN (4B) | key | value |
//! +----------+-----------+-----------+-----+-------+
//! ```
//!
//! The CRC (crc32c) covers the key followed by the value. A run keeps its
//! entries resident after load, so lookups and cursors never touch the file
//! again.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crc32c::{crc32c, crc32c_append};
use num_traits::FromPrimitive;

use crate::error::{Error, Result};
use crate::memtable::{Entry, Representation};

const MAGIC: [u8; 4] = *b"MTBL";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 6;

const CRC_OFFSET: usize = 0;
const KLEN_OFFSET: usize = 4;
const VLEN_OFFSET: usize = 8;
const RECORD_HEADER_LEN: usize = 12;

const WRITE_BUFFER_CAPACITY: usize = 128 * 1024;

/// File name for the run with the given id, e.g. `run-000007.tbl`.
pub fn run_file_name(id: u64) -> String {
    format!("run-{id:06}.tbl")
}

/// Extracts the run id back out of a file name produced by
/// [`run_file_name`]. Returns `None` for anything else.
pub fn parse_run_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("run-")?
        .strip_suffix(".tbl")?
        .parse()
        .ok()
}

/// An immutable sorted run on disk, with its sorted entries resident.
pub struct SortedTable {
    id: u64,
    path: PathBuf,
    representation: Representation,
    entries: Vec<Entry>,
    file_bytes: u64,
}

impl SortedTable {
    /// Persists `entries` (which must already be sorted by key) as a new
    /// run file and returns the resident table. The file is fsynced before
    /// this returns, so flush timings include the durability cost.
    pub fn write(
        id: u64,
        path: PathBuf,
        representation: Representation,
        entries: Vec<Entry>,
    ) -> Result<SortedTable> {
        debug_assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));

        let file = File::create(&path)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file);
        writer.write_all(&MAGIC)?;
        writer.write_all(&[FORMAT_VERSION])?;
        writer.write_all(&[representation as u8])?;

        let mut file_bytes = HEADER_LEN as u64;
        for (key, value) in &entries {
            let crc = crc32c_append(crc32c(key), value);
            writer.write_all(&crc.to_le_bytes())?;
            writer.write_all(&(key.len() as u32).to_le_bytes())?;
            writer.write_all(&(value.len() as u32).to_le_bytes())?;
            writer.write_all(key)?;
            writer.write_all(value)?;
            file_bytes += (RECORD_HEADER_LEN + key.len() + value.len()) as u64;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(SortedTable {
            id,
            path,
            representation,
            entries,
            file_bytes,
        })
    }

    /// Reads a run file back, validating the header and every record CRC.
    pub fn load(id: u64, path: PathBuf) -> Result<SortedTable> {
        let bytes = std::fs::read(&path)?;
        if bytes.len() < HEADER_LEN || bytes[..4] != MAGIC || bytes[4] != FORMAT_VERSION {
            return Err(Error::InvalidTableHeader);
        }
        let representation = Representation::from_u8(bytes[5])
            .ok_or(Error::InvalidRepresentation(bytes[5]))?;

        let mut entries = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < bytes.len() {
            let remaining = bytes.len() - pos;
            if remaining < RECORD_HEADER_LEN {
                return Err(Error::TruncatedRecord(RECORD_HEADER_LEN, remaining));
            }
            let crc = read_u32(&bytes, pos + CRC_OFFSET);
            let klen = read_u32(&bytes, pos + KLEN_OFFSET) as usize;
            let vlen = read_u32(&bytes, pos + VLEN_OFFSET) as usize;

            let body = pos + RECORD_HEADER_LEN;
            if bytes.len() - body < klen + vlen {
                return Err(Error::TruncatedRecord(klen + vlen, bytes.len() - body));
            }
            let key = bytes[body..body + klen].to_vec();
            let value = bytes[body + klen..body + klen + vlen].to_vec();

            let actual = crc32c_append(crc32c(&key), &value);
            if actual != crc {
                return Err(Error::InvalidCrc(crc, actual));
            }
            entries.push((key, value));
            pos = body + klen + vlen;
        }
        debug_assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));

        Ok(SortedTable {
            id,
            path,
            representation,
            entries,
            file_bytes: bytes.len() as u64,
        })
    }

    /// Point lookup by binary search.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let idx = self
            .entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()?;
        Some(&self.entries[idx].1)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn file_bytes(&self) -> u64 {
        self.file_bytes
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Owned forward cursor over a run, positioned at the first key `>= start`.
pub struct TableCursor {
    table: Arc<SortedTable>,
    pos: usize,
}

impl TableCursor {
    pub fn new(table: Arc<SortedTable>, start: &[u8]) -> TableCursor {
        let pos = table
            .entries
            .partition_point(|(k, _)| k.as_slice() < start);
        TableCursor { table, pos }
    }
}

impl Iterator for TableCursor {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let entry = self.table.entries.get(self.pos)?.clone();
        self.pos += 1;
        Some(entry)
    }
}
