//! Fragment table (§4.6): append-only registry of fragment block (offset, on-disk size) tuples.
//!
//! On-disk layout grounded in the teacher's `Fragment` struct (`fragment.rs`); growth-by-doubling
//! and the empty-table super-block sentinel are grounded in `lib/sqfs/data_writer/fragment.c` and
//! `lib/sqfs/data_writer.c::data_writer_write_fragment_table` of the original implementation.

use deku::prelude::*;
use tracing::instrument;

use crate::block_file::BlockFile;
use crate::compressor::Codec;
use crate::error::SqfsError;
use crate::table::{read_table, write_table};

pub(crate) const FRAGMENT_SIZE: usize =
    std::mem::size_of::<u64>() + std::mem::size_of::<u32>() + std::mem::size_of::<u32>();

/// Bit 24 of a fragment (or data block)'s on-disk size field marks it stored uncompressed.
pub const BLOCK_UNCOMPRESSED_BIT: u32 = 1 << 24;

/// One 16-byte fragment table entry (§3 `FragmentEntry`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fragment {
    pub(crate) start: u64,
    pub(crate) size: u32,
    pub(crate) unused: u32,
}

impl Fragment {
    pub fn new(start: u64, on_disk_size: u32, compressed: bool) -> Self {
        let size = if compressed {
            on_disk_size
        } else {
            on_disk_size | BLOCK_UNCOMPRESSED_BIT
        };
        Self {
            start,
            size,
            unused: 0,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn on_disk_size(&self) -> u32 {
        self.size & !BLOCK_UNCOMPRESSED_BIT
    }

    pub fn is_compressed(&self) -> bool {
        self.size & BLOCK_UNCOMPRESSED_BIT == 0
    }
}

/// Sentinel `fragment_table_start` when no fragment block was ever written.
pub const NO_FRAGMENT_TABLE: u64 = u64::MAX;

/// Append-only list of fragment block locations, indexed by fragment block number.
#[derive(Debug, Default)]
pub struct FragmentTable {
    entries: Vec<Fragment>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Grow the table (if necessary) so `index` is valid, then set its entry. Fragment indices
    /// are always assigned sequentially by the caller, so resizing to exactly `index + 1`
    /// produces the same result `grow_fragment_table` in `process_block.c` gets by doubling.
    #[instrument(skip(self))]
    pub fn set(&mut self, index: u32, entry: Fragment) {
        let index = index as usize;
        if index >= self.entries.len() {
            self.entries.resize(
                index + 1,
                Fragment {
                    start: 0,
                    size: 0,
                    unused: 0,
                },
            );
        }
        self.entries[index] = entry;
    }

    pub fn get(&self, index: u32) -> Option<&Fragment> {
        self.entries.get(index as usize)
    }

    /// Next fresh fragment index, i.e. the index a newly-allocated fragment block would use.
    pub fn next_index(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Persist the table; returns `(table_start, entry_count)`. If no fragment was ever written,
    /// `table_start` is [`NO_FRAGMENT_TABLE`] and the caller should set the NO_FRAGMENTS
    /// super-block flag instead of ALWAYS_FRAGMENTS.
    pub fn write(&self, file: &mut dyn BlockFile, cmp: Codec) -> Result<(u64, u32), SqfsError> {
        if self.entries.is_empty() {
            return Ok((NO_FRAGMENT_TABLE, 0));
        }
        let mut bytes = Vec::with_capacity(self.entries.len() * FRAGMENT_SIZE);
        for e in &self.entries {
            bytes.extend_from_slice(&e.to_bytes()?);
        }
        let start = write_table(file, cmp, &bytes)?;
        Ok((start, self.entries.len() as u32))
    }

    pub fn read(
        file: &dyn BlockFile,
        cmp: Codec,
        count: u32,
        location: u64,
        lower_limit: u64,
        upper_limit: u64,
    ) -> Result<Self, SqfsError> {
        if location == NO_FRAGMENT_TABLE || count == 0 {
            return Ok(Self::new());
        }
        let table_size = count as usize * FRAGMENT_SIZE;
        let bytes = read_table(file, cmp, table_size, location, lower_limit, upper_limit)?;
        let mut entries = Vec::with_capacity(count as usize);
        for chunk in bytes.chunks_exact(FRAGMENT_SIZE) {
            let (_, frag) = Fragment::from_bytes((chunk, 0))?;
            entries.push(frag);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::Compressor;

    #[test]
    fn set_grows_table() {
        let mut t = FragmentTable::new();
        t.set(3, Fragment::new(100, 50, true));
        assert_eq!(t.len(), 4);
        assert_eq!(t.get(3).unwrap().start(), 100);
        assert_eq!(t.get(0).unwrap().start(), 0);
    }

    #[test]
    fn uncompressed_flag_round_trips() {
        let f = Fragment::new(10, 20, false);
        assert!(!f.is_compressed());
        assert_eq!(f.on_disk_size(), 20);
    }

    #[test]
    fn empty_table_uses_sentinel() {
        let t = FragmentTable::new();
        let cmp = Codec::new(Compressor::Xz, None).unwrap();
        let mut file = MemoryFile::new();
        let (start, count) = t.write(&mut file, cmp).unwrap();
        assert_eq!(start, NO_FRAGMENT_TABLE);
        assert_eq!(count, 0);
    }

    #[test]
    fn write_read_round_trip() {
        let mut t = FragmentTable::new();
        t.set(0, Fragment::new(0, 4096, true));
        t.set(1, Fragment::new(4096, 2048, false));
        let cmp = Codec::new(Compressor::Xz, None).unwrap();
        let mut file = MemoryFile::new();
        let (start, count) = t.write(&mut file, cmp).unwrap();

        let back = FragmentTable::read(&file, cmp, count, start, 0, file.get_size()).unwrap();
        assert_eq!(back.entries, t.entries);
    }
}
