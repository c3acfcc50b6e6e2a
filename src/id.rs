//! ID table (§4.5): 32-bit uid/gid to 16-bit index mapping, persisted via the table codec.

use deku::prelude::*;
use tracing::instrument;

use crate::block_file::BlockFile;
use crate::compressor::Codec;
use crate::error::SqfsError;
use crate::table::{read_table, write_table};

/// A single 32-bit user or group ID, as stored on disk.
#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Id {
    pub num: u32,
}

impl Id {
    pub const SIZE: usize = (u32::BITS / 8) as usize;

    pub fn new(num: u32) -> Id {
        Id { num }
    }

    pub fn root() -> Vec<Id> {
        vec![Id { num: 0 }]
    }
}

/// Maps 32-bit ids to stable 16-bit indices. A SquashFS image may carry at most 65,536 distinct
/// ids (the field width an inode uses to reference one).
#[derive(Debug, Default)]
pub struct IdTable {
    ids: Vec<u32>,
}

impl IdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `id` to its table index, interning it on first use. Idempotent: interning the
    /// same id twice returns the same index (§8 invariant 2).
    #[instrument(skip(self))]
    pub fn intern(&mut self, id: u32) -> Result<u16, SqfsError> {
        if let Some(idx) = self.ids.iter().position(|&existing| existing == id) {
            return Ok(idx as u16);
        }
        if self.ids.len() >= u16::MAX as usize + 1 {
            return Err(SqfsError::Internal("id table would exceed 65536 entries"));
        }
        self.ids.push(id);
        Ok((self.ids.len() - 1) as u16)
    }

    pub fn resolve(&self, index: u16) -> Result<u32, SqfsError> {
        self.ids
            .get(index as usize)
            .copied()
            .ok_or(SqfsError::OutOfBounds(index as u64, 0, self.ids.len() as u64))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Persist as a meta-block-chunked table of little-endian u32s, returning the absolute
    /// location of its location list (the value a super-block's `id_table_start` stores).
    pub fn write(&self, file: &mut dyn BlockFile, cmp: Codec) -> Result<u64, SqfsError> {
        let mut bytes = Vec::with_capacity(self.ids.len() * 4);
        for id in &self.ids {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        write_table(file, cmp, &bytes)
    }

    pub fn read(
        file: &dyn BlockFile,
        cmp: Codec,
        id_count: u16,
        location: u64,
        lower_limit: u64,
        upper_limit: u64,
    ) -> Result<Self, SqfsError> {
        let table_size = id_count as usize * 4;
        let bytes = read_table(file, cmp, table_size, location, lower_limit, upper_limit)?;
        let ids = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self { ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::Compressor;

    #[test]
    fn intern_is_idempotent_and_resolves() {
        let mut t = IdTable::new();
        let a = t.intern(1000).unwrap();
        let b = t.intern(2000).unwrap();
        let a2 = t.intern(1000).unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(t.resolve(a).unwrap(), 1000);
        assert_eq!(t.resolve(b).unwrap(), 2000);
    }

    #[test]
    fn write_read_round_trip() {
        let mut t = IdTable::new();
        for id in [0, 1000, 65535, 4294967295] {
            t.intern(id).unwrap();
        }
        let cmp = Codec::new(Compressor::Xz, None).unwrap();
        let mut file = MemoryFile::new();
        let location = t.write(&mut file, cmp).unwrap();

        let back = IdTable::read(&file, cmp, t.len() as u16, location, 0, file.get_size()).unwrap();
        assert_eq!(back.ids, t.ids);
    }
}
