//! Super-block (§4.10/§6): the fixed 96-byte image header plus its flag bits and the NFS export
//! table entry type.
//!
//! Field layout and flag bits are grounded in the teacher's `squashfs.rs`; the hard-coded
//! `block_size`/`block_log` asserts the teacher carried (effectively pinning every image to a
//! 128 KiB block size) are dropped here since block size is a [`crate::config::PackOptions`]
//! choice, not a format constant.

use deku::prelude::*;

use crate::compressor::Compressor;
use crate::error::SqfsError;

pub const SUPER_BLOCK_MAGIC: u32 = 0x7371_7368;
pub const SUPER_BLOCK_SIZE: u64 = 96;
pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;

/// Sentinel for a super-block table field that has no corresponding table in this image.
pub const NO_TABLE: u64 = u64::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SuperBlock {
    #[deku(assert_eq = "SUPER_BLOCK_MAGIC")]
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    /// A freshly initialized super-block with every table field pointing at [`NO_TABLE`];
    /// the image serializer overwrites them as each table is actually written.
    pub fn new(compressor: Compressor, block_size: u32, block_log: u16, mod_time: u32) -> Self {
        Self {
            magic: SUPER_BLOCK_MAGIC,
            inode_count: 0,
            mod_time,
            block_size,
            frag_count: 0,
            compressor,
            block_log,
            flags: 0,
            id_count: 0,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            root_inode: 0,
            bytes_used: 0,
            id_table: NO_TABLE,
            xattr_table: NO_TABLE,
            inode_table: NO_TABLE,
            dir_table: NO_TABLE,
            frag_table: NO_TABLE,
            export_table: NO_TABLE,
        }
    }

    pub fn set_flag(&mut self, flag: Flags, value: bool) {
        if value {
            self.flags |= flag as u16;
        } else {
            self.flags &= !(flag as u16);
        }
    }

    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags & flag as u16 != 0
    }

    /// Size in bytes of the compressor-options block following the super-block, or `None` when
    /// `COMPRESSOR_OPTIONS_PRESENT` is clear. Sizes are the on-disk struct size of each backend's
    /// options struct plus the 2-byte meta-block header that frames it.
    pub fn compression_options_size(&self) -> Option<usize> {
        if !self.has_flag(Flags::CompressorOptionsPresent) {
            return None;
        }
        let size = match self.compressor {
            Compressor::Lzma | Compressor::None => 0,
            Compressor::Gzip | Compressor::Lzo | Compressor::Xz | Compressor::Lz4 => 8,
            Compressor::Zstd => 4,
        };
        Some(size + 2)
    }

    pub fn validate(&self) -> Result<(), SqfsError> {
        if self.magic != SUPER_BLOCK_MAGIC {
            return Err(SqfsError::CorruptedHeader("bad super-block magic"));
        }
        if self.version_major != VERSION_MAJOR {
            return Err(SqfsError::CorruptedHeader("unsupported on-disk version"));
        }
        if !self.block_size.is_power_of_two() || self.block_size < 4096 {
            return Err(SqfsError::CorruptedHeader("block size must be a power of two >= 4096"));
        }
        if self.block_size != 1u32 << self.block_log {
            return Err(SqfsError::CorruptedHeader("block_log does not match block_size"));
        }
        Ok(())
    }
}

/// Super-block flag bits (§6). Bit 2 (`Unused` in older documentation) is `UNCOMPRESSED_IDS`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Flags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    UncompressedIds             = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    NoFragments                 = 0b0000_0000_0001_0000,
    AlwaysFragments             = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NfsExportTableExists        = 0b0000_0000_1000_0000,
    XattrsStoredUncompressed    = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsPresent    = 0b0000_0100_0000_0000,
}

/// One entry of the NFS export table: an inode reference, indexed by `inode_number - 1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ExportEntry(pub u64);

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn new_super_block_has_sentinel_tables() {
        let sb = SuperBlock::new(Compressor::Xz, 131072, 17, 0);
        assert_eq!(sb.id_table, NO_TABLE);
        assert_eq!(sb.magic, SUPER_BLOCK_MAGIC);
    }

    #[test]
    fn flag_round_trips() {
        let mut sb = SuperBlock::new(Compressor::Gzip, 4096, 12, 0);
        assert!(!sb.has_flag(Flags::NoFragments));
        sb.set_flag(Flags::NoFragments, true);
        assert!(sb.has_flag(Flags::NoFragments));
        sb.set_flag(Flags::NoFragments, false);
        assert!(!sb.has_flag(Flags::NoFragments));
    }

    #[test]
    fn validate_rejects_mismatched_block_log() {
        let mut sb = SuperBlock::new(Compressor::Xz, 131072, 16, 0);
        assert!(sb.validate().is_err());
        sb.block_log = 17;
        assert!(sb.validate().is_ok());
    }
}
