//! Block-backed file (§4.2): an addressable, growable byte container.
//!
//! The block processor (§4.7) and image serializer (§4.10) only need `read_at`/`write_at`/
//! `get_size`/`truncate` — never a cursor-based `Read`/`Write` — because writes during
//! deduplication rollback happen out of append order. [`BlockFile`] is the capability
//! abstraction the design notes (§9) call for in place of a function-pointer v-table.

use std::io;

use crate::error::SqfsError;

/// Capability set required by the packer's output target and by random-access input readers.
pub trait BlockFile: Send {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SqfsError>;

    /// Write `buf` at `offset`, extending the file (zero-filling any gap) if necessary.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), SqfsError>;

    /// Current logical size in bytes.
    fn get_size(&self) -> u64;

    /// Shrink (never grow) the file to `size` bytes. Used by block-run dedup rollback (§4.7).
    fn truncate(&mut self, size: u64) -> Result<(), SqfsError>;
}

/// An in-memory [`BlockFile`], used for the output image during packing and for tests. Growing
/// on `write_at` zero-fills any gap the way a sparse on-disk file would.
#[derive(Debug, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockFile for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SqfsError> {
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or(SqfsError::Internal("read_at overflow"))?;
        if end > self.data.len() {
            return Err(SqfsError::OutOfBounds(
                end as u64,
                0,
                self.data.len() as u64,
            ));
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), SqfsError> {
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or(SqfsError::Internal("write_at overflow"))?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn truncate(&mut self, size: u64) -> Result<(), SqfsError> {
        self.data.truncate(size as usize);
        Ok(())
    }
}

/// A [`std::fs::File`]-backed [`BlockFile`], for packing directly to disk.
#[derive(Debug)]
pub struct DiskFile {
    file: std::fs::File,
    size: u64,
}

impl DiskFile {
    pub fn new(file: std::fs::File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

#[cfg(unix)]
impl BlockFile for DiskFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), SqfsError> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), SqfsError> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        self.size = self.size.max(offset + buf.len() as u64);
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.size
    }

    fn truncate(&mut self, size: u64) -> Result<(), SqfsError> {
        self.file.set_len(size)?;
        self.size = size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn grows_on_write() {
        let mut f = MemoryFile::new();
        f.write_at(4, b"abcd").unwrap();
        assert_eq!(f.get_size(), 8);
        assert_eq!(&f.as_slice()[0..4], &[0, 0, 0, 0]);
        assert_eq!(&f.as_slice()[4..8], b"abcd");
    }

    #[test]
    fn truncate_shrinks() {
        let mut f = MemoryFile::new();
        f.write_at(0, b"0123456789").unwrap();
        f.truncate(4).unwrap();
        assert_eq!(f.get_size(), 4);
        assert_eq!(f.as_slice(), b"0123");
    }

    #[test]
    fn read_out_of_bounds() {
        let f = MemoryFile::new();
        let mut buf = [0u8; 4];
        assert!(f.read_at(0, &mut buf).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn disk_file_round_trips_through_a_real_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = std::fs::OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        let mut disk = DiskFile::new(file).unwrap();

        disk.write_at(4, b"abcd").unwrap();
        assert_eq!(disk.get_size(), 8);

        let mut buf = [0u8; 4];
        disk.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        disk.truncate(4).unwrap();
        assert_eq!(disk.get_size(), 4);
        assert_eq!(std::fs::metadata(tmp.path()).unwrap().len(), 4);
    }
}
