//! Meta-block codec (§4.3): the compressed 8192-byte-input chunking scheme shared by the
//! inode, directory, id, fragment, export, and xattr tables.
//!
//! Grounded in the teacher's `MetadataWriter` (`writer.rs`) for the accumulate-then-spill
//! buffering discipline, generalized to: (a) actually honor the "skip compression when it
//! doesn't help" rule the teacher left as a `TODO`, and (b) read back through a
//! [`MetaReader`] bounded by a sanity window, the way `sqfs_meta_reader_seek` validates
//! `lower_limit`/`upper_limit` in `lib/sqfs/read_table.c` of the original implementation.

use std::io;

use deku::prelude::*;
use tracing::{instrument, trace};

use crate::block_file::BlockFile;
use crate::compressor::Codec;
use crate::error::SqfsError;

/// Maximum *uncompressed* payload carried by one meta-block.
pub const METADATA_MAXSIZE: usize = 8192;

const METADATA_COMPRESSED_BIT: u16 = 1 << 15;

/// On-disk meta-block header plus payload, as read directly off the wire.
#[derive(Debug, DekuRead, DekuWrite)]
pub struct Metadata {
    pub(crate) len: u16,
    #[deku(count = "Self::len(*len)")]
    pub(crate) data: Vec<u8>,
}

impl Metadata {
    /// Whether the block's `data` is compressed, from the raw on-disk `len` field.
    pub fn is_compressed(len: u16) -> bool {
        len & METADATA_COMPRESSED_BIT == 0
    }

    /// Actual payload length encoded in a raw on-disk `len` field.
    pub fn len(len: u16) -> u16 {
        len & !METADATA_COMPRESSED_BIT
    }
}

/// Accumulates bytes into 8192-byte chunks, compressing and framing each one as it spills.
///
/// `position()` returns the `(block_start, offset_within_buffer)` pair an inode reference or
/// table entry is built from (§3, "inode reference"). `block_start` is relative to the start of
/// this writer's own stream; callers add the stream's base offset in the image themselves.
#[derive(Debug)]
pub struct MetaWriter {
    codec: Codec,
    uncompressed: Vec<u8>,
    output: Vec<u8>,
}

impl MetaWriter {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            uncompressed: Vec::new(),
            output: Vec::new(),
        }
    }

    /// `(block_start, offset_within_buffer)` for a record about to be written.
    pub fn position(&self) -> (u64, u16) {
        (self.output.len() as u64, self.uncompressed.len() as u16)
    }

    #[instrument(skip_all)]
    fn emit_block(&mut self, chunk: &[u8]) -> Result<(), SqfsError> {
        let compressed = self.codec.do_block(chunk)?;
        let (payload, uncompressed_flag): (&[u8], u16) = match &compressed {
            Some(c) => (c.as_slice(), 0),
            None => (chunk, METADATA_COMPRESSED_BIT),
        };
        let header = payload.len() as u16 | uncompressed_flag;
        trace!(len = payload.len(), compressed = uncompressed_flag == 0, "emit meta-block");
        self.output.extend_from_slice(&header.to_le_bytes());
        self.output.extend_from_slice(payload);
        Ok(())
    }

    /// Append bytes, spilling full 8192-byte chunks to `output` as they accumulate.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), SqfsError> {
        self.uncompressed.extend_from_slice(buf);
        while self.uncompressed.len() >= METADATA_MAXSIZE {
            let chunk: Vec<u8> = self.uncompressed.drain(..METADATA_MAXSIZE).collect();
            self.emit_block(&chunk)?;
        }
        Ok(())
    }

    /// Force emission of the current partial block, even if it is smaller than 8192 bytes.
    /// A no-op if nothing is buffered.
    pub fn flush_block(&mut self) -> Result<(), SqfsError> {
        if self.uncompressed.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.uncompressed);
        self.emit_block(&chunk)
    }

    /// Consume the writer, returning the framed byte stream. Callers that still have a pending
    /// partial block should call [`MetaWriter::flush_block`] first.
    pub fn into_inner(self) -> Vec<u8> {
        self.output
    }

    pub fn len(&self) -> u64 {
        self.output.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.uncompressed.is_empty()
    }
}

impl io::Write for MetaWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads a meta-block stream back, honoring a `[lower_limit, upper_limit)` sanity window the
/// way `sqfs_meta_reader_seek` does: any `seek` target outside that window is corrupt data, not
/// a logic bug, and is reported as [`SqfsError::OutOfBounds`].
pub struct MetaReader {
    codec: Codec,
    base_offset: u64,
    lower_limit: u64,
    upper_limit: u64,
    next_block_offset: u64,
    buffer: Vec<u8>,
    pos: usize,
}

impl MetaReader {
    pub fn new(codec: Codec, base_offset: u64, lower_limit: u64, upper_limit: u64) -> Self {
        Self {
            codec,
            base_offset,
            lower_limit,
            upper_limit,
            next_block_offset: base_offset,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Position the cursor at `block_start` (relative to this stream's base) and `byte_offset`
    /// within its decompressed payload, decoding that block immediately.
    #[instrument(skip(self, file))]
    pub fn seek(
        &mut self,
        file: &dyn BlockFile,
        block_start: u64,
        byte_offset: u16,
    ) -> Result<(), SqfsError> {
        let absolute = self.base_offset + block_start;
        if absolute < self.lower_limit || absolute >= self.upper_limit {
            return Err(SqfsError::OutOfBounds(
                absolute,
                self.lower_limit,
                self.upper_limit,
            ));
        }
        self.decode_block_at(file, absolute)?;
        if byte_offset as usize > self.buffer.len() {
            return Err(SqfsError::OutOfBounds(
                byte_offset as u64,
                0,
                self.buffer.len() as u64,
            ));
        }
        self.pos = byte_offset as usize;
        Ok(())
    }

    fn decode_block_at(&mut self, file: &dyn BlockFile, absolute: u64) -> Result<(), SqfsError> {
        let mut header_bytes = [0u8; 2];
        file.read_at(absolute, &mut header_bytes)?;
        let raw_len = u16::from_le_bytes(header_bytes);
        let len = Metadata::len(raw_len) as usize;
        let compressed = Metadata::is_compressed(raw_len);

        let mut payload = vec![0u8; len];
        file.read_at(absolute + 2, &mut payload)?;

        self.buffer = if compressed {
            self.codec.decompress(&payload)?
        } else {
            payload
        };
        self.pos = 0;
        self.next_block_offset = absolute + 2 + len as u64;
        Ok(())
    }

    /// Read `dst.len()` bytes, transparently crossing meta-block boundaries.
    #[instrument(skip(self, file, dst))]
    pub fn read(&mut self, file: &dyn BlockFile, dst: &mut [u8]) -> Result<(), SqfsError> {
        let mut filled = 0;
        while filled < dst.len() {
            if self.pos >= self.buffer.len() {
                let next = self.next_block_offset;
                if next < self.lower_limit || next >= self.upper_limit {
                    return Err(SqfsError::OutOfBounds(next, self.lower_limit, self.upper_limit));
                }
                self.decode_block_at(file, next)?;
                if self.buffer.is_empty() {
                    return Err(SqfsError::CorruptedHeader("meta-block read ran past end of stream"));
                }
            }
            let take = (dst.len() - filled).min(self.buffer.len() - self.pos);
            dst[filled..filled + take].copy_from_slice(&self.buffer[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }

    /// Current `(block_start, offset_within_buffer)`, mirroring [`MetaWriter::position`].
    pub fn position(&self) -> (u64, u16) {
        (self.next_block_offset.saturating_sub(self.base_offset), self.pos as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::{Codec, Compressor};

    fn codec() -> Codec {
        Codec::new(Compressor::Xz, None).unwrap()
    }

    #[test]
    fn round_trip_small() {
        let mut w = MetaWriter::new(codec());
        w.write_all(b"hello metadata").unwrap();
        w.flush_block().unwrap();
        let bytes = w.into_inner();

        let mut file = MemoryFile::new();
        file.write_at(0, &bytes).unwrap();

        let mut r = MetaReader::new(codec(), 0, 0, bytes.len() as u64);
        r.seek(&file, 0, 0).unwrap();
        let mut out = vec![0u8; b"hello metadata".len()];
        r.read(&file, &mut out).unwrap();
        assert_eq!(out, b"hello metadata");
    }

    #[test]
    fn round_trip_spans_multiple_blocks() {
        let mut w = MetaWriter::new(codec());
        let part1 = vec![0xffu8; METADATA_MAXSIZE - 3];
        w.write_all(&part1).unwrap();
        assert_eq!(w.position(), (0, part1.len() as u16));

        let part2 = [0x11u8; 6];
        w.write_all(&part2).unwrap();
        // 3 bytes of part2 spilled the first block; 3 remain buffered.
        assert_eq!(w.position().1, 3);

        w.flush_block().unwrap();
        let bytes = w.into_inner();

        let mut file = MemoryFile::new();
        file.write_at(0, &bytes).unwrap();

        let mut r = MetaReader::new(codec(), 0, 0, bytes.len() as u64);
        r.seek(&file, 0, 0).unwrap();
        let mut all = vec![0u8; part1.len() + part2.len()];
        r.read(&file, &mut all).unwrap();
        assert_eq!(&all[..part1.len()], &part1[..]);
        assert_eq!(&all[part1.len()..], &part2[..]);
    }

    #[test]
    fn seek_outside_sanity_window_is_rejected() {
        let mut w = MetaWriter::new(codec());
        w.write_all(b"abc").unwrap();
        w.flush_block().unwrap();
        let bytes = w.into_inner();
        let mut file = MemoryFile::new();
        file.write_at(100, &bytes).unwrap();

        let mut r = MetaReader::new(codec(), 100, 200, 300);
        assert!(r.seek(&file, 0, 0).is_err());
    }
}
