//! Extended attribute key/value store and xattr-set id table (§4.9).
//!
//! Grounded in `include/sqfs/xattr.h` and `lib/sqfs/write_xattr.c` of the original implementation
//! for the prefix/suffix key split and the out-of-line (OOL) value dedup heuristic; framed with
//! this crate's own [`crate::metadata::MetaWriter`]/[`crate::metadata::MetaReader`] and
//! [`crate::table`] helpers the way `id.rs` and `fragment.rs` frame their own tables.
//!
//! A key's namespace prefix (`user.`, `trusted.`, `security.`) is packed into the low byte of a
//! 16-bit "kind" field; bit 8 marks the value as out-of-line. Values that recur get replaced by an
//! 8-byte reference to their first occurrence once the reference is cheaper than repeating the
//! value (`len > 8` once seen more than once) -- the OOL heuristic described in §4.9.

use std::collections::HashMap;

use crate::block_file::BlockFile;
use crate::compressor::Codec;
use crate::error::SqfsError;
use crate::metadata::{MetaReader, MetaWriter};
use crate::table::{read_table, write_table};

/// Bit 8 of a key's "kind" field: this key's value is an 8-byte reference, not inline bytes.
pub const XATTR_OOL_FLAG: u16 = 0x0100;

fn prefix_id(key: &str) -> Result<(u16, &str), SqfsError> {
    if let Some(suffix) = key.strip_prefix("user.") {
        Ok((0, suffix))
    } else if let Some(suffix) = key.strip_prefix("trusted.") {
        Ok((1, suffix))
    } else if let Some(suffix) = key.strip_prefix("security.") {
        Ok((2, suffix))
    } else {
        Err(SqfsError::UnsupportedXattrNamespace(key.to_string()))
    }
}

fn prefix_name(id: u16) -> &'static str {
    match id {
        0 => "user.",
        1 => "trusted.",
        2 => "security.",
        _ => "user.",
    }
}

/// One distinct xattr set's entry in the id table: where its key/value records start in the kv
/// stream, how many pairs it holds, and their total uncompressed byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrSetRef {
    pub xattr_ref: u64,
    pub count: u32,
    pub size: u32,
}

/// Accumulates xattr key/value pairs into a shared meta-block stream, one [`XattrSetRef`] per
/// node that actually carries xattrs.
pub struct XattrWriter {
    kv: MetaWriter,
    /// First location a given value was stored at, once seen; used to decide when a later
    /// occurrence is cheap enough to store out-of-line instead of repeating.
    value_locations: HashMap<Vec<u8>, (u64, u16)>,
    sets: Vec<XattrSetRef>,
}

impl XattrWriter {
    pub fn new(codec: Codec) -> Self {
        Self {
            kv: MetaWriter::new(codec),
            value_locations: HashMap::new(),
            sets: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Write one node's full xattr set, returning its index into the id table that
    /// [`XattrWriter::finalize`] later persists.
    pub fn add_set(&mut self, xattrs: &[(String, Vec<u8>)]) -> Result<u32, SqfsError> {
        let (start_block, start_offset) = self.kv.position();
        let mut size = 0u32;
        for (key, value) in xattrs {
            size += self.write_kv(key, value)? as u32;
        }
        let idx = self.sets.len() as u32;
        self.sets.push(XattrSetRef {
            xattr_ref: (start_block << 16) | start_offset as u64,
            count: xattrs.len() as u32,
            size,
        });
        Ok(idx)
    }

    fn write_kv(&mut self, key: &str, value: &[u8]) -> Result<usize, SqfsError> {
        let (prefix, suffix) = prefix_id(key)?;
        let name = suffix.as_bytes();

        // Once a value has been seen before, amortizing it via an 8-byte reference only pays off
        // past 8 bytes (refcount=2 case of len*refcount > len + (refcount-1)*8).
        let use_ool = self
            .value_locations
            .get(value)
            .is_some_and(|_| value.len() > 8);

        let mut written = 0usize;
        let kind = if use_ool { prefix | XATTR_OOL_FLAG } else { prefix };
        self.kv.write_all(&kind.to_le_bytes())?;
        self.kv.write_all(&(name.len() as u16).to_le_bytes())?;
        self.kv.write_all(name)?;
        written += 4 + name.len();

        if use_ool {
            let (block, offset) = *self.value_locations.get(value).unwrap();
            let value_ref = (block << 16) | offset as u64;
            self.kv.write_all(&8u32.to_le_bytes())?;
            self.kv.write_all(&value_ref.to_le_bytes())?;
            written += 4 + 8;
        } else {
            let value_loc = self.kv.position();
            self.kv.write_all(&(value.len() as u32).to_le_bytes())?;
            self.kv.write_all(value)?;
            written += 4 + value.len();
            self.value_locations
                .entry(value.to_vec())
                .or_insert(value_loc);
        }
        Ok(written)
    }

    /// Flush the kv stream and id table, returning the absolute offset of the xattr id table
    /// descriptor (the super-block's `xattr_table` field), or `None` if no node carried xattrs.
    pub fn finalize(mut self, file: &mut dyn BlockFile, codec: Codec) -> Result<Option<u64>, SqfsError> {
        if self.sets.is_empty() {
            return Ok(None);
        }
        self.kv.flush_block()?;
        let kv_table_start = file.get_size();
        let kv_bytes = self.kv.into_inner();
        file.write_at(kv_table_start, &kv_bytes)?;

        let mut id_bytes = Vec::with_capacity(self.sets.len() * 16);
        for s in &self.sets {
            id_bytes.extend_from_slice(&s.xattr_ref.to_le_bytes());
            id_bytes.extend_from_slice(&s.count.to_le_bytes());
            id_bytes.extend_from_slice(&s.size.to_le_bytes());
        }
        let ids_location = write_table(file, codec, &id_bytes)?;

        let descriptor_start = file.get_size();
        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(&kv_table_start.to_le_bytes());
        descriptor.extend_from_slice(&(self.sets.len() as u32).to_le_bytes());
        descriptor.extend_from_slice(&0u32.to_le_bytes());
        descriptor.extend_from_slice(&ids_location.to_le_bytes());
        file.write_at(descriptor_start, &descriptor)?;
        Ok(Some(descriptor_start))
    }
}

/// Reads xattr sets back from an image: the inverse of [`XattrWriter`].
pub struct XattrReader<'a> {
    file: &'a dyn BlockFile,
    codec: Codec,
    kv_table_start: u64,
    sets: Vec<XattrSetRef>,
}

impl<'a> XattrReader<'a> {
    pub fn load(
        file: &'a dyn BlockFile,
        codec: Codec,
        descriptor_offset: u64,
        lower_limit: u64,
        upper_limit: u64,
    ) -> Result<Self, SqfsError> {
        let mut buf = [0u8; 24];
        file.read_at(descriptor_offset, &mut buf)?;
        let kv_table_start = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let ids_location = u64::from_le_bytes(buf[16..24].try_into().unwrap());

        let id_bytes = read_table(file, codec, count as usize * 16, ids_location, lower_limit, upper_limit)?;
        let mut sets = Vec::with_capacity(count as usize);
        for chunk in id_bytes.chunks_exact(16) {
            sets.push(XattrSetRef {
                xattr_ref: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                count: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
                size: u32::from_le_bytes(chunk[12..16].try_into().unwrap()),
            });
        }
        Ok(Self { file, codec, kv_table_start, sets })
    }

    pub fn read_set(&self, index: u32) -> Result<Vec<(String, Vec<u8>)>, SqfsError> {
        let set = self
            .sets
            .get(index as usize)
            .ok_or(SqfsError::OutOfBounds(index as u64, 0, self.sets.len() as u64))?;
        let block_start = set.xattr_ref >> 16;
        let byte_offset = (set.xattr_ref & 0xffff) as u16;

        let upper = self.file.get_size();
        let mut reader = MetaReader::new(self.codec, self.kv_table_start, self.kv_table_start, upper);
        reader.seek(self.file, block_start, byte_offset)?;

        let mut out = Vec::with_capacity(set.count as usize);
        for _ in 0..set.count {
            let mut kind_buf = [0u8; 2];
            reader.read(self.file, &mut kind_buf)?;
            let kind = u16::from_le_bytes(kind_buf);
            let ool = kind & XATTR_OOL_FLAG != 0;
            let prefix = kind & !XATTR_OOL_FLAG;

            let mut len_buf = [0u8; 2];
            reader.read(self.file, &mut len_buf)?;
            let name_len = u16::from_le_bytes(len_buf) as usize;
            let mut name = vec![0u8; name_len];
            reader.read(self.file, &mut name)?;
            let key = format!("{}{}", prefix_name(prefix), String::from_utf8(name)?);

            let mut size_buf = [0u8; 4];
            reader.read(self.file, &mut size_buf)?;
            let size = u32::from_le_bytes(size_buf) as usize;

            let value = if ool {
                let mut ref_buf = [0u8; 8];
                reader.read(self.file, &mut ref_buf)?;
                let value_ref = u64::from_le_bytes(ref_buf);
                let v_block = value_ref >> 16;
                let v_offset = (value_ref & 0xffff) as u16;
                let mut value_reader =
                    MetaReader::new(self.codec, self.kv_table_start, self.kv_table_start, upper);
                value_reader.seek(self.file, v_block, v_offset)?;
                let mut vsize_buf = [0u8; 4];
                value_reader.read(self.file, &mut vsize_buf)?;
                let vsize = u32::from_le_bytes(vsize_buf) as usize;
                let mut value = vec![0u8; vsize];
                value_reader.read(self.file, &mut value)?;
                value
            } else {
                let mut value = vec![0u8; size];
                reader.read(self.file, &mut value)?;
                value
            };
            out.push((key, value));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::Compressor;

    fn codec() -> Codec {
        Codec::new(Compressor::Xz, None).unwrap()
    }

    #[test]
    fn round_trip_single_set() {
        let mut w = XattrWriter::new(codec());
        let idx = w
            .add_set(&[
                ("user.comment".to_string(), b"hello".to_vec()),
                ("trusted.checksum".to_string(), b"abcdef01".to_vec()),
            ])
            .unwrap();
        assert_eq!(idx, 0);

        let mut file = MemoryFile::new();
        let descriptor = w.finalize(&mut file, codec()).unwrap().unwrap();

        let reader = XattrReader::load(&file, codec(), descriptor, 0, file.get_size()).unwrap();
        let set = reader.read_set(0).unwrap();
        assert_eq!(set[0], ("user.comment".to_string(), b"hello".to_vec()));
        assert_eq!(set[1], ("trusted.checksum".to_string(), b"abcdef01".to_vec()));
    }

    #[test]
    fn empty_tree_has_no_xattr_table() {
        let w = XattrWriter::new(codec());
        let mut file = MemoryFile::new();
        assert!(w.finalize(&mut file, codec()).unwrap().is_none());
    }

    #[test]
    fn repeated_long_value_uses_ool_reference() {
        let long_value = b"0123456789abcdef".to_vec();
        let mut w = XattrWriter::new(codec());
        w.add_set(&[("user.a".to_string(), long_value.clone())]).unwrap();
        w.add_set(&[("user.b".to_string(), long_value.clone())]).unwrap();

        let mut file = MemoryFile::new();
        let descriptor = w.finalize(&mut file, codec()).unwrap().unwrap();
        let reader = XattrReader::load(&file, codec(), descriptor, 0, file.get_size()).unwrap();
        assert_eq!(reader.read_set(0).unwrap()[0].1, long_value);
        assert_eq!(reader.read_set(1).unwrap()[0].1, long_value);
    }

    #[test]
    fn rejects_unknown_namespace() {
        let mut w = XattrWriter::new(codec());
        assert!(w.add_set(&[("weird.key".to_string(), vec![1])]).is_err());
    }
}
