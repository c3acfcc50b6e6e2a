//! Table write/read helpers (§4.4), grounded in `lib/sqfs/read_table.c` and the `sqfs_write_table`
//! contract of `include/sqfs/table.h` from the original implementation: turn an in-memory byte
//! array into a chain of meta-blocks plus a packed location index, and back.

use tracing::instrument;

use crate::block_file::BlockFile;
use crate::compressor::Codec;
use crate::error::SqfsError;
use crate::metadata::{MetaReader, MetaWriter, METADATA_MAXSIZE};

/// Split `data` into meta-blocks, write them starting at `file`'s current end, then append a
/// packed list of each meta-block's absolute offset. Returns the absolute offset of that list,
/// which is what the super-block or an owning table stores as its "table start".
#[instrument(skip(file, cmp, data))]
pub fn write_table(
    file: &mut dyn BlockFile,
    cmp: Codec,
    data: &[u8],
) -> Result<u64, SqfsError> {
    let blocks_base = file.get_size();

    let mut writer = MetaWriter::new(cmp);
    let mut block_offsets = Vec::new();
    for chunk in data.chunks(METADATA_MAXSIZE) {
        block_offsets.push(blocks_base + writer.len());
        writer.write_all(chunk)?;
        writer.flush_block()?;
    }
    let framed = writer.into_inner();
    file.write_at(blocks_base, &framed)?;

    let list_start = file.get_size();
    let mut list_bytes = Vec::with_capacity(block_offsets.len() * 8);
    for off in &block_offsets {
        list_bytes.extend_from_slice(&off.to_le_bytes());
    }
    file.write_at(list_start, &list_bytes)?;

    Ok(list_start)
}

/// Inverse of [`write_table`]: read the location list at `location` (covering
/// `ceil(table_size / 8192)` eight-byte entries), then read and concatenate the referenced
/// meta-blocks, bounded by `[lower_limit, upper_limit)`.
#[instrument(skip(file, cmp))]
pub fn read_table(
    file: &dyn BlockFile,
    cmp: Codec,
    table_size: usize,
    location: u64,
    lower_limit: u64,
    upper_limit: u64,
) -> Result<Vec<u8>, SqfsError> {
    let block_count = table_size.div_ceil(METADATA_MAXSIZE).max(if table_size == 0 { 0 } else { 1 });

    let mut locations = Vec::with_capacity(block_count);
    for i in 0..block_count {
        let mut buf = [0u8; 8];
        file.read_at(location + (i as u64) * 8, &mut buf)?;
        locations.push(u64::from_le_bytes(buf));
    }

    let mut out = Vec::with_capacity(table_size);
    let mut remaining = table_size;
    for &block_start in &locations {
        let take = remaining.min(METADATA_MAXSIZE);
        let mut reader = MetaReader::new(cmp, 0, lower_limit, upper_limit);
        reader.seek(file, block_start, 0)?;
        let mut chunk = vec![0u8; take];
        reader.read(file, &mut chunk)?;
        out.extend_from_slice(&chunk);
        remaining -= take;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::{Codec, Compressor};

    #[test]
    fn round_trip_multi_block_table() {
        let cmp = Codec::new(Compressor::Xz, None).unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let mut file = MemoryFile::new();
        let location = write_table(&mut file, cmp, &data).unwrap();

        let back = read_table(&file, cmp, data.len(), location, 0, file.get_size()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn empty_table() {
        let cmp = Codec::new(Compressor::Xz, None).unwrap();
        let mut file = MemoryFile::new();
        let location = write_table(&mut file, cmp, &[]).unwrap();
        let back = read_table(&file, cmp, 0, location, 0, file.get_size()).unwrap();
        assert!(back.is_empty());
    }
}
