//! Image packer (§4.7, §4.8, §4.10): walks a [`Tree`], pushes regular-file content through the
//! concurrent [`BlockProcessor`], then serializes every inode and directory page and assembles the
//! full on-disk image.
//!
//! Replaces the teacher's `data.rs`/`entry.rs`/`writer.rs` trio (which write blocks serially, one
//! file at a time, with no checksum/dedup machinery) with a two-pass design: pass one drives file
//! content through [`BlockProcessor`] and resolves block-run/fragment deduplication (§4.7); pass
//! two walks the tree again, now purely in memory, to build inodes and directory pages bottom-up
//! so a directory entry can always record its child's already-known inode reference (§4.8). Image
//! assembly order (super-block, compressor options, data, then every table) follows §4.10 and
//! `lib/sqfshelper/writer.c` of the original implementation.

use std::collections::HashMap;
use std::io::Read;

use deku::bitvec::{BitVec, Msb0};
use deku::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

use crate::block_file::BlockFile;
use crate::block_processor::{signature, BlockFlag, BlockFlags, BlockLocation, BlockProcessor, DedupTable};
use crate::compressor::{crc32, Compressor};
use crate::config::PackOptions;
use crate::dir::{build_pages, DirectoryIndex, PendingEntry};
use crate::error::SqfsError;
use crate::fragment::{Fragment, FragmentTable};
use crate::id::IdTable;
use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicIpc, BasicSymlink, BlockSize,
    ExtendedDeviceSpecialFile, ExtendedDirectory, ExtendedFile, ExtendedIpc, ExtendedSymlink,
    Inode, InodeHeader, InodeId, InodeInner, NO_FRAGMENT, NO_XATTR,
};
use crate::metadata::MetaWriter;
use crate::squashfs::{ExportEntry, Flags, SuperBlock, NO_TABLE, SUPER_BLOCK_SIZE};
use crate::table::write_table;
use crate::tree::{NodeHandle, NodeKind, Tree, NO_PARENT};
use crate::xattr::XattrWriter;

/// Everything pass one learns about one regular file, threaded into pass two without re-reading
/// the file's content.
#[derive(Debug, Clone)]
struct FilePackResult {
    blocks_start: u64,
    frag_index: u32,
    frag_block_offset: u32,
    file_size: u64,
    block_sizes: Vec<BlockSize>,
    sparse_count: u32,
}

/// Counters surfaced to the caller after a successful pack, mirroring the statistics the teacher's
/// CLI prints at the end of a run (`lib/sqfshelper/statistics.c` of the original implementation).
#[derive(Debug, Clone, Copy, Default)]
pub struct PackStats {
    pub duplicate_blocks: u64,
    pub sparse_blocks: u64,
    pub fragment_duplicates: u64,
    pub inode_count: u32,
    pub fragment_count: u32,
}

struct PackState {
    dedup: DedupTable,
    locations: Vec<BlockLocation>,
    fragment_table: FragmentTable,
    fragment_dedup: FxHashMap<u64, (u32, u32)>,
    fragment_buffer: Vec<u8>,
    fragment_index: u32,
    block_size: u32,
    stats: PackStats,
}

impl PackState {
    /// Append `tail` (a file's sub-block-size leftover) to the current fragment block, rotating it
    /// out through the block processor first if it would overflow, or reusing an identical tail
    /// already seen anywhere in the image (§4.7 fragment dedup).
    fn submit_fragment(
        &mut self,
        processor: &BlockProcessor,
        output: &mut dyn BlockFile,
        tail: &[u8],
    ) -> Result<(u32, u32), SqfsError> {
        let sig = signature(tail.len() as u32, crc32(tail));
        if let Some(&loc) = self.fragment_dedup.get(&sig) {
            self.stats.fragment_duplicates += 1;
            return Ok(loc);
        }
        if self.fragment_buffer.len() + tail.len() > self.block_size as usize {
            self.rotate_fragment(processor, output)?;
        }
        let offset = self.fragment_buffer.len() as u32;
        let index = self.fragment_index;
        self.fragment_buffer.extend_from_slice(tail);
        self.fragment_dedup.insert(sig, (index, offset));
        Ok((index, offset))
    }

    /// Flush the current fragment accumulator block through the processor, if non-empty.
    fn rotate_fragment(&mut self, processor: &BlockProcessor, output: &mut dyn BlockFile) -> Result<(), SqfsError> {
        if self.fragment_buffer.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.fragment_buffer);
        let index = self.fragment_index;
        processor.submit(payload, BlockFlags::new(&[BlockFlag::IsFragment]), index as u64)?;
        let result = processor
            .commit_next(output)?
            .ok_or(SqfsError::Internal("fragment commit missing"))?;
        self.fragment_table.set(
            index,
            Fragment::new(result.location.offset, result.location.on_disk_size, result.location.compressed),
        );
        self.fragment_index = self.fragment_table.next_index();
        Ok(())
    }
}

/// Push one file's content through the block processor, resolve its blocks-start (new write,
/// whole-run dedup collapse, or all-sparse), and route any partial tail to the fragment
/// accumulator (§4.7).
fn pack_file(
    processor: &BlockProcessor,
    state: &mut PackState,
    output: &mut dyn BlockFile,
    data: &[u8],
) -> Result<FilePackResult, SqfsError> {
    let block_size = state.block_size as u64;
    let file_size = data.len() as u64;
    let n_full_blocks = (file_size / block_size) as usize;
    let tail_len = (file_size % block_size) as usize;

    let file_byte_start = output.get_size();
    let file_global_start = state.locations.len();

    let mut block_sizes: Vec<BlockSize> = vec![BlockSize::sparse(); n_full_blocks];
    let mut nonsparse_indices = Vec::new();
    let mut sparse_count = 0u32;

    for i in 0..n_full_blocks {
        let chunk = &data[i * block_size as usize..(i + 1) * block_size as usize];
        if chunk.iter().all(|&b| b == 0) {
            sparse_count += 1;
            continue;
        }
        nonsparse_indices.push(i);
        processor.submit(chunk.to_vec(), BlockFlags::NONE, i as u64)?;
    }

    let mut first_block_seen_before = false;
    for (n, &i) in nonsparse_indices.iter().enumerate() {
        let result = processor
            .commit_next(output)?
            .ok_or(SqfsError::Internal("block processor drained early"))?;
        block_sizes[i] = BlockSize::new(result.location.on_disk_size, result.location.compressed);
        if n == 0 {
            // Checked before this run's own first block is recorded below, so a hit here means an
            // earlier file's block genuinely shares this signature (§4.7 fast path).
            first_block_seen_before = state.dedup.lookup(result.location.signature).is_some();
        }
        state.dedup.record(result.location.signature, result.location);
        state.locations.push(result.location);
    }

    let count = nonsparse_indices.len();
    let blocks_start = if count == 0 {
        0
    } else if sparse_count > 0 {
        // A sparse hole anywhere in the run breaks the contiguous-location invariant the
        // block-run search relies on; keep the fresh write rather than attempt a partial match.
        state.locations[file_global_start].offset
    } else {
        let file_sig: Vec<u64> = state.locations[file_global_start..file_global_start + count]
            .iter()
            .map(|l| l.signature)
            .collect();
        // If this run's first block never occurred anywhere before this file, no earlier run can
        // match it and the full linear scan below is skipped entirely.
        let mut found = None;
        if first_block_seen_before && file_global_start >= count {
            for start in 0..=(file_global_start - count) {
                if state.locations[start..start + count]
                    .iter()
                    .map(|l| l.signature)
                    .eq(file_sig.iter().copied())
                {
                    found = Some(start);
                    break;
                }
            }
        }
        match found {
            Some(i) => {
                let blocks_start = state.locations[i].offset;
                output.truncate(file_byte_start)?;
                state.locations.truncate(file_global_start);
                state.stats.duplicate_blocks += count as u64;
                blocks_start
            },
            None => state.locations[file_global_start].offset,
        }
    };
    state.stats.sparse_blocks += sparse_count as u64;

    let (frag_index, frag_block_offset) = if tail_len > 0 {
        let tail = &data[n_full_blocks * block_size as usize..];
        state.submit_fragment(processor, output, tail)?
    } else {
        (NO_FRAGMENT, 0)
    };

    Ok(FilePackResult {
        blocks_start,
        frag_index,
        frag_block_offset,
        file_size,
        block_sizes,
        sparse_count,
    })
}

/// Pre-order traversal (parent before children; siblings in the tree's already-sorted order).
fn collect_dfs_order(tree: &Tree) -> Vec<NodeHandle> {
    let mut order = Vec::with_capacity(tree.len());
    let mut stack = vec![tree.root()];
    while let Some(h) = stack.pop() {
        order.push(h);
        let mut children: Vec<_> = tree.children(h).to_vec();
        children.reverse();
        stack.extend(children);
    }
    order
}

/// Assign stable 1-based inode numbers in pre-order, once, before any serialization begins (§4.8).
fn assign_inode_numbers(tree: &mut Tree) {
    let order = collect_dfs_order(tree);
    for (i, h) in order.into_iter().enumerate() {
        tree.node_mut(h).inode_number = (i + 1) as u32;
    }
}

/// Pass one: read every regular file's content and push it through the block processor.
fn pack_file_data(
    tree: &mut Tree,
    order: &[NodeHandle],
    processor: &BlockProcessor,
    state: &mut PackState,
    output: &mut dyn BlockFile,
) -> Result<HashMap<NodeHandle, FilePackResult>, SqfsError> {
    let mut results = HashMap::new();
    for &h in order {
        if !matches!(tree.node(h).kind, NodeKind::File { .. }) {
            continue;
        }
        let data = {
            let node = tree.node_mut(h);
            let NodeKind::File { reader, .. } = &mut node.kind else {
                unreachable!()
            };
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            buf
        };
        let result = pack_file(processor, state, output, &data)?;
        results.insert(h, result);
    }
    Ok(results)
}

/// What a directory needs to know about a just-serialized child to build its own entry.
struct ChildEntry {
    name: Vec<u8>,
    inode_number: u32,
    inode_ref: u64,
    entry_type: u16,
}

/// Pass two: bottom-up (children before parent, so a directory always already knows its
/// children's inode references), build and write every inode and directory page (§4.8).
#[allow(clippy::too_many_arguments)]
fn serialize_node(
    tree: &Tree,
    handle: NodeHandle,
    block_size: u32,
    block_log: u16,
    inode_writer: &mut MetaWriter,
    dir_writer: &mut MetaWriter,
    id_table: &mut IdTable,
    xattr_writer: &mut XattrWriter,
    file_results: &HashMap<NodeHandle, FilePackResult>,
    inode_refs: &mut HashMap<u32, u64>,
) -> Result<ChildEntry, SqfsError> {
    let node = tree.node(handle);
    let uid_idx = id_table.intern(node.meta.uid)?;
    let gid_idx = id_table.intern(node.meta.gid)?;
    let xattr_idx = if node.xattrs.is_empty() {
        NO_XATTR
    } else {
        xattr_writer.add_set(&node.xattrs)?
    };

    let (id, inner) = match &node.kind {
        NodeKind::Dir { children } => {
            let mut pending = Vec::with_capacity(children.len());
            for &child in children {
                let entry = serialize_node(
                    tree,
                    child,
                    block_size,
                    block_log,
                    inode_writer,
                    dir_writer,
                    id_table,
                    xattr_writer,
                    file_results,
                    inode_refs,
                )?;
                pending.push(PendingEntry {
                    name: entry.name,
                    inode_ref: entry.inode_ref,
                    inode_number: entry.inode_number,
                    entry_type: entry.entry_type,
                });
            }

            let (dir_block, dir_offset) = dir_writer.position();
            // Real SquashFS directory data carries 3 bytes of fixed overhead even when empty.
            let mut file_size = 3u32;
            let mut dir_index = Vec::new();
            if !pending.is_empty() {
                let mut running_offset = 0u32;
                for (i, page) in build_pages(&pending).into_iter().enumerate() {
                    let bytes = page.to_bytes()?;
                    // The first page needs no index entry; a reader always starts decoding there.
                    if i > 0 {
                        let name = page.entries[0].name.clone();
                        dir_index.push(DirectoryIndex {
                            index: running_offset,
                            start: page.start_block,
                            name_size_minus_one: (name.len().max(1) - 1) as u32,
                            name,
                        });
                    }
                    file_size += bytes.len() as u32;
                    running_offset += bytes.len() as u32;
                    dir_writer.write_all(&bytes)?;
                }
            }

            let dir_child_count =
                children.iter().filter(|&&c| tree.node(c).kind.is_dir()).count() as u32;
            let link_count = 2 + dir_child_count;
            let parent_inode = if node.parent == NO_PARENT {
                node.inode_number
            } else {
                tree.node(node.parent).inode_number
            };

            if xattr_idx == NO_XATTR && file_size <= u16::MAX as u32 && dir_index.is_empty() {
                (
                    InodeId::BasicDirectory,
                    InodeInner::BasicDirectory(BasicDirectory {
                        block_index: dir_block as u32,
                        link_count,
                        file_size: file_size as u16,
                        block_offset: dir_offset,
                        parent_inode,
                    }),
                )
            } else {
                let index_count: u16 = dir_index
                    .len()
                    .try_into()
                    .map_err(|_| SqfsError::Sequence("directory has more than 65535 index pages"))?;
                (
                    InodeId::ExtendedDirectory,
                    InodeInner::ExtendedDirectory(ExtendedDirectory {
                        link_count,
                        file_size,
                        block_index: dir_block as u32,
                        parent_inode,
                        index_count,
                        block_offset: dir_offset,
                        xattr_idx,
                        dir_index,
                    }),
                )
            }
        },
        NodeKind::File { .. } => {
            let result = file_results
                .get(&handle)
                .expect("every file node is packed in pass one before pass two runs");
            if xattr_idx == NO_XATTR
                && result.blocks_start <= u32::MAX as u64
                && result.file_size <= u32::MAX as u64
                && result.sparse_count == 0
            {
                (
                    InodeId::BasicFile,
                    InodeInner::BasicFile(BasicFile {
                        blocks_start: result.blocks_start as u32,
                        frag_index: result.frag_index,
                        block_offset: result.frag_block_offset,
                        file_size: result.file_size as u32,
                        block_sizes: result.block_sizes.clone(),
                    }),
                )
            } else {
                (
                    InodeId::ExtendedFile,
                    InodeInner::ExtendedFile(ExtendedFile {
                        blocks_start: result.blocks_start,
                        file_size: result.file_size,
                        sparse: result.sparse_count as u64,
                        link_count: 1,
                        frag_index: result.frag_index,
                        block_offset: result.frag_block_offset,
                        xattr_idx,
                        block_sizes: result.block_sizes.clone(),
                    }),
                )
            }
        },
        NodeKind::Symlink { target } => {
            if xattr_idx == NO_XATTR {
                (
                    InodeId::BasicSymlink,
                    InodeInner::BasicSymlink(BasicSymlink {
                        link_count: 1,
                        target_size: target.len() as u32,
                        target_path: target.clone(),
                    }),
                )
            } else {
                (
                    InodeId::ExtendedSymlink,
                    InodeInner::ExtendedSymlink(ExtendedSymlink {
                        link_count: 1,
                        target_size: target.len() as u32,
                        target_path: target.clone(),
                        xattr_idx,
                    }),
                )
            }
        },
        NodeKind::CharDevice { device_number } => {
            if xattr_idx == NO_XATTR {
                (
                    InodeId::BasicCharacterDevice,
                    InodeInner::BasicCharacterDevice(BasicDeviceSpecialFile {
                        link_count: 1,
                        device_number: *device_number,
                    }),
                )
            } else {
                (
                    InodeId::ExtendedCharacterDevice,
                    InodeInner::ExtendedCharacterDevice(ExtendedDeviceSpecialFile {
                        link_count: 1,
                        device_number: *device_number,
                        xattr_idx,
                    }),
                )
            }
        },
        NodeKind::BlockDevice { device_number } => {
            if xattr_idx == NO_XATTR {
                (
                    InodeId::BasicBlockDevice,
                    InodeInner::BasicBlockDevice(BasicDeviceSpecialFile {
                        link_count: 1,
                        device_number: *device_number,
                    }),
                )
            } else {
                (
                    InodeId::ExtendedBlockDevice,
                    InodeInner::ExtendedBlockDevice(ExtendedDeviceSpecialFile {
                        link_count: 1,
                        device_number: *device_number,
                        xattr_idx,
                    }),
                )
            }
        },
        NodeKind::Fifo => {
            if xattr_idx == NO_XATTR {
                (InodeId::BasicFifo, InodeInner::BasicFifo(BasicIpc { link_count: 1 }))
            } else {
                (
                    InodeId::ExtendedFifo,
                    InodeInner::ExtendedFifo(ExtendedIpc { link_count: 1, xattr_idx }),
                )
            }
        },
        NodeKind::Socket => {
            if xattr_idx == NO_XATTR {
                (InodeId::BasicSocket, InodeInner::BasicSocket(BasicIpc { link_count: 1 }))
            } else {
                (
                    InodeId::ExtendedSocket,
                    InodeInner::ExtendedSocket(ExtendedIpc { link_count: 1, xattr_idx }),
                )
            }
        },
    };

    let (inode_block, inode_offset) = inode_writer.position();
    let header = InodeHeader {
        permissions: node.meta.permissions,
        uid_idx,
        gid_idx,
        mtime: node.meta.mtime,
        inode_number: node.inode_number,
    };
    let inode = Inode { id, header, inner };

    let mut bits: BitVec<u8, Msb0> = BitVec::new();
    inode.write(&mut bits, (block_size, block_log))?;
    inode_writer.write_all(&bits.into_vec())?;

    let inode_ref = (inode_block << 16) | inode_offset as u64;
    inode_refs.insert(node.inode_number, inode_ref);

    Ok(ChildEntry {
        name: node.name.clone(),
        inode_number: node.inode_number,
        inode_ref,
        entry_type: id.basic_type_tag(),
    })
}

/// Uncompressed-options meta-block header bit (§4.1): this crate never bothers compressing the
/// handful of bytes a compressor's options occupy.
const OPTIONS_UNCOMPRESSED_BIT: u16 = 1 << 15;

/// Pack `tree` into `output` as a complete SquashFS image (§4.10).
#[instrument(skip(tree, options, output))]
pub fn pack_filesystem(
    tree: &mut Tree,
    options: &PackOptions,
    mod_time: u32,
    output: &mut dyn BlockFile,
) -> Result<PackStats, SqfsError> {
    output.write_at(0, &vec![0u8; SUPER_BLOCK_SIZE as usize])?;

    if let Some(opts_bytes) = options.codec.write_options()? {
        let header = (opts_bytes.len() as u16) | OPTIONS_UNCOMPRESSED_BIT;
        let mut framed = Vec::with_capacity(2 + opts_bytes.len());
        framed.extend_from_slice(&header.to_le_bytes());
        framed.extend_from_slice(&opts_bytes);
        let at = output.get_size();
        output.write_at(at, &framed)?;
    }

    let processor = BlockProcessor::new(options.codec.create_copy(), options.worker_count, options.max_backlog);
    let mut state = PackState {
        dedup: DedupTable::new(),
        locations: Vec::new(),
        fragment_table: FragmentTable::new(),
        fragment_dedup: FxHashMap::default(),
        fragment_buffer: Vec::new(),
        fragment_index: 0,
        block_size: options.block_size,
        stats: PackStats::default(),
    };

    let order = collect_dfs_order(tree);
    assign_inode_numbers(tree);
    let file_results = pack_file_data(tree, &order, &processor, &mut state, output)?;
    state.rotate_fragment(&processor, output)?;
    processor.finish()?;

    let inode_table_start = output.get_size();
    let mut inode_writer = MetaWriter::new(options.codec);
    let mut dir_writer = MetaWriter::new(options.codec);
    let mut id_table = IdTable::new();
    let mut xattr_writer = XattrWriter::new(options.codec);
    let mut inode_refs: HashMap<u32, u64> = HashMap::new();

    let root_entry = serialize_node(
        tree,
        tree.root(),
        options.block_size,
        options.block_log,
        &mut inode_writer,
        &mut dir_writer,
        &mut id_table,
        &mut xattr_writer,
        &file_results,
        &mut inode_refs,
    )?;

    inode_writer.flush_block()?;
    let inode_bytes = inode_writer.into_inner();
    output.write_at(inode_table_start, &inode_bytes)?;

    let directory_table_start = output.get_size();
    dir_writer.flush_block()?;
    let dir_bytes = dir_writer.into_inner();
    output.write_at(directory_table_start, &dir_bytes)?;

    let (frag_table_start, frag_count) = state.fragment_table.write(output, options.codec)?;

    let export_table_start = if options.exportable {
        let max_number = tree.len() as u32;
        let mut bytes = Vec::with_capacity(max_number as usize * 8);
        for n in 1..=max_number {
            let r = inode_refs.get(&n).copied().unwrap_or(u64::MAX);
            bytes.extend_from_slice(&ExportEntry(r).0.to_le_bytes());
        }
        Some(write_table(output, options.codec, &bytes)?)
    } else {
        None
    };

    let id_table_start = id_table.write(output, options.codec)?;
    let xattr_table_start = xattr_writer.finalize(output, options.codec)?;

    let bytes_used = output.get_size();
    let padded = bytes_used.div_ceil(options.dev_block_size) * options.dev_block_size;
    if padded > bytes_used {
        output.write_at(padded - 1, &[0u8])?;
    }

    let mut sb = SuperBlock::new(options.codec.id, options.block_size, options.block_log, mod_time);
    sb.inode_count = tree.len() as u32;
    sb.frag_count = frag_count;
    sb.id_count = id_table.len() as u16;
    sb.root_inode = root_entry.inode_ref;
    sb.bytes_used = bytes_used;
    sb.id_table = id_table_start;
    sb.xattr_table = xattr_table_start.unwrap_or(NO_TABLE);
    sb.inode_table = inode_table_start;
    sb.dir_table = directory_table_start;
    sb.frag_table = frag_table_start;
    sb.export_table = export_table_start.unwrap_or(NO_TABLE);

    sb.set_flag(Flags::NoFragments, frag_count == 0);
    sb.set_flag(
        Flags::DataHasBeenDeduplicated,
        state.stats.duplicate_blocks > 0 || state.stats.fragment_duplicates > 0,
    );
    sb.set_flag(Flags::NfsExportTableExists, options.exportable);
    sb.set_flag(Flags::NoXattrsInArchive, xattr_table_start.is_none());
    sb.set_flag(
        Flags::CompressorOptionsPresent,
        options.codec.options.is_some() && options.codec.id != Compressor::None,
    );
    if options.codec.id == Compressor::None {
        sb.set_flag(Flags::InodesStoredUncompressed, true);
        sb.set_flag(Flags::DataBlockStoredUncompressed, true);
        sb.set_flag(Flags::FragmentsStoredUncompressed, true);
        sb.set_flag(Flags::UncompressedIds, true);
        sb.set_flag(Flags::XattrsStoredUncompressed, true);
    }

    output.write_at(0, &sb.to_bytes()?)?;

    debug!(inodes = sb.inode_count, fragments = frag_count, "packed image");

    let mut stats = state.stats;
    stats.inode_count = sb.inode_count;
    stats.fragment_count = frag_count;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::Codec;
    use crate::tree::NodeMeta;
    use std::io::Cursor;

    fn meta() -> NodeMeta {
        NodeMeta { permissions: 0o644, uid: 0, gid: 0, mtime: 0 }
    }

    fn dir_meta() -> NodeMeta {
        NodeMeta { permissions: 0o755, uid: 0, gid: 0, mtime: 0 }
    }

    fn options() -> PackOptions {
        PackOptions::new(Compressor::Xz, None, 4096).unwrap().with_worker_count(2)
    }

    #[test]
    fn packs_small_tree() {
        let mut tree = Tree::new(dir_meta());
        let root = tree.root();
        let file_data = b"hello world".to_vec();
        tree.insert(
            root,
            b"hello.txt".to_vec(),
            meta(),
            vec![],
            NodeKind::File { reader: Box::new(Cursor::new(file_data)), size_hint: None },
        )
        .unwrap();
        tree.insert(
            root,
            b"link".to_vec(),
            meta(),
            vec![],
            NodeKind::Symlink { target: b"hello.txt".to_vec() },
        )
        .unwrap();

        let mut output = MemoryFile::new();
        let stats = pack_filesystem(&mut tree, &options(), 0, &mut output).unwrap();
        assert_eq!(stats.inode_count, 3); // root + file + symlink
        assert!(output.get_size() > SUPER_BLOCK_SIZE);
    }

    #[test]
    fn duplicate_file_content_is_deduplicated() {
        let mut tree = Tree::new(dir_meta());
        let root = tree.root();
        let content = vec![0xabu8; 9000]; // > one 4096 block, forces a multi-block run
        tree.insert(
            root,
            b"a".to_vec(),
            meta(),
            vec![],
            NodeKind::File { reader: Box::new(Cursor::new(content.clone())), size_hint: None },
        )
        .unwrap();
        tree.insert(
            root,
            b"b".to_vec(),
            meta(),
            vec![],
            NodeKind::File { reader: Box::new(Cursor::new(content)), size_hint: None },
        )
        .unwrap();

        let mut output = MemoryFile::new();
        let stats = pack_filesystem(&mut tree, &options(), 0, &mut output).unwrap();
        assert!(stats.duplicate_blocks > 0);
    }

    #[test]
    fn large_directory_gets_index_entries() {
        let mut tree = Tree::new(dir_meta());
        let root = tree.root();
        for i in 0..300u32 {
            tree.insert(
                root,
                format!("f{i:03}").into_bytes(),
                meta(),
                vec![],
                NodeKind::File { reader: Box::new(Cursor::new(Vec::new())), size_hint: None },
            )
            .unwrap();
        }

        let mut output = MemoryFile::new();
        pack_filesystem(&mut tree, &options(), 0, &mut output).unwrap();

        let (read_back, _) = crate::reader::read_filesystem(&output).unwrap();
        let root2 = read_back.root();
        assert_eq!(read_back.children(root2).len(), 300);
    }

    #[test]
    fn all_zero_file_is_sparse() {
        let mut tree = Tree::new(dir_meta());
        let root = tree.root();
        let content = vec![0u8; 8192];
        tree.insert(
            root,
            b"sparse".to_vec(),
            meta(),
            vec![],
            NodeKind::File { reader: Box::new(Cursor::new(content)), size_hint: None },
        )
        .unwrap();

        let mut output = MemoryFile::new();
        let stats = pack_filesystem(&mut tree, &options(), 0, &mut output).unwrap();
        assert_eq!(stats.sparse_blocks, 2);
    }
}
