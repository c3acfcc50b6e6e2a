//! Top-level filesystem facade tying the in-memory [`Tree`] to the packer (§4.10) and reader
//! (§4.11) entry points.
//!
//! The teacher exposes this split as `FilesystemReader`/`FilesystemWriter`, two distinct types
//! joined only by a shared `into_filesystem_writer` conversion. Here one `Filesystem` plays both
//! roles: a tree built by a host-side scanner (out of core scope, §1) or constructed directly via
//! [`Tree::insert`] can be packed, and an existing image can be opened back into the same type, so
//! callers never have to know which path produced the tree they are holding.

use deku::DekuContainerRead;

use crate::block_file::BlockFile;
use crate::config::PackOptions;
use crate::error::SqfsError;
use crate::packer::{pack_filesystem, PackStats};
use crate::reader::read_filesystem;
use crate::squashfs::{SuperBlock, SUPER_BLOCK_SIZE};
use crate::tree::{NodeMeta, Tree};

/// A SquashFS filesystem, either freshly built in memory or read back from an image.
pub struct Filesystem {
    pub tree: Tree,
    /// Set once this instance has been read from or packed to an image; `None` for a tree built
    /// from scratch that has never round-tripped through an on-disk super-block.
    pub super_block: Option<SuperBlock>,
}

impl Filesystem {
    /// Start an empty filesystem rooted at a single directory node.
    pub fn new(root_meta: NodeMeta) -> Self {
        Self { tree: Tree::new(root_meta), super_block: None }
    }

    /// Wrap an already-built [`Tree`] (e.g. assembled by a host directory scanner upstream of this
    /// crate) without an associated on-disk super-block.
    pub fn from_tree(tree: Tree) -> Self {
        Self { tree, super_block: None }
    }

    /// Read a complete SquashFS image back into a [`Filesystem`] (§4.11).
    pub fn from_reader(file: &dyn BlockFile) -> Result<Self, SqfsError> {
        let (tree, super_block) = read_filesystem(file)?;
        Ok(Self { tree, super_block: Some(super_block) })
    }

    /// Serialize this filesystem to `output` as a complete image (§4.10), recording the produced
    /// super-block for later inspection.
    pub fn pack(
        &mut self,
        options: &PackOptions,
        mod_time: u32,
        output: &mut dyn BlockFile,
    ) -> Result<PackStats, SqfsError> {
        let stats = pack_filesystem(&mut self.tree, options, mod_time, output)?;
        // pack_filesystem writes the final super-block in place; re-read it so callers of `pack`
        // can inspect the same fields a round trip through `from_reader` would give them.
        let mut sb_bytes = [0u8; SUPER_BLOCK_SIZE as usize];
        output.read_at(0, &mut sb_bytes)?;
        let (_, sb) = SuperBlock::from_bytes((&sb_bytes, 0))?;
        self.super_block = Some(sb);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::block_file::MemoryFile;
    use crate::compressor::Compressor;
    use crate::tree::NodeKind;
    use std::io::Cursor;

    fn dir_meta() -> NodeMeta {
        NodeMeta { permissions: 0o755, uid: 0, gid: 0, mtime: 0 }
    }

    fn meta() -> NodeMeta {
        NodeMeta { permissions: 0o644, uid: 0, gid: 0, mtime: 0 }
    }

    #[test]
    fn pack_then_reopen_round_trips() {
        let mut fs = Filesystem::new(dir_meta());
        let root = fs.tree.root();
        fs.tree
            .insert(
                root,
                b"hi.txt".to_vec(),
                meta(),
                vec![],
                NodeKind::File { reader: Box::new(Cursor::new(b"hi".to_vec())), size_hint: None },
            )
            .unwrap();

        let options = PackOptions::new(Compressor::Xz, None, 4096).unwrap().with_worker_count(1);
        let mut image = MemoryFile::new();
        fs.pack(&options, 0, &mut image).unwrap();
        assert!(fs.super_block.is_some());

        let reopened = Filesystem::from_reader(&image).unwrap();
        let root2 = reopened.tree.root();
        assert!(reopened.tree.find_child(root2, b"hi.txt").is_some());
    }
}
