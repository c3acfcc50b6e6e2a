#![doc = include_str!("../README.md")]

pub mod block_file;
pub mod block_processor;
mod compare;
pub mod compressor;
pub mod config;
mod dir;
pub mod error;
pub mod filesystem;
mod fragment;
mod id;
mod inode;
pub mod metadata;
mod packer;
mod reader;
pub mod squashfs;
pub mod table;
mod tree;
mod xattr;

pub use crate::compare::{compare_contents, CompareResult, COMPARE_WINDOW};
pub use crate::config::PackOptions;
pub use crate::error::SqfsError;
pub use crate::filesystem::Filesystem;
pub use crate::fragment::{Fragment, FragmentTable};
pub use crate::id::{Id, IdTable};
pub use crate::packer::{pack_filesystem, PackStats};
pub use crate::squashfs::{ExportEntry, Flags, SuperBlock};
pub use crate::tree::{NodeHandle, NodeKind, NodeMeta, Tree};
