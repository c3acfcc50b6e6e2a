//! Thin CLI adapter over [`sqpack::Filesystem::pack`] (§4.14): walks a host directory with
//! `std::fs`, builds a [`sqpack::Tree`], and packs it. Directory scanning and argument parsing are
//! out of the library's core scope; this binary exists only to exercise the library surface.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use sqpack::block_file::DiskFile;
use sqpack::compressor::Compressor;
use sqpack::{Filesystem, NodeHandle, NodeKind, NodeMeta, PackStats, SqfsError, Tree};

/// Build a SquashFS image from a directory tree.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Directory to pack
    source: PathBuf,
    /// Output image path
    output: PathBuf,

    /// Compressor: gzip, lzma, lzo, xz, lz4, zstd
    #[arg(short = 'c', long = "comp", default_value = "xz", value_parser = parse_compressor)]
    compressor: Compressor,

    /// Size of compressed data blocks. Supports an optional K or M suffix
    #[arg(short = 'b', long = "block-size", default_value = "128K", value_parser = parse_byte_size)]
    block_size: u32,

    /// Device block size used for FIRST/LAST block alignment
    #[arg(short = 'B', long = "dev-block-size", default_value = "4096", value_parser = parse_byte_size)]
    dev_block_size: u32,

    /// Set every entry's uid to this value instead of the source filesystem's own
    #[arg(long)]
    force_uid: Option<u32>,

    /// Set every entry's gid to this value instead of the source filesystem's own
    #[arg(long)]
    force_gid: Option<u32>,

    /// Emit the NFS export table
    #[arg(long)]
    exportable: bool,

    /// Overwrite an existing output file
    #[arg(short = 'f', long)]
    force: bool,

    /// Silence RUST_LOG output
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn parse_compressor(arg: &str) -> Result<Compressor, &'static str> {
    match arg {
        "gzip" => Ok(Compressor::Gzip),
        "lzma" => Ok(Compressor::Lzma),
        "lzo" => Ok(Compressor::Lzo),
        "xz" => Ok(Compressor::Xz),
        "lz4" => Ok(Compressor::Lz4),
        "zstd" => Ok(Compressor::Zstd),
        _ => Err("invalid compressor! possible values are: gzip, lzma, lzo, xz, lz4, zstd"),
    }
}

fn parse_byte_size(arg: &str) -> Result<u32, String> {
    byte_unit::Byte::from_str(arg)
        .map(|b| b.get_bytes() as u32)
        .map_err(|e| format!("invalid size {arg}: {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();
    if !args.quiet {
        tracing_subscriber::fmt::init();
    }

    match run(&args) {
        Ok(stats) => {
            if !args.quiet {
                eprintln!(
                    "{} inodes, {} duplicate blocks, {} sparse blocks, {} fragment duplicates",
                    stats.inode_count,
                    stats.duplicate_blocks,
                    stats.sparse_blocks,
                    stats.fragment_duplicates
                );
            }
            ExitCode::SUCCESS
        },
        Err(e) => {
            eprintln!("sqfs-mkfs: {e}");
            ExitCode::FAILURE
        },
    }
}

fn run(args: &Args) -> Result<PackStats, SqfsError> {
    let root_stat = fs::metadata(&args.source)?;
    let root_meta = node_meta(&root_stat, args.force_uid, args.force_gid);
    let mut filesystem = Filesystem::new(root_meta);
    let root = filesystem.tree.root();
    scan_dir(&mut filesystem.tree, root, &args.source, args)?;

    let options = sqpack::PackOptions::new(args.compressor, None, args.block_size)?
        .with_dev_block_size(args.dev_block_size as u64)
        .with_exportable(args.exportable);

    let mut open_opts = OpenOptions::new();
    open_opts.write(true).create(true);
    if args.force {
        open_opts.truncate(true);
    } else {
        open_opts.create_new(true);
    }
    let file = open_opts.open(&args.output)?;
    let mut output = DiskFile::new(file)?;

    filesystem.pack(&options, root_stat.mtime() as u32, &mut output)
}

fn node_meta(stat: &fs::Metadata, force_uid: Option<u32>, force_gid: Option<u32>) -> NodeMeta {
    NodeMeta {
        permissions: (stat.mode() & 0xfff) as u16,
        uid: force_uid.unwrap_or_else(|| stat.uid()),
        gid: force_gid.unwrap_or_else(|| stat.gid()),
        mtime: stat.mtime() as u32,
    }
}

/// Recursively walk `path` on the host filesystem, inserting every entry under `parent` in
/// `tree`. Children are visited in directory order and rely on [`Tree::insert`] to keep each
/// directory's child list sorted by name.
fn scan_dir(tree: &mut Tree, parent: NodeHandle, path: &Path, args: &Args) -> Result<(), SqfsError> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let stat = entry.metadata()?;
        let name = entry.file_name().as_bytes().to_vec();
        let meta = node_meta(&stat, args.force_uid, args.force_gid);

        if file_type.is_dir() {
            let handle = tree.insert(parent, name, meta, vec![], NodeKind::Dir { children: vec![] })?;
            scan_dir(tree, handle, &entry.path(), args)?;
        } else if file_type.is_file() {
            let file = File::open(entry.path())?;
            tree.insert(
                parent,
                name,
                meta,
                vec![],
                NodeKind::File { reader: Box::new(file), size_hint: Some(stat.len()) },
            )?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            tree.insert(
                parent,
                name,
                meta,
                vec![],
                NodeKind::Symlink { target: target_bytes(&target) },
            )?;
        } else if file_type.is_block_device() {
            tree.insert(parent, name, meta, vec![], NodeKind::BlockDevice { device_number: stat.rdev() as u32 })?;
        } else if file_type.is_char_device() {
            tree.insert(parent, name, meta, vec![], NodeKind::CharDevice { device_number: stat.rdev() as u32 })?;
        } else if file_type.is_fifo() {
            tree.insert(parent, name, meta, vec![], NodeKind::Fifo)?;
        } else if file_type.is_socket() {
            tree.insert(parent, name, meta, vec![], NodeKind::Socket)?;
        }
    }
    Ok(())
}

fn target_bytes(path: &Path) -> Vec<u8> {
    OsStr::as_bytes(path.as_os_str()).to_vec()
}
