//! Thin CLI adapter over [`sqpack::compare_contents`] (§4.12, §4.14): opens two SquashFS images
//! and reports whether their trees are structurally and byte-for-byte equal.

use std::io::Cursor;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sqpack::block_file::DiskFile;
use sqpack::{compare_contents, Filesystem, NodeHandle, NodeKind, NodeMeta, SqfsError, Tree};

/// Compare two SquashFS images by content, ignoring archive layout.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    first: PathBuf,
    second: PathBuf,

    /// Ignore owner (uid/gid) differences
    #[arg(short = 'O', long)]
    ignore_owner: bool,

    /// Ignore permission differences
    #[arg(short = 'P', long)]
    ignore_perms: bool,

    /// Also require modification times to match
    #[arg(short = 'T', long)]
    compare_mtimes: bool,

    /// Silence RUST_LOG output
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if !args.quiet {
        tracing_subscriber::fmt::init();
    }

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("sqfs-cmp: {e}");
            ExitCode::from(2)
        },
    }
}

fn run(args: &Args) -> Result<bool, SqfsError> {
    let mut a = open_image(&args.first)?;
    let mut b = open_image(&args.second)?;
    let (root_a, root_b) = (a.tree.root(), b.tree.root());
    diff_nodes(&mut a.tree, root_a, &mut b.tree, root_b, args)
}

fn open_image(path: &std::path::Path) -> Result<Filesystem, SqfsError> {
    let file = std::fs::File::open(path)?;
    let disk = DiskFile::new(file)?;
    Filesystem::from_reader(&disk)
}

fn meta_matches(a: &NodeMeta, b: &NodeMeta, args: &Args) -> bool {
    if !args.ignore_perms && a.permissions != b.permissions {
        return false;
    }
    if !args.ignore_owner && (a.uid != b.uid || a.gid != b.gid) {
        return false;
    }
    if args.compare_mtimes && a.mtime != b.mtime {
        return false;
    }
    true
}

/// Recursively compare two nodes (and, for directories, their entire subtrees) for structural and
/// content equality (§4.12).
fn diff_nodes(
    a: &mut Tree,
    ah: NodeHandle,
    b: &mut Tree,
    bh: NodeHandle,
    args: &Args,
) -> Result<bool, SqfsError> {
    if !meta_matches(&a.node(ah).meta, &b.node(bh).meta, args) {
        return Ok(false);
    }

    let kinds_match = match (&a.node(ah).kind, &b.node(bh).kind) {
        (NodeKind::Dir { .. }, NodeKind::Dir { .. }) => true,
        (NodeKind::File { .. }, NodeKind::File { .. }) => true,
        (NodeKind::Symlink { target: ta }, NodeKind::Symlink { target: tb }) => ta == tb,
        (NodeKind::CharDevice { device_number: da }, NodeKind::CharDevice { device_number: db }) => da == db,
        (NodeKind::BlockDevice { device_number: da }, NodeKind::BlockDevice { device_number: db }) => da == db,
        (NodeKind::Fifo, NodeKind::Fifo) => true,
        (NodeKind::Socket, NodeKind::Socket) => true,
        _ => false,
    };
    if !kinds_match {
        return Ok(false);
    }

    if a.node(ah).kind.is_dir() {
        let a_children = a.children(ah).to_vec();
        let b_children = b.children(bh).to_vec();
        if a_children.len() != b_children.len() {
            return Ok(false);
        }
        for (&ac, &bc) in a_children.iter().zip(b_children.iter()) {
            if a.node(ac).name != b.node(bc).name {
                return Ok(false);
            }
            if !diff_nodes(a, ac, b, bc, args)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    if matches!(a.node(ah).kind, NodeKind::File { .. }) {
        let (content_a, size_a) = read_file_node(a, ah)?;
        let (content_b, size_b) = read_file_node(b, bh)?;
        let result = compare_contents(Cursor::new(content_a), size_a, Cursor::new(content_b), size_b)?;
        return Ok(result.is_equal());
    }

    Ok(true)
}

fn read_file_node(tree: &mut Tree, handle: NodeHandle) -> Result<(Vec<u8>, u64), SqfsError> {
    use std::io::Read;
    let NodeKind::File { reader, size_hint } = &mut tree.node_mut(handle).kind else {
        unreachable!("caller only calls this for file nodes")
    };
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let size = size_hint.unwrap_or(buf.len() as u64);
    Ok((buf, size))
}
