//! Configuration surface (§4.13): the knobs a pack operation needs, validated once at
//! construction so the packer itself never has to reject a bad setting mid-stream.
//!
//! The teacher leaves these as loose constructor arguments scattered across `FilesystemWriter`;
//! gathering them into one validated [`PackOptions`] follows the same pattern `squashfs.rs`'s
//! `SuperBlock::validate` uses for the on-disk header.

use crate::compressor::{Codec, CompressionOptions, Compressor};
use crate::error::SqfsError;

pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;
pub const DEFAULT_DEV_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub block_size: u32,
    pub block_log: u16,
    pub codec: Codec,
    pub worker_count: usize,
    pub max_backlog: usize,
    pub dev_block_size: u64,
    pub exportable: bool,
}

impl PackOptions {
    /// Validate and build. `block_size` must be a power of two in `[4096, 1MiB]` (§6); the
    /// chosen compressor's options (if any) are validated by [`Compressor::validate_options`].
    pub fn new(
        compressor: Compressor,
        compression_options: Option<CompressionOptions>,
        block_size: u32,
    ) -> Result<Self, SqfsError> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(SqfsError::CorruptedHeader(
                "block size must be a power of two in [4096, 1048576]",
            ));
        }
        let codec = Codec::new(compressor, compression_options)?;
        let block_log = block_size.trailing_zeros() as u16;
        let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Ok(Self {
            block_size,
            block_log,
            codec,
            worker_count,
            max_backlog: 2 * worker_count.max(1),
            dev_block_size: DEFAULT_DEV_BLOCK_SIZE,
            exportable: false,
        })
    }

    pub fn with_default_block_size(
        compressor: Compressor,
        compression_options: Option<CompressionOptions>,
    ) -> Result<Self, SqfsError> {
        Self::new(compressor, compression_options, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self.max_backlog = 2 * self.worker_count;
        self
    }

    pub fn with_max_backlog(mut self, max_backlog: usize) -> Self {
        self.max_backlog = max_backlog.max(1);
        self
    }

    pub fn with_dev_block_size(mut self, dev_block_size: u64) -> Self {
        self.dev_block_size = dev_block_size;
        self
    }

    pub fn with_exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rejects_non_power_of_two_block_size() {
        assert!(PackOptions::new(Compressor::Xz, None, 5000).is_err());
    }

    #[test]
    fn rejects_out_of_range_block_size() {
        assert!(PackOptions::new(Compressor::Xz, None, 2048).is_err());
        assert!(PackOptions::new(Compressor::Xz, None, 1 << 21).is_err());
    }

    #[test]
    fn default_backlog_scales_with_workers() {
        let opts = PackOptions::new(Compressor::Xz, None, DEFAULT_BLOCK_SIZE)
            .unwrap()
            .with_worker_count(4);
        assert_eq!(opts.max_backlog, 8);
    }
}
