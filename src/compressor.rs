//! Codec interface (§4.1): uniform compress/decompress plus option serialization.
//!
//! Back-ends are pluggable behind the [`Compressor`] id and [`CompressionOptions`]; a worker in
//! the block processor owns one [`Codec`] per thread, built via [`Codec::create_copy`] so no
//! back-end state is shared across threads.

use std::io::{Cursor, Read, Write};

use deku::bitvec::{BitVec, Msb0};
use deku::prelude::*;
#[cfg(feature = "gzip")]
use flate2::read::ZlibEncoder;
#[cfg(feature = "gzip")]
use flate2::Compression;
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::read::{XzDecoder, XzEncoder};
#[cfg(feature = "xz")]
use xz2::stream::{Check, Filters, LzmaOptions, MtStreamBuilder};

use crate::error::SqfsError;

/// Compressor back-end identifier, stored verbatim in the super-block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    #[default]
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, compressor: Compressor"
)]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),

    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),

    #[deku(id = "Compressor::Xz")]
    Xz(Xz),

    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),

    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),

    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: XzFilter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u32")]
#[rustfmt::skip]
pub enum XzFilter {
    None     = 0x00,
    X86      = 0x01,
    PowerPC  = 0x02,
    IA64     = 0x04,
    Arm      = 0x08,
    ArmThumb = 0x10,
    Sparc    = 0x20,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Zstd {
    pub compression_level: u32,
}

impl Compressor {
    /// Validate option ranges at config time (§4.1): "gzip level 1-9, zstd 1-22, xz
    /// dict-size power-of-two-or-sum-of-two".
    pub fn validate_options(&self, options: &Option<CompressionOptions>) -> Result<(), SqfsError> {
        match (self, options) {
            (Compressor::Gzip, Some(CompressionOptions::Gzip(g))) => {
                if !(1..=9).contains(&g.compression_level) {
                    return Err(SqfsError::InvalidCompressionOption);
                }
                Ok(())
            },
            (Compressor::Zstd, Some(CompressionOptions::Zstd(z))) => {
                if !(1..=22).contains(&z.compression_level) {
                    return Err(SqfsError::InvalidCompressionOption);
                }
                Ok(())
            },
            (Compressor::Xz, Some(CompressionOptions::Xz(_))) => Ok(()),
            (_, None) => Ok(()),
            (c, Some(_)) => {
                tracing::warn!(?c, "compression options do not match selected compressor");
                Err(SqfsError::InvalidCompressionOption)
            },
        }
    }
}

/// A per-worker codec instance. Cloning is cheap since the only state carried is configuration;
/// `create_copy` exists as a distinct call so the concurrency model (§5) can give every worker
/// thread its own instance without relying on `Clone`'s implicit semantics elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pub id: Compressor,
    pub options: Option<CompressionOptions>,
}

impl Codec {
    pub fn new(id: Compressor, options: Option<CompressionOptions>) -> Result<Self, SqfsError> {
        id.validate_options(&options)?;
        Ok(Self { id, options })
    }

    /// One instance per worker thread; back-ends here hold no mutable shared state so this is a
    /// plain copy, but the call exists to mark the concurrency boundary explicitly.
    pub fn create_copy(&self) -> Self {
        *self
    }

    /// `do_block`: compress `input`, returning `None` when the codec produced no smaller output
    /// (the incompressible case — caller stores the block uncompressed).
    #[instrument(skip_all)]
    pub fn do_block(&self, input: &[u8]) -> Result<Option<Vec<u8>>, SqfsError> {
        let out = compress(input, self.id, &self.options)?;
        if out.len() < input.len() {
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip_all)]
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, SqfsError> {
        let mut out = Vec::new();
        decompress(input, &mut out, self.id)?;
        Ok(out)
    }

    /// Serialize `self.options` as the compressor-options block that follows the super-block when
    /// `COMPRESSOR_OPTIONS` is set (§4.1). Returns `None` when there is nothing to write (no
    /// options configured, or the `None` compressor, which never carries one).
    pub fn write_options(&self) -> Result<Option<Vec<u8>>, SqfsError> {
        match (self.id, &self.options) {
            (Compressor::None, _) | (_, None) => Ok(None),
            (id, Some(options)) => {
                let mut bits: BitVec<u8, Msb0> = BitVec::new();
                options.write(&mut bits, (deku::ctx::Endian::Little, id))?;
                Ok(Some(bits.into_vec()))
            },
        }
    }

    /// Parse a compressor-options block read from just after the super-block.
    pub fn read_options(id: Compressor, bytes: &[u8]) -> Result<Self, SqfsError> {
        if bytes.is_empty() || matches!(id, Compressor::None) {
            return Codec::new(id, None);
        }
        let mut cursor = Cursor::new(bytes);
        let mut reader = deku::reader::Reader::new(&mut cursor);
        let options =
            CompressionOptions::from_reader_with_ctx(&mut reader, (deku::ctx::Endian::Little, id))?;
        Codec::new(id, Some(options))
    }
}

/// Using the given compressor, decompress bytes.
#[instrument(skip_all)]
pub(crate) fn decompress(
    bytes: &[u8],
    out: &mut Vec<u8>,
    compressor: Compressor,
) -> Result<(), SqfsError> {
    match compressor {
        Compressor::None => {
            out.extend_from_slice(bytes);
        },
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            let mut decoder = zune_inflate::DeflateDecoder::new(bytes);
            let decompressed_data = decoder
                .decode_zlib()
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            out.write_all(&decompressed_data)?;
        },
        #[cfg(feature = "xz")]
        Compressor::Xz | Compressor::Lzma => {
            let mut decoder = XzDecoder::new(bytes);
            decoder.read_to_end(out)?;
        },
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            out.resize(out.capacity().max(bytes.len() * 8), 0);
            let (decompressed, error) = rust_lzo::LZOContext::decompress_to_slice(bytes, out);
            let out_size = decompressed.len();
            out.truncate(out_size);
            if error != rust_lzo::LZOError::OK {
                return Err(SqfsError::CorruptedHeader("lzo decompression failed"));
            }
        },
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            let mut decoder = zstd::bulk::Decompressor::new()
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            let buf = decoder
                .decompress(bytes, bytes.len() * 32)
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            out.write_all(&buf)?;
        },
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => {
            let buf = lz4_flex::decompress_size_prepended(bytes)
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            out.write_all(&buf)?;
        },
        _ => return Err(SqfsError::UnsupportedCompression(compressor)),
    }
    Ok(())
}

#[instrument(skip_all)]
pub(crate) fn compress(
    bytes: &[u8],
    compressor: Compressor,
    options: &Option<CompressionOptions>,
) -> Result<Vec<u8>, SqfsError> {
    match (compressor, options) {
        (Compressor::None, _) => Ok(bytes.to_vec()),
        #[cfg(feature = "xz")]
        (Compressor::Xz, option @ (Some(CompressionOptions::Xz(_)) | None)) => {
            let dict_size = match option {
                Some(CompressionOptions::Xz(option)) => option.dictionary_size,
                _ => 1 << 20,
            };
            let mut opts = LzmaOptions::new_preset(6)
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            opts.dict_size(dict_size);

            let mut filters = Filters::new();
            if let Some(CompressionOptions::Xz(xz)) = option {
                match xz.filters {
                    XzFilter::None => {},
                    XzFilter::X86 => {
                        filters.x86();
                    },
                    XzFilter::PowerPC => {
                        filters.powerpc();
                    },
                    XzFilter::IA64 => {
                        filters.ia64();
                    },
                    XzFilter::Arm => {
                        filters.arm();
                    },
                    XzFilter::ArmThumb => {
                        filters.arm_thumb();
                    },
                    XzFilter::Sparc => {
                        filters.sparc();
                    },
                };
            }
            filters.lzma2(&opts);

            let stream = MtStreamBuilder::new()
                .threads(1)
                .filters(filters)
                .check(Check::Crc32)
                .encoder()
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;

            let mut encoder = XzEncoder::new_stream(Cursor::new(bytes), stream);
            let mut buf = vec![];
            encoder.read_to_end(&mut buf)?;
            Ok(buf)
        },
        #[cfg(feature = "gzip")]
        (Compressor::Gzip, option @ (Some(CompressionOptions::Gzip(_)) | None)) => {
            let compression_level = match option {
                Some(CompressionOptions::Gzip(option)) => Compression::new(option.compression_level),
                _ => Compression::best(),
            };

            let mut encoder = ZlibEncoder::new(Cursor::new(bytes), compression_level);
            let mut buf = vec![];
            encoder.read_to_end(&mut buf)?;
            Ok(buf)
        },
        #[cfg(feature = "lzo")]
        (Compressor::Lzo, _) => {
            let mut lzo = rust_lzo::LZOContext::new();
            let mut buf = vec![0; rust_lzo::worst_compress(bytes.len())];
            let error = lzo.compress(bytes, &mut buf);
            if error != rust_lzo::LZOError::OK {
                return Err(SqfsError::CompressorError("lzo compression failed".into()));
            }
            Ok(buf)
        },
        #[cfg(feature = "zstd")]
        (Compressor::Zstd, option @ (Some(CompressionOptions::Zstd(_)) | None)) => {
            let compression_level = match option {
                Some(CompressionOptions::Zstd(option)) => option.compression_level,
                _ => 3,
            };
            let mut encoder = zstd::bulk::Compressor::new(compression_level as i32)
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            let buf = encoder
                .compress(bytes)
                .map_err(|e| SqfsError::CompressorError(e.to_string()))?;
            Ok(buf)
        },
        #[cfg(feature = "lz4")]
        (Compressor::Lz4, _) => Ok(lz4_flex::compress_prepend_size(bytes)),
        _ => Err(SqfsError::UnsupportedCompression(compressor)),
    }
}

/// CRC-32 checksum used as half of a block's dedup [`crate::block_processor::Signature`].
pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn xz_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = compress(&data, Compressor::Xz, &None).unwrap();
        let mut out = vec![];
        decompress(&compressed, &mut out, Compressor::Xz).unwrap();
        assert_eq!(data, out);
    }

    #[test]
    fn none_round_trip() {
        let data = b"raw bytes".to_vec();
        let compressed = compress(&data, Compressor::None, &None).unwrap();
        assert_eq!(data, compressed);
    }

    #[test]
    fn gzip_level_validation() {
        let opts = Some(CompressionOptions::Gzip(Gzip {
            compression_level: 12,
            window_size: 15,
            strategies: 0,
        }));
        assert!(Compressor::Gzip.validate_options(&opts).is_err());
    }
}
