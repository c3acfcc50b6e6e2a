//! Errors

use std::{io, string};

use thiserror::Error;

use crate::compressor::Compressor;

/// Errors generated from the library
#[derive(Error, Debug)]
pub enum SqfsError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("allocation failed")]
    Alloc,

    #[error("offset {0:#x} outside of the sanity window [{1:#x}, {2:#x})")]
    OutOfBounds(u64, u64, u64),

    #[error("corrupted or invalid squashfs image: {0}")]
    CorruptedHeader(&'static str),

    #[error("unsupported compressor: {0:?}")]
    UnsupportedCompression(Compressor),

    #[error("unsupported flag bit: {0:#x}")]
    Unsupported(u16),

    #[error("compressor error: {0}")]
    CompressorError(String),

    #[error("invalid state transition: {0}")]
    Sequence(&'static str),

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),

    #[error("block processor cancelled: {0}")]
    Cancelled(String),

    #[error("file not found")]
    FileNotFound,

    #[error("invalid squashfs compression options")]
    InvalidCompressionOption,

    #[error("invalid file path in the squashfs image")]
    InvalidFilePath,

    #[error("file inside squashfs image has no name")]
    UndefinedFileName,

    #[error("file duplicated in squashfs image")]
    DuplicatedFileName,

    #[error("unsupported xattr namespace: {0}")]
    UnsupportedXattrNamespace(String),
}

impl From<SqfsError> for io::Error {
    fn from(value: SqfsError) -> Self {
        use SqfsError::*;
        match value {
            StdIo(io) => io,
            Deku(e) => e.into(),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ OutOfBounds(..) => Self::new(io::ErrorKind::InvalidData, e),
            e @ (Alloc
            | CorruptedHeader(_)
            | UnsupportedCompression(_)
            | Unsupported(_)
            | CompressorError(_)
            | Sequence(_)
            | Internal(_)
            | Cancelled(_)
            | FileNotFound
            | InvalidCompressionOption
            | InvalidFilePath
            | UndefinedFileName
            | DuplicatedFileName
            | UnsupportedXattrNamespace(_)) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
