// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    Checksum,
};

/// Represents errors that can occur in the document store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress,

    /// Invalid checksum value (got, expected)
    InvalidChecksum((Checksum, Checksum)),

    /// Unsupported or corrupt database header
    ///
    /// Contains the on-disk version tag that was encountered.
    InvalidDiskVersion(u8),

    /// Purges are refused while a compaction is running
    PurgeDuringCompaction,

    /// A single-document write lost against the current revision tree
    ///
    /// Only returned by the single-document convenience wrappers; batch
    /// writes report conflicts per document instead.
    Conflict,

    /// A write carried a malformed revision path
    ///
    /// Replicated writes must name at least one revision, and no revision
    /// path can start above position 1.
    InvalidRevisionPath,

    /// The updater for this database has terminated
    Stopped,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocStoreError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Document store result
pub type Result<T> = std::result::Result<T, Error>;
