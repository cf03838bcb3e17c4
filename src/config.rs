// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{event::EventListener, CompressionType, Database};
use std::path::{Path, PathBuf};

/// Default size of the compactor's doc-info buffer in bytes.
pub const DEFAULT_DOC_BUFFER_SIZE: u64 = 524_288;

/// Which points of the commit protocol are fsynced
///
/// Disabling any of these trades durability for speed; with all three
/// enabled a committed header always refers to durable data only.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FsyncOptions {
    /// Fsync before writing a header, so everything the header points at
    /// is durable first.
    pub before_header: bool,

    /// Fsync after writing a header, so the commit itself is durable.
    pub after_header: bool,

    /// Fsync right after opening a database file.
    pub on_file_open: bool,
}

impl Default for FsyncOptions {
    fn default() -> Self {
        Self {
            before_header: true,
            after_header: true,
            on_file_open: true,
        }
    }
}

/// Database configuration
#[derive(Clone)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) fsync: FsyncOptions,
    pub(crate) doc_buffer_size: u64,
    pub(crate) checkpoint_after: Option<u64>,
    pub(crate) compression: CompressionType,
    pub(crate) listener: Option<EventListener>,
}

impl Config {
    /// Creates a config for the database file at `path`, which is created
    /// on open if it does not exist.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),

            fsync: FsyncOptions::default(),
            doc_buffer_size: DEFAULT_DOC_BUFFER_SIZE,
            checkpoint_after: None,

            #[cfg(feature = "lz4")]
            compression: CompressionType::Lz4,

            #[cfg(not(feature = "lz4"))]
            compression: CompressionType::None,

            listener: None,
        }
    }

    /// Sets which commit points are fsynced.
    ///
    /// Default: all of them.
    #[must_use]
    pub fn fsync_options(mut self, fsync: FsyncOptions) -> Self {
        self.fsync = fsync;
        self
    }

    /// Sets how many buffered doc-info bytes the compactor accumulates
    /// before copying a batch of documents.
    ///
    /// Default: 524,288.
    #[must_use]
    pub fn doc_buffer_size(mut self, bytes: u64) -> Self {
        self.doc_buffer_size = bytes;
        self
    }

    /// Sets after how many copied bytes the compactor checkpoints its
    /// header (so an interrupted compaction can resume).
    ///
    /// Default: `doc_buffer_size * 10`.
    #[must_use]
    pub fn checkpoint_after(mut self, bytes: u64) -> Self {
        self.checkpoint_after = Some(bytes);
        self
    }

    /// Sets the compression method for appended terms.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Installs a listener for database events.
    ///
    /// The listener runs on the updater thread; keep it cheap.
    #[must_use]
    pub fn event_listener(mut self, listener: EventListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub(crate) fn effective_checkpoint_after(&self) -> u64 {
        self.checkpoint_after
            .unwrap_or(self.doc_buffer_size.saturating_mul(10))
    }

    /// Opens the database, creating it if needed.
    pub fn open(self) -> crate::Result<Database> {
        Database::open_with(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn checkpoint_default_follows_buffer_size() {
        let config = Config::new("x").doc_buffer_size(1_000);
        assert_eq!(10_000, config.effective_checkpoint_after());

        let config = Config::new("x").doc_buffer_size(1_000).checkpoint_after(123);
        assert_eq!(123, config.effective_checkpoint_after());
    }
}
