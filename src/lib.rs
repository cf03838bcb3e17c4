// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A K.I.S.S. implementation of an append-only, MVCC document database file.
//!
//! Each database is a single file holding two copy-on-write B+-tree indexes
//! (by document id and by update seq), per-document *revision trees* that
//! preserve conflicting edits, and an append-only header record rewritten
//! on every commit. The freshest valid header wins on open, so a crash can
//! only ever lose the un-committed tail, never corrupt committed state.
//!
//! All writes are linearized by a single updater thread per database; a
//! background compactor rewrites the file into a sibling while writes
//! continue, catches up to the moving tail, and atomically swaps files.
//!
//! # Example usage
//!
//! ```
//! use doc_store::{Config, Doc};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(folder.path().join("db.store")).open()?;
//!
//! // every accepted write yields a new revision
//! let rev = db.save_doc(Doc::new("greeting", r#"{"hello":"world"}"#))?;
//!
//! let doc = db.doc("greeting")?.expect("was just written");
//! assert_eq!(&*doc.body, br#"{"hello":"world"}"#.as_slice());
//!
//! // edits name their parent revision
//! let rev2 = db.save_doc(Doc::update("greeting", &rev, r#"{"hello":"moon"}"#))?;
//! assert_eq!(2, rev2.pos);
//!
//! // a stale edit is rejected
//! assert!(db.save_doc(Doc::update("greeting", &rev, "stale")).is_err());
//!
//! // rebuild the file, dropping unreachable data, then swap atomically
//! db.compact()?;
//!
//! assert_eq!(1, db.snapshot()?.doc_count());
//! #
//! # Ok::<(), doc_store::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod batch;
mod binary_search;
mod btree;
mod checksum;
mod coding;
mod compaction;
mod compression;
mod config;
mod db;
mod doc;
mod error;
mod event;

#[doc(hidden)]
pub mod file;

mod header;
mod index;
mod rev_tree;
mod slice;
mod snapshot;
mod updater;

pub use {
    checksum::Checksum,
    coding::{DecodeError, EncodeError},
    compression::CompressionType,
    config::{Config, FsyncOptions, DEFAULT_DOC_BUFFER_SIZE},
    db::{Database, UpdateOptions},
    doc::{
        Attachment, AttachmentData, AttachmentRef, Doc, DocId, RevId, Revision,
        DESIGN_DOC_PREFIX, LOCAL_DOC_PREFIX,
    },
    error::{Error, Result},
    event::{DbEvent, EventListener},
    file::FileId,
    index::{DocInfo, FullDocInfo, RevInfo},
    rev_tree::{DiskRev, Leaf, MergeOutcome, PendingRev, RevNode, RevPath, RevTree, RevValue},
    slice::Slice,
    snapshot::{Snapshot, StoredDoc},
    updater::{PurgeResult, WriteOutcome},
};
