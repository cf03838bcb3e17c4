// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    btree::BTree,
    coding::Decode,
    doc::{AttachmentRef, DocSummary, Revision},
    file::DatabaseFile,
    index::{ById, BySeq, DocInfo, FullDocInfo, LocalDocs},
    rev_tree::RevValue,
    Slice,
};
use std::{ops::ControlFlow, sync::Arc};

/// A document read back from a snapshot
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDoc {
    /// The revision that was read.
    pub rev: Revision,

    /// Whether this revision is a deletion.
    pub deleted: bool,

    /// Document body.
    pub body: Slice,

    /// References to the document's attachments.
    pub atts: Vec<AttachmentRef>,
}

/// An immutable view of the database at one point in time
///
/// Snapshots stay valid for as long as they are held: the file is
/// append-only and tree roots are never overwritten. A snapshot taken
/// before a compaction swap keeps the old file alive (unlinked) until it
/// is dropped.
#[derive(Clone)]
pub struct Snapshot {
    pub(crate) fd: Arc<DatabaseFile>,
    pub(crate) by_id: BTree<ById>,
    pub(crate) by_seq: BTree<BySeq>,
    pub(crate) local: BTree<LocalDocs>,
    pub(crate) update_seq: u64,
    pub(crate) committed_update_seq: u64,
    pub(crate) purge_seq: u64,
    pub(crate) revs_limit: u64,
    pub(crate) security: Slice,
    pub(crate) instance_start_time: u64,
    pub(crate) compacting: bool,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("update_seq", &self.update_seq)
            .field("purge_seq", &self.purge_seq)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    /// Seq of the latest update, committed or not.
    #[must_use]
    pub fn update_seq(&self) -> u64 {
        self.update_seq
    }

    /// Largest seq that is durable in the last written header.
    #[must_use]
    pub fn committed_update_seq(&self) -> u64 {
        self.committed_update_seq
    }

    /// Number of purge batches ever applied.
    #[must_use]
    pub fn purge_seq(&self) -> u64 {
        self.purge_seq
    }

    /// Maximum revision tree depth.
    #[must_use]
    pub fn revs_limit(&self) -> u64 {
        self.revs_limit
    }

    /// The opaque security policy blob (empty if never set).
    #[must_use]
    pub fn security(&self) -> &Slice {
        &self.security
    }

    /// Microsecond timestamp taken when this database was opened; clients
    /// use it to detect restarts.
    #[must_use]
    pub fn instance_start_time(&self) -> u64 {
        self.instance_start_time
    }

    /// Whether a compaction was running when this snapshot was taken.
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.compacting
    }

    /// Number of live (non-deleted) documents.
    #[must_use]
    pub fn doc_count(&self) -> u64 {
        self.by_id
            .full_reduce()
            .map_or(0, |reduction| reduction.not_deleted)
    }

    /// Number of deleted documents.
    #[must_use]
    pub fn deleted_doc_count(&self) -> u64 {
        self.by_id
            .full_reduce()
            .map_or(0, |reduction| reduction.deleted)
    }

    /// Total size of all document bodies and attachments, or `None`
    /// while any record predates size tracking.
    #[must_use]
    pub fn data_size(&self) -> Option<u64> {
        self.by_id
            .full_reduce()
            .map_or(Some(0), |reduction| reduction.size)
    }

    /// Looks up everything the by-id index knows about a document.
    pub fn full_doc_info<I: AsRef<[u8]>>(&self, id: I) -> crate::Result<Option<FullDocInfo>> {
        self.by_id.lookup(&Slice::from(id.as_ref()))
    }

    /// Reads the winning revision of a document.
    ///
    /// Returns `None` if the document does not exist or its winning
    /// revision is a deletion.
    pub fn doc<I: AsRef<[u8]>>(&self, id: I) -> crate::Result<Option<StoredDoc>> {
        let Some(info) = self.full_doc_info(id)? else {
            return Ok(None);
        };

        let Some(winner) = info.winner() else {
            return Ok(None);
        };

        if winner.deleted {
            return Ok(None);
        }

        self.read_rev_info(&winner.rev, winner.body_ptr, winner.deleted)
            .map(Some)
    }

    /// Reads one specific leaf revision of a document, deleted or not.
    pub fn doc_rev<I: AsRef<[u8]>>(
        &self,
        id: I,
        rev: &Revision,
    ) -> crate::Result<Option<StoredDoc>> {
        let Some(info) = self.full_doc_info(id)? else {
            return Ok(None);
        };

        let leaf = info
            .rev_tree
            .leaves()
            .into_iter()
            .find(|leaf| leaf.rev == *rev);

        match leaf {
            Some(leaf) => match leaf.value {
                RevValue::OnDisk(disk) => self
                    .read_rev_info(&leaf.rev, disk.ptr, disk.deleted)
                    .map(Some),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn read_rev_info(
        &self,
        rev: &Revision,
        body_ptr: u64,
        deleted: bool,
    ) -> crate::Result<StoredDoc> {
        let bytes = self.fd.pread_term(body_ptr)?;
        let summary = DocSummary::decode_from(&mut &bytes[..])?;

        Ok(StoredDoc {
            rev: rev.clone(),
            deleted,
            body: summary.body,
            atts: summary.atts,
        })
    }

    /// Reads an attachment's payload.
    pub fn read_attachment(&self, att: &AttachmentRef) -> crate::Result<Slice> {
        self.fd.pread_chunk(att.ptr)
    }

    /// Reads a local (non-replicated) document: `(rev, body)`.
    pub fn local_doc<I: AsRef<[u8]>>(&self, id: I) -> crate::Result<Option<(u64, Slice)>> {
        self.local.lookup(&Slice::from(id.as_ref()))
    }

    /// Folds over all changes with seq greater than `since`, in seq order.
    pub fn changes_since<F>(&self, since: u64, f: &mut F) -> crate::Result<()>
    where
        F: FnMut(DocInfo) -> crate::Result<ControlFlow<()>>,
    {
        let start = since + 1;

        self.by_seq
            .fold(Some(&start), &mut |_, info| f(info.clone()))?;

        Ok(())
    }
}
