// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::FileId,
    Slice,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// A document id (arbitrary bytes, ordered bytewise)
pub type DocId = Slice;

/// A revision id (hash part of a revision)
pub type RevId = Slice;

/// Reserved id prefix of design documents.
pub const DESIGN_DOC_PREFIX: &[u8] = b"_design/";

/// Reserved id prefix of local (non-replicated) documents.
pub const LOCAL_DOC_PREFIX: &[u8] = b"_local/";

/// Returns `true` if the id names a design document.
#[must_use]
pub fn is_design_doc_id(id: &[u8]) -> bool {
    id.starts_with(DESIGN_DOC_PREFIX)
}

/// Returns `true` if the id names a local (non-replicated) document.
#[must_use]
pub fn is_local_doc_id(id: &[u8]) -> bool {
    id.starts_with(LOCAL_DOC_PREFIX)
}

/// One revision of a document: depth in the edit history plus hash
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Revision {
    /// Depth in the edit history (1-based).
    pub pos: u64,

    /// Revision hash.
    pub id: RevId,
}

impl Revision {
    /// Creates a revision from its parts.
    #[must_use]
    pub fn new<I: Into<RevId>>(pos: u64, id: I) -> Self {
        Self {
            pos,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-", self.pos)?;
        for b in self.id.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Attachment payload: either still in memory, or already appended to a
/// database file
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttachmentData {
    /// Raw bytes, not yet written.
    Inline(Slice),

    /// Already written to the file identified by the owning doc's `atts_fd`.
    OnDisk {
        /// Chunk pointer.
        ptr: u64,

        /// Payload length in bytes.
        len: u64,
    },
}

/// A named document attachment
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Attachment name, unique per document.
    pub name: Slice,

    /// Payload.
    pub data: AttachmentData,
}

/// An incoming document write
///
/// `revs` carries the edit path: for a plain edit the parent revision, for a
/// replicated write the full (possibly stemmed) revision history, newest
/// first. New documents start with `rev_start == 0` and no rev ids.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Doc {
    /// Document id.
    pub id: DocId,

    /// Position of the newest revision in `rev_ids`.
    pub rev_start: u64,

    /// Revision path, newest first.
    pub rev_ids: Vec<RevId>,

    /// Whether this write is a deletion.
    pub deleted: bool,

    /// Document body (opaque bytes).
    pub body: Slice,

    /// Attachments.
    pub atts: Vec<Attachment>,

    /// The open file the attachments were appended to, if any.
    ///
    /// Set during preparation; a mismatch with the live file at flush time
    /// means a compaction swap raced this write and it must be retried.
    pub atts_fd: Option<FileId>,
}

impl Doc {
    /// Creates a brand-new document.
    #[must_use]
    pub fn new<I: Into<DocId>, B: Into<Slice>>(id: I, body: B) -> Self {
        Self {
            id: id.into(),
            rev_start: 0,
            rev_ids: vec![],
            deleted: false,
            body: body.into(),
            atts: vec![],
            atts_fd: None,
        }
    }

    /// Creates an edit of an existing revision.
    #[must_use]
    pub fn update<I: Into<DocId>, B: Into<Slice>>(id: I, parent: &Revision, body: B) -> Self {
        Self {
            id: id.into(),
            rev_start: parent.pos,
            rev_ids: vec![parent.id.clone()],
            deleted: false,
            body: body.into(),
            atts: vec![],
            atts_fd: None,
        }
    }

    /// Creates a deletion of an existing revision.
    #[must_use]
    pub fn delete<I: Into<DocId>>(id: I, parent: &Revision) -> Self {
        Self {
            deleted: true,
            ..Self::update(id, parent, Slice::empty())
        }
    }

    /// Creates a replicated write carrying its full revision path
    /// (newest first).
    #[must_use]
    pub fn replicated<I: Into<DocId>, B: Into<Slice>>(
        id: I,
        rev_start: u64,
        rev_ids: Vec<RevId>,
        body: B,
    ) -> Self {
        Self {
            id: id.into(),
            rev_start,
            rev_ids,
            deleted: false,
            body: body.into(),
            atts: vec![],
            atts_fd: None,
        }
    }

    /// Marks this write as a deletion.
    #[must_use]
    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Adds an in-memory attachment.
    #[must_use]
    pub fn with_attachment<N: Into<Slice>, D: Into<Slice>>(mut self, name: N, data: D) -> Self {
        self.atts.push(Attachment {
            name: name.into(),
            data: AttachmentData::Inline(data.into()),
        });
        self
    }

    /// The newest revision named by this write, if any.
    #[must_use]
    pub fn rev(&self) -> Option<Revision> {
        self.rev_ids
            .first()
            .map(|id| Revision::new(self.rev_start, id.clone()))
    }
}

/// Generates a deterministic revision id for an edit.
///
/// Hashes the parent revision, the deletion flag, the body and the
/// attachment identities, so identical resubmissions produce identical
/// revisions.
#[must_use]
pub fn new_rev_id(parent: Option<&RevId>, deleted: bool, body: &[u8], atts: &[Attachment]) -> RevId {
    use xxhash_rust::xxh3::Xxh3Default;

    let mut hasher = Xxh3Default::new();

    if let Some(parent) = parent {
        hasher.update(parent);
    }

    hasher.update(&[u8::from(deleted)]);
    hasher.update(body);

    for att in atts {
        hasher.update(&att.name);

        let len = match &att.data {
            AttachmentData::Inline(data) => data.len() as u64,
            AttachmentData::OnDisk { len, .. } => *len,
        };
        hasher.update(&len.to_le_bytes());
    }

    hasher.digest128().to_le_bytes().into()
}

/// A reference to an attachment chunk inside a database file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachmentRef {
    /// Attachment name.
    pub name: Slice,

    /// Chunk pointer.
    pub ptr: u64,

    /// Payload length in bytes.
    pub len: u64,
}

/// The serialized form of one revision's content: body bytes plus
/// attachment references
///
/// This is what a rev-tree leaf's body pointer points at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DocSummary {
    /// Document body.
    pub body: Slice,

    /// Attachment references.
    pub atts: Vec<AttachmentRef>,
}

impl Encode for DocSummary {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.body.len() as u64)?;
        writer.write_all(&self.body)?;

        writer.write_u64_varint(self.atts.len() as u64)?;

        for att in &self.atts {
            writer.write_u64_varint(att.name.len() as u64)?;
            writer.write_all(&att.name)?;
            writer.write_u64_varint(att.ptr)?;
            writer.write_u64_varint(att.len)?;
        }

        Ok(())
    }
}

impl Decode for DocSummary {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let body = read_slice(reader)?;

        #[allow(clippy::cast_possible_truncation)]
        let att_count = reader.read_u64_varint()? as usize;
        let mut atts = Vec::with_capacity(att_count);

        for _ in 0..att_count {
            let name = read_slice(reader)?;
            let ptr = reader.read_u64_varint()?;
            let len = reader.read_u64_varint()?;
            atts.push(AttachmentRef { name, ptr, len });
        }

        Ok(Self { body, atts })
    }
}

/// The `(id, revs)` pairs removed by the most recent purge, as referenced by
/// the header's purged-docs pointer
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PurgedDocs(pub Vec<(DocId, Vec<Revision>)>);

impl Encode for PurgedDocs {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.0.len() as u64)?;

        for (id, revs) in &self.0 {
            writer.write_u64_varint(id.len() as u64)?;
            writer.write_all(id)?;
            writer.write_u64_varint(revs.len() as u64)?;

            for rev in revs {
                writer.write_u64_varint(rev.pos)?;
                writer.write_u64_varint(rev.id.len() as u64)?;
                writer.write_all(&rev.id)?;
            }
        }

        Ok(())
    }
}

impl Decode for PurgedDocs {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let count = reader.read_u64_varint()? as usize;
        let mut pairs = Vec::with_capacity(count);

        for _ in 0..count {
            let id = read_slice(reader)?;

            #[allow(clippy::cast_possible_truncation)]
            let rev_count = reader.read_u64_varint()? as usize;
            let mut revs = Vec::with_capacity(rev_count);

            for _ in 0..rev_count {
                let pos = reader.read_u64_varint()?;
                let rev_id = read_slice(reader)?;
                revs.push(Revision { pos, id: rev_id });
            }

            pairs.push((id, revs));
        }

        Ok(Self(pairs))
    }
}

pub(crate) fn read_slice<R: Read>(reader: &mut R) -> Result<Slice, DecodeError> {
    #[allow(clippy::cast_possible_truncation)]
    let len = reader.read_u64_varint()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf.into())
}

pub(crate) fn write_slice<W: Write>(writer: &mut W, slice: &[u8]) -> Result<(), EncodeError> {
    writer.write_u64_varint(slice.len() as u64)?;
    writer.write_all(slice)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn summary_roundtrip() -> crate::Result<()> {
        let summary = DocSummary {
            body: Slice::from(r#"{"a":1}"#),
            atts: vec![AttachmentRef {
                name: Slice::from("image.png"),
                ptr: 4_242,
                len: 1_000,
            }],
        };

        let bytes = summary.encode_into_vec()?;
        assert_eq!(summary, DocSummary::decode_from(&mut &bytes[..])?);

        Ok(())
    }

    #[test]
    fn purged_docs_roundtrip() -> crate::Result<()> {
        let purged = PurgedDocs(vec![(
            Slice::from("a"),
            vec![Revision::new(3, [1u8, 2, 3])],
        )]);

        let bytes = purged.encode_into_vec()?;
        assert_eq!(purged, PurgedDocs::decode_from(&mut &bytes[..])?);

        Ok(())
    }

    #[test]
    fn rev_id_deterministic() {
        let a = new_rev_id(None, false, b"body", &[]);
        let b = new_rev_id(None, false, b"body", &[]);
        assert_eq!(a, b);

        // parent, deletion flag and body all matter
        assert_ne!(a, new_rev_id(Some(&a), false, b"body", &[]));
        assert_ne!(a, new_rev_id(None, true, b"body", &[]));
        assert_ne!(a, new_rev_id(None, false, b"other", &[]));
    }

    #[test]
    fn rev_display() {
        let rev = Revision::new(2, [0xAB, 0xCD]);
        assert_eq!("2-abcd", rev.to_string());
    }

    #[test]
    fn design_and_local_prefixes() {
        assert!(is_design_doc_id(b"_design/math"));
        assert!(!is_design_doc_id(b"math"));
        assert!(is_local_doc_id(b"_local/checkpoint"));
        assert!(!is_local_doc_id(b"checkpoint"));
    }
}
