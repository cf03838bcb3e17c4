// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Projections of document state into the two B+-tree indexes.
//!
//! The by-id tree stores one [`FullDocInfo`] per document id; the by-seq
//! tree stores one [`DocInfo`] keyed by the document's latest update seq.
//! Both trees always contain exactly the same set of documents.

use crate::{
    btree::TreeCodec,
    coding::{DecodeError, EncodeError},
    doc::{read_slice, write_slice, DocId, Revision},
    rev_tree::{DiskRev, RevNode, RevTree, RevValue},
    Slice,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Everything the by-id index knows about one document
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FullDocInfo {
    /// Document id.
    pub id: DocId,

    /// Seq of the latest update to this document.
    pub update_seq: u64,

    /// Whether the winning revision is a deletion.
    pub deleted: bool,

    /// The revision tree.
    pub rev_tree: RevTree,

    /// Sum of all leaf sizes; `None` while any leaf predates size
    /// tracking (healed by compaction).
    pub leafs_size: Option<u64>,
}

impl FullDocInfo {
    /// An empty record for a document that does not exist yet.
    #[must_use]
    pub fn new_empty(id: DocId) -> Self {
        Self {
            id,
            update_seq: 0,
            deleted: false,
            rev_tree: RevTree::new(),
            leafs_size: Some(0),
        }
    }

    /// Projects this record into its by-seq form.
    ///
    /// Leaf revisions are ordered winner first: non-deleted before deleted,
    /// then deeper, then higher rev id. Leaves whose body was dropped
    /// (missing value) carry no seq and are not projected.
    #[must_use]
    pub fn to_doc_info(&self) -> DocInfo {
        let mut revs: Vec<RevInfo> = self
            .rev_tree
            .leaves()
            .into_iter()
            .filter_map(|leaf| match leaf.value {
                RevValue::OnDisk(rev) => Some(RevInfo {
                    rev: leaf.rev,
                    seq: rev.seq,
                    body_ptr: rev.ptr,
                    deleted: rev.deleted,
                }),
                _ => None,
            })
            .collect();

        revs.sort_by(|a, b| {
            (!b.deleted, b.rev.pos, &b.rev.id).cmp(&(!a.deleted, a.rev.pos, &a.rev.id))
        });

        DocInfo {
            id: self.id.clone(),
            high_seq: self.update_seq,
            revs,
        }
    }

    /// The winning revision, if the document has any live leaf.
    #[must_use]
    pub fn winner(&self) -> Option<RevInfo> {
        self.to_doc_info().revs.into_iter().next()
    }

    /// Recomputes `deleted` and `leafs_size` from the revision tree.
    pub(crate) fn refresh_aggregates(&mut self) {
        self.deleted = self.winner().is_none_or(|winner| winner.deleted);
        self.leafs_size = leafs_size(&self.rev_tree);
    }
}

/// Sum of all leaf sizes; `None` propagates from legacy leaves.
pub(crate) fn leafs_size(tree: &RevTree) -> Option<u64> {
    let mut size = Some(0u64);

    for leaf in tree.leaves() {
        if let RevValue::OnDisk(rev) = &leaf.value {
            size = match (size, rev.size) {
                (Some(acc), Some(s)) => Some(acc + s),
                _ => None,
            };
        }
    }

    size
}

/// Metadata of one leaf revision inside a [`DocInfo`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevInfo {
    /// The leaf revision.
    pub rev: Revision,

    /// Seq this revision was written under.
    pub seq: u64,

    /// Pointer to the revision's summary chunk.
    pub body_ptr: u64,

    /// Whether this leaf is a deletion.
    pub deleted: bool,
}

/// The by-seq projection of one document: its leaf revisions only
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DocInfo {
    /// Document id.
    pub id: DocId,

    /// Seq of the latest update (the by-seq key).
    pub high_seq: u64,

    /// Leaf revisions, winner first.
    pub revs: Vec<RevInfo>,
}

/// Reduction of the by-id tree: document counts plus total size
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdReduction {
    /// Documents whose winning revision is live.
    pub not_deleted: u64,

    /// Documents whose winning revision is a deletion.
    pub deleted: u64,

    /// Total size of all leaves, or `None` while any record predates
    /// size tracking.
    pub size: Option<u64>,
}

fn write_opt_u64<W: Write>(writer: &mut W, value: Option<u64>) -> Result<(), EncodeError> {
    match value {
        Some(v) => {
            writer.write_u8(1)?;
            writer.write_u64_varint(v)?;
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

fn read_opt_u64<R: Read>(reader: &mut R) -> Result<Option<u64>, DecodeError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(reader.read_u64_varint()?)),
        tag => Err(DecodeError::InvalidTag(("Option<u64>", tag))),
    }
}

// Node value tags of the serialized revision tree. Historically leaves were
// written in the three-element form (no size); those are still read, but
// every modification rewrites its leaves in the four-element form.
const VALUE_MISSING: u8 = 0;
const VALUE_NO_SIZE: u8 = 1;
const VALUE_WITH_SIZE: u8 = 2;

fn encode_rev_node<W: Write>(node: &RevNode, writer: &mut W) -> Result<(), EncodeError> {
    write_slice(writer, &node.id)?;

    let is_leaf = node.children.is_empty();

    match &node.value {
        RevValue::Missing => writer.write_u8(VALUE_MISSING)?,

        RevValue::OnDisk(rev) => {
            if is_leaf {
                writer.write_u8(VALUE_WITH_SIZE)?;
                writer.write_u8(u8::from(rev.deleted))?;
                writer.write_u64_varint(rev.ptr)?;
                writer.write_u64_varint(rev.seq)?;
                write_opt_u64(writer, rev.size)?;
            } else {
                // interior revisions that still carry a body drop their size
                writer.write_u8(VALUE_NO_SIZE)?;
                writer.write_u8(u8::from(rev.deleted))?;
                writer.write_u64_varint(rev.ptr)?;
                writer.write_u64_varint(rev.seq)?;
            }
        }

        RevValue::InMemory(_) => return Err(EncodeError::NotFlushed),
    }

    writer.write_u64_varint(node.children.len() as u64)?;

    for child in &node.children {
        encode_rev_node(child, writer)?;
    }

    Ok(())
}

fn decode_rev_node<R: Read>(reader: &mut R) -> Result<RevNode, DecodeError> {
    let id = read_slice(reader)?;

    let value = match reader.read_u8()? {
        VALUE_MISSING => RevValue::Missing,
        VALUE_NO_SIZE => {
            let deleted = reader.read_u8()? != 0;
            let ptr = reader.read_u64_varint()?;
            let seq = reader.read_u64_varint()?;
            RevValue::OnDisk(DiskRev {
                deleted,
                ptr,
                seq,
                size: None,
            })
        }
        VALUE_WITH_SIZE => {
            let deleted = reader.read_u8()? != 0;
            let ptr = reader.read_u64_varint()?;
            let seq = reader.read_u64_varint()?;
            let size = read_opt_u64(reader)?;
            RevValue::OnDisk(DiskRev {
                deleted,
                ptr,
                seq,
                size,
            })
        }
        tag => return Err(DecodeError::InvalidTag(("RevValue", tag))),
    };

    #[allow(clippy::cast_possible_truncation)]
    let child_count = reader.read_u64_varint()? as usize;
    let mut children = Vec::with_capacity(child_count);

    for _ in 0..child_count {
        children.push(decode_rev_node(reader)?);
    }

    Ok(RevNode {
        id,
        value,
        children,
    })
}

fn encode_rev_tree<W: Write>(tree: &RevTree, writer: &mut W) -> Result<(), EncodeError> {
    let roots = tree.roots();
    writer.write_u64_varint(roots.len() as u64)?;

    for (start, node) in roots {
        writer.write_u64_varint(*start)?;
        encode_rev_node(node, writer)?;
    }

    Ok(())
}

fn decode_rev_tree<R: Read>(reader: &mut R) -> Result<RevTree, DecodeError> {
    #[allow(clippy::cast_possible_truncation)]
    let root_count = reader.read_u64_varint()? as usize;
    let mut roots = Vec::with_capacity(root_count);

    for _ in 0..root_count {
        let start = reader.read_u64_varint()?;
        roots.push((start, decode_rev_node(reader)?));
    }

    Ok(RevTree::from_roots(roots))
}

/// Codec of the by-id index
pub enum ById {}

impl TreeCodec for ById {
    type Key = DocId;
    type Value = FullDocInfo;
    type Reduction = IdReduction;

    fn encode_key<W: Write>(key: &DocId, writer: &mut W) -> Result<(), EncodeError> {
        write_slice(writer, key)
    }

    fn decode_key<R: Read>(reader: &mut R) -> Result<DocId, DecodeError> {
        read_slice(reader)
    }

    fn encode_entry<W: Write>(
        _key: &DocId,
        info: &FullDocInfo,
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        write_slice(writer, &info.id)?;
        writer.write_u64_varint(info.update_seq)?;
        writer.write_u8(u8::from(info.deleted))?;
        encode_rev_tree(&info.rev_tree, writer)
    }

    fn decode_entry<R: Read>(reader: &mut R) -> Result<(DocId, FullDocInfo), DecodeError> {
        let id = read_slice(reader)?;
        let update_seq = reader.read_u64_varint()?;
        let deleted = reader.read_u8()? != 0;
        let rev_tree = decode_rev_tree(reader)?;

        // leafs_size is not stored; it is re-accumulated from the leaves
        let leafs_size = leafs_size(&rev_tree);

        Ok((
            id.clone(),
            FullDocInfo {
                id,
                update_seq,
                deleted,
                rev_tree,
                leafs_size,
            },
        ))
    }

    fn reduce(entries: &[(DocId, FullDocInfo)]) -> IdReduction {
        let mut out = IdReduction {
            not_deleted: 0,
            deleted: 0,
            size: Some(0),
        };

        for (_, info) in entries {
            if info.deleted {
                out.deleted += 1;
            } else {
                out.not_deleted += 1;
            }

            out.size = match (out.size, info.leafs_size) {
                (Some(acc), Some(s)) => Some(acc + s),
                _ => None,
            };
        }

        out
    }

    fn rereduce(reductions: &[IdReduction]) -> IdReduction {
        let mut out = IdReduction {
            not_deleted: 0,
            deleted: 0,
            size: Some(0),
        };

        for r in reductions {
            out.not_deleted += r.not_deleted;
            out.deleted += r.deleted;

            out.size = match (out.size, r.size) {
                (Some(acc), Some(s)) => Some(acc + s),
                _ => None,
            };
        }

        out
    }

    fn encode_reduction<W: Write>(
        reduction: &IdReduction,
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        writer.write_u64_varint(reduction.not_deleted)?;
        writer.write_u64_varint(reduction.deleted)?;
        write_opt_u64(writer, reduction.size)
    }

    fn decode_reduction<R: Read>(reader: &mut R) -> Result<IdReduction, DecodeError> {
        Ok(IdReduction {
            not_deleted: reader.read_u64_varint()?,
            deleted: reader.read_u64_varint()?,
            size: read_opt_u64(reader)?,
        })
    }
}

/// Codec of the by-seq index
pub enum BySeq {}

fn write_rev_infos<W: Write>(revs: &[&RevInfo], writer: &mut W) -> Result<(), EncodeError> {
    writer.write_u64_varint(revs.len() as u64)?;

    // written in reverse so decoding restores order by prepending
    for info in revs.iter().rev() {
        writer.write_u64_varint(info.rev.pos)?;
        write_slice(writer, &info.rev.id)?;
        writer.write_u64_varint(info.seq)?;
        writer.write_u64_varint(info.body_ptr)?;
    }

    Ok(())
}

fn read_rev_infos<R: Read>(reader: &mut R, deleted: bool) -> Result<Vec<RevInfo>, DecodeError> {
    #[allow(clippy::cast_possible_truncation)]
    let count = reader.read_u64_varint()? as usize;
    let mut out = Vec::with_capacity(count);

    for _ in 0..count {
        let pos = reader.read_u64_varint()?;
        let id = read_slice(reader)?;
        let seq = reader.read_u64_varint()?;
        let body_ptr = reader.read_u64_varint()?;

        out.insert(
            0,
            RevInfo {
                rev: Revision { pos, id },
                seq,
                body_ptr,
                deleted,
            },
        );
    }

    Ok(out)
}

impl TreeCodec for BySeq {
    type Key = u64;
    type Value = DocInfo;
    type Reduction = u64;

    fn encode_key<W: Write>(key: &u64, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(*key)?;
        Ok(())
    }

    fn decode_key<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
        Ok(reader.read_u64_varint()?)
    }

    fn encode_entry<W: Write>(
        _key: &u64,
        info: &DocInfo,
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        writer.write_u64_varint(info.high_seq)?;
        write_slice(writer, &info.id)?;

        let live: Vec<_> = info.revs.iter().filter(|r| !r.deleted).collect();
        let deleted: Vec<_> = info.revs.iter().filter(|r| r.deleted).collect();

        write_rev_infos(&live, writer)?;
        write_rev_infos(&deleted, writer)
    }

    fn decode_entry<R: Read>(reader: &mut R) -> Result<(u64, DocInfo), DecodeError> {
        let high_seq = reader.read_u64_varint()?;
        let id = read_slice(reader)?;

        let mut revs = read_rev_infos(reader, false)?;
        revs.extend(read_rev_infos(reader, true)?);

        Ok((
            high_seq,
            DocInfo {
                id,
                high_seq,
                revs,
            },
        ))
    }

    fn reduce(entries: &[(u64, DocInfo)]) -> u64 {
        entries.len() as u64
    }

    fn rereduce(reductions: &[u64]) -> u64 {
        reductions.iter().sum()
    }

    fn encode_reduction<W: Write>(reduction: &u64, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(*reduction)?;
        Ok(())
    }

    fn decode_reduction<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
        Ok(reader.read_u64_varint()?)
    }
}

/// Codec of the local (non-replicated) docs tree
///
/// Local docs are stored by value with an integer revision; they carry no
/// revision tree and no reduction.
pub enum LocalDocs {}

impl TreeCodec for LocalDocs {
    type Key = DocId;
    type Value = (u64, Slice);
    type Reduction = ();

    fn encode_key<W: Write>(key: &DocId, writer: &mut W) -> Result<(), EncodeError> {
        write_slice(writer, key)
    }

    fn decode_key<R: Read>(reader: &mut R) -> Result<DocId, DecodeError> {
        read_slice(reader)
    }

    fn encode_entry<W: Write>(
        key: &DocId,
        (rev, body): &(u64, Slice),
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        write_slice(writer, key)?;
        writer.write_u64_varint(*rev)?;
        write_slice(writer, body)
    }

    fn decode_entry<R: Read>(reader: &mut R) -> Result<(DocId, (u64, Slice)), DecodeError> {
        let key = read_slice(reader)?;
        let rev = reader.read_u64_varint()?;
        let body = read_slice(reader)?;
        Ok((key, (rev, body)))
    }

    fn reduce(_entries: &[(DocId, (u64, Slice))]) {}

    fn rereduce(_reductions: &[()]) {}

    fn encode_reduction<W: Write>(_reduction: &(), _writer: &mut W) -> Result<(), EncodeError> {
        Ok(())
    }

    fn decode_reduction<R: Read>(_reader: &mut R) -> Result<(), DecodeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rev_tree::{RevPath, RevValue};
    use test_log::test;

    fn sample_info(id: &str, seq: u64, deleted: bool) -> FullDocInfo {
        let leaf = RevValue::OnDisk(DiskRev {
            deleted,
            ptr: 128,
            seq,
            size: Some(64),
        });

        let path = RevPath::from_revs(seq.max(1), &[Slice::from([7u8])], leaf);
        let (tree, _) = RevTree::new().merge(&path, 1_000);

        let leafs_size = super::leafs_size(&tree);

        FullDocInfo {
            id: id.into(),
            update_seq: seq,
            deleted,
            rev_tree: tree,
            leafs_size,
        }
    }

    #[test]
    fn by_id_entry_roundtrip() -> crate::Result<()> {
        let info = sample_info("doc-1", 9, false);

        let mut bytes = vec![];
        ById::encode_entry(&info.id, &info, &mut bytes)?;

        let (key, decoded) = ById::decode_entry(&mut &bytes[..])?;
        assert_eq!(info.id, key);
        assert_eq!(info, decoded);

        Ok(())
    }

    #[test]
    fn by_id_parses_legacy_leaf_width() -> crate::Result<()> {
        // hand-craft an entry whose leaf uses the old three-element form
        let mut bytes = vec![];
        write_slice(&mut bytes, b"doc")?;
        {
            use varint_rs::VarintWriter;
            bytes.write_u64_varint(5)?; // update_seq
        }
        bytes.push(0); // deleted: false
        {
            use varint_rs::VarintWriter;
            bytes.write_u64_varint(1)?; // one root
            bytes.write_u64_varint(1)?; // start pos
        }
        write_slice(&mut bytes, &[0xAA])?; // rev id
        bytes.push(VALUE_NO_SIZE);
        bytes.push(0); // not deleted
        {
            use varint_rs::VarintWriter;
            bytes.write_u64_varint(640)?; // ptr
            bytes.write_u64_varint(5)?; // seq
            bytes.write_u64_varint(0)?; // no children
        }

        let (_, info) = ById::decode_entry(&mut &bytes[..])?;

        // legacy leaves have no size, which must propagate to the record
        assert_eq!(None, info.leafs_size);

        // re-encoding emits the four-element form
        let mut reencoded = vec![];
        ById::encode_entry(&info.id, &info, &mut reencoded)?;
        let (_, again) = ById::decode_entry(&mut &reencoded[..])?;
        assert_eq!(info, again);
        assert!(reencoded.contains(&VALUE_WITH_SIZE));

        Ok(())
    }

    #[test]
    fn by_seq_entry_roundtrip_preserves_order() -> crate::Result<()> {
        let info = DocInfo {
            id: Slice::from("doc-2"),
            high_seq: 14,
            revs: vec![
                RevInfo {
                    rev: Revision::new(3, [3u8]),
                    seq: 14,
                    body_ptr: 900,
                    deleted: false,
                },
                RevInfo {
                    rev: Revision::new(3, [1u8]),
                    seq: 14,
                    body_ptr: 700,
                    deleted: false,
                },
                RevInfo {
                    rev: Revision::new(2, [2u8]),
                    seq: 11,
                    body_ptr: 500,
                    deleted: true,
                },
            ],
        };

        let mut bytes = vec![];
        BySeq::encode_entry(&info.high_seq, &info, &mut bytes)?;

        let (key, decoded) = BySeq::decode_entry(&mut &bytes[..])?;
        assert_eq!(14, key);
        assert_eq!(info, decoded);

        Ok(())
    }

    #[test]
    fn id_reduction_is_a_monoid() {
        let infos: Vec<_> = (0..10u64)
            .map(|i| {
                let info = sample_info(&format!("doc-{i}"), i + 1, i % 3 == 0);
                (info.id.clone(), info)
            })
            .collect();

        let whole = ById::reduce(&infos);

        let (left, right) = infos.split_at(4);
        let parts = ById::rereduce(&[ById::reduce(left), ById::reduce(right)]);

        assert_eq!(whole, parts);
    }

    #[test]
    fn id_reduction_null_size_propagates() {
        let mut a = sample_info("a", 1, false);
        let b = sample_info("b", 2, false);

        a.leafs_size = None;

        let reduced = ById::reduce(&[(a.id.clone(), a), (b.id.clone(), b)]);
        assert_eq!(None, reduced.size);
    }

    #[test]
    fn winner_prefers_live_then_deep() {
        let live = RevValue::OnDisk(DiskRev {
            deleted: false,
            ptr: 1,
            seq: 1,
            size: Some(1),
        });
        let dead = RevValue::OnDisk(DiskRev {
            deleted: true,
            ptr: 2,
            seq: 2,
            size: Some(1),
        });

        // deleted leaf is deeper, live leaf still wins
        let (tree, _) = RevTree::new().merge(
            &RevPath::from_revs(1, &[Slice::from([1u8])], live),
            1_000,
        );
        let (tree, _) = tree.merge(
            &RevPath::from_revs(
                2,
                &[Slice::from([9u8]), Slice::from([8u8])],
                dead,
            ),
            1_000,
        );

        let info = FullDocInfo {
            id: Slice::from("w"),
            update_seq: 2,
            deleted: false,
            rev_tree: tree,
            leafs_size: Some(2),
        };

        let winner = info.winner().expect("has leaves");
        assert!(!winner.deleted);
        assert_eq!(1, winner.rev.pos);
    }
}
