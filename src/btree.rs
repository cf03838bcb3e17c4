// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    binary_search::partition_point,
    coding::{DecodeError, EncodeError},
    compression::CompressionType,
    file::DatabaseFile,
    header::TreeState,
};
use byteorder::ReadBytesExt;
use std::{
    io::{Read, Write},
    marker::PhantomData,
    ops::ControlFlow,
    sync::Arc,
};
use varint_rs::{VarintReader, VarintWriter};

// Nodes are split once their encoded entries exceed this size.
const NODE_BYTE_THRESHOLD: usize = 1_279;

/// Entry codec plus reduction scheme of one B+-tree
///
/// Implementations are zero-sized markers; all methods are associated
/// functions so a tree can be generic over its codec without carrying it
/// around at runtime.
pub trait TreeCodec {
    /// Entry key.
    type Key: Ord + Clone + std::fmt::Debug;

    /// Entry value.
    type Value: Clone;

    /// Reduction value aggregated over subtrees.
    type Reduction: Clone + std::fmt::Debug;

    /// Encodes a bare key (used inside pointer nodes).
    fn encode_key<W: Write>(key: &Self::Key, writer: &mut W) -> Result<(), EncodeError>;

    /// Decodes a bare key.
    fn decode_key<R: Read>(reader: &mut R) -> Result<Self::Key, DecodeError>;

    /// Encodes a full entry.
    fn encode_entry<W: Write>(
        key: &Self::Key,
        value: &Self::Value,
        writer: &mut W,
    ) -> Result<(), EncodeError>;

    /// Decodes a full entry.
    fn decode_entry<R: Read>(reader: &mut R) -> Result<(Self::Key, Self::Value), DecodeError>;

    /// Reduces the entries of one leaf node.
    fn reduce(entries: &[(Self::Key, Self::Value)]) -> Self::Reduction;

    /// Combines child reductions.
    fn rereduce(reductions: &[Self::Reduction]) -> Self::Reduction;

    /// Encodes a reduction.
    fn encode_reduction<W: Write>(
        reduction: &Self::Reduction,
        writer: &mut W,
    ) -> Result<(), EncodeError>;

    /// Decodes a reduction.
    fn decode_reduction<R: Read>(reader: &mut R) -> Result<Self::Reduction, DecodeError>;
}

enum Node<C: TreeCodec> {
    Leaf(Vec<(C::Key, C::Value)>),

    /// Pointer entries: (last key of subtree, subtree pointer, subtree
    /// reduction), sorted by key.
    Inner(Vec<(C::Key, u64, C::Reduction)>),
}

enum Op<V> {
    Insert(V),
    Remove,
}

/// An append-only, copy-on-write B+-tree
///
/// Modifications rewrite the touched nodes at the end of the file and
/// update the in-memory root; nothing becomes visible to other openers
/// until the root is committed through a header. Old roots remain readable
/// forever (until compaction), which is what makes snapshots free.
pub struct BTree<C: TreeCodec> {
    fd: Arc<DatabaseFile>,
    compression: CompressionType,
    root: Option<(u64, C::Reduction)>,
    phantom: PhantomData<C>,
}

impl<C: TreeCodec> Clone for BTree<C> {
    fn clone(&self) -> Self {
        Self {
            fd: self.fd.clone(),
            compression: self.compression,
            root: self.root.clone(),
            phantom: PhantomData,
        }
    }
}

impl<C: TreeCodec> std::fmt::Debug for BTree<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BTree(root={:?})",
            self.root.as_ref().map(|(ptr, _)| ptr),
        )
    }
}

impl<C: TreeCodec> BTree<C> {
    /// Opens a tree from its serialized state.
    pub fn open(
        fd: Arc<DatabaseFile>,
        state: Option<&TreeState>,
        compression: CompressionType,
    ) -> crate::Result<Self> {
        let root = match state {
            Some(state) => {
                let reduction = C::decode_reduction(&mut &state.reduction[..])?;
                Some((state.root, reduction))
            }
            None => None,
        };

        Ok(Self {
            fd,
            compression,
            root,
            phantom: PhantomData,
        })
    }

    /// Serializes the tree's root state for inclusion in a header.
    pub fn state(&self) -> crate::Result<Option<TreeState>> {
        self.root
            .as_ref()
            .map(|(root, reduction)| {
                let mut bytes = vec![];
                C::encode_reduction(reduction, &mut bytes)?;
                Ok(TreeState {
                    root: *root,
                    reduction: bytes,
                })
            })
            .transpose()
    }

    /// Whether the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The reduction over the whole tree, if it is non-empty.
    #[must_use]
    pub fn full_reduce(&self) -> Option<C::Reduction> {
        self.root.as_ref().map(|(_, reduction)| reduction.clone())
    }

    /// Looks up a single key.
    pub fn lookup(&self, key: &C::Key) -> crate::Result<Option<C::Value>> {
        let Some((mut ptr, _)) = self.root else {
            return Ok(None);
        };

        loop {
            match self.read_node(ptr)? {
                Node::Leaf(entries) => {
                    let idx = partition_point(&entries, |(k, _)| k < key);

                    return Ok(entries
                        .into_iter()
                        .nth(idx)
                        .filter(|(k, _)| k == key)
                        .map(|(_, v)| v));
                }
                Node::Inner(kps) => {
                    let idx = partition_point(&kps, |(last_key, _, _)| last_key < key);

                    match kps.into_iter().nth(idx) {
                        Some((_, child, _)) => ptr = child,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Applies a batch of insertions (upserts) and removals.
    ///
    /// Keys must be unique across the whole batch. Removing an absent key
    /// is a no-op.
    pub fn add_remove(
        &mut self,
        inserts: Vec<(C::Key, C::Value)>,
        removes: Vec<C::Key>,
    ) -> crate::Result<()> {
        let mut actions: Vec<(C::Key, Op<C::Value>)> = Vec::with_capacity(
            inserts.len() + removes.len(),
        );

        actions.extend(inserts.into_iter().map(|(k, v)| (k, Op::Insert(v))));
        actions.extend(removes.into_iter().map(|k| (k, Op::Remove)));

        if actions.is_empty() {
            return Ok(());
        }

        actions.sort_by(|(a, _), (b, _)| a.cmp(b));

        let root_ptr = self.root.as_ref().map(|(ptr, _)| *ptr);
        let mut kps = self.modify(root_ptr, &actions)?;

        // collapse multi-node results into a single root
        while kps.len() > 1 {
            kps = self.write_inner_level(kps)?;
        }

        self.root = kps.pop().map(|(_, ptr, reduction)| (ptr, reduction));

        Ok(())
    }

    /// In-order fold over all entries with keys `>= start`.
    pub fn fold<F>(&self, start: Option<&C::Key>, f: &mut F) -> crate::Result<ControlFlow<()>>
    where
        F: FnMut(&C::Key, &C::Value) -> crate::Result<ControlFlow<()>>,
    {
        match self.root {
            Some((ptr, _)) => self.fold_node(ptr, start, f),
            None => Ok(ControlFlow::Continue(())),
        }
    }

    fn fold_node<F>(
        &self,
        ptr: u64,
        start: Option<&C::Key>,
        f: &mut F,
    ) -> crate::Result<ControlFlow<()>>
    where
        F: FnMut(&C::Key, &C::Value) -> crate::Result<ControlFlow<()>>,
    {
        match self.read_node(ptr)? {
            Node::Leaf(entries) => {
                for (key, value) in &entries {
                    if start.is_some_and(|s| key < s) {
                        continue;
                    }

                    if f(key, value)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
            Node::Inner(kps) => {
                for (last_key, child, _) in &kps {
                    // subtrees entirely below the start key can be skipped
                    if start.is_some_and(|s| last_key < s) {
                        continue;
                    }

                    if self.fold_node(*child, start, f)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    // Rewrites the subtree rooted at `ptr`, returning descriptors of the
    // replacement node(s) at the same height.
    fn modify(
        &self,
        ptr: Option<u64>,
        actions: &[(C::Key, Op<C::Value>)],
    ) -> crate::Result<Vec<(C::Key, u64, C::Reduction)>> {
        let node = match ptr {
            Some(ptr) => self.read_node(ptr)?,
            None => Node::Leaf(vec![]),
        };

        match node {
            Node::Leaf(entries) => {
                let merged = merge_actions::<C>(entries, actions);
                self.write_leaf_level(merged)
            }
            Node::Inner(kps) => {
                let mut out: Vec<(C::Key, u64, C::Reduction)> = vec![];
                let mut remaining = actions;

                let last_idx = kps.len().saturating_sub(1);

                for (idx, (last_key, child, reduction)) in kps.into_iter().enumerate() {
                    let split = if idx == last_idx {
                        // leftover actions always go to the rightmost child
                        remaining.len()
                    } else {
                        partition_point(remaining, |(k, _)| k <= &last_key)
                    };

                    let (mine, rest) = remaining.split_at(split);
                    remaining = rest;

                    if mine.is_empty() {
                        out.push((last_key, child, reduction));
                    } else {
                        out.extend(self.modify(Some(child), mine)?);
                    }
                }

                if out.is_empty() {
                    return Ok(vec![]);
                }

                self.write_inner_level(out)
            }
        }
    }

    fn write_leaf_level(
        &self,
        entries: Vec<(C::Key, C::Value)>,
    ) -> crate::Result<Vec<(C::Key, u64, C::Reduction)>> {
        let mut encoded = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            let mut bytes = vec![];
            C::encode_entry(&key, &value, &mut bytes)?;
            encoded.push(((key, value), bytes));
        }

        let mut out = vec![];

        for chunk in chunkify(encoded) {
            let mut payload = vec![0u8]; // leaf tag
            payload.write_u64_varint(chunk.len() as u64)?;

            let mut chunk_entries = Vec::with_capacity(chunk.len());

            for ((key, value), bytes) in chunk {
                payload.extend_from_slice(&bytes);
                chunk_entries.push((key, value));
            }

            let reduction = C::reduce(&chunk_entries);

            let last_key = match chunk_entries.last() {
                Some((key, _)) => key.clone(),
                None => continue,
            };

            let ptr = self.fd.append_chunk(&self.compression.compress(&payload))?;
            out.push((last_key, ptr, reduction));
        }

        Ok(out)
    }

    fn write_inner_level(
        &self,
        kps: Vec<(C::Key, u64, C::Reduction)>,
    ) -> crate::Result<Vec<(C::Key, u64, C::Reduction)>> {
        let mut encoded = Vec::with_capacity(kps.len());

        for (key, ptr, reduction) in kps {
            let mut bytes = vec![];
            C::encode_key(&key, &mut bytes)?;
            bytes.write_u64_varint(ptr)?;
            C::encode_reduction(&reduction, &mut bytes)?;
            encoded.push(((key, ptr, reduction), bytes));
        }

        let mut out = vec![];

        for chunk in chunkify(encoded) {
            let mut payload = vec![1u8]; // inner tag
            payload.write_u64_varint(chunk.len() as u64)?;

            let mut reductions = Vec::with_capacity(chunk.len());
            let mut last_key = None;

            for ((key, _, reduction), bytes) in chunk {
                payload.extend_from_slice(&bytes);
                reductions.push(reduction);
                last_key = Some(key);
            }

            let Some(last_key) = last_key else {
                continue;
            };

            let reduction = C::rereduce(&reductions);
            let ptr = self.fd.append_chunk(&self.compression.compress(&payload))?;
            out.push((last_key, ptr, reduction));
        }

        Ok(out)
    }

    fn read_node(&self, ptr: u64) -> crate::Result<Node<C>> {
        let bytes = self.fd.pread_term(ptr)?;
        let mut reader = &bytes[..];

        let tag = reader.read_u8().map_err(DecodeError::from)?;

        #[allow(clippy::cast_possible_truncation)]
        let count = reader.read_u64_varint().map_err(DecodeError::from)? as usize;

        match tag {
            0 => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(C::decode_entry(&mut reader)?);
                }
                Ok(Node::Leaf(entries))
            }
            1 => {
                let mut kps = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = C::decode_key(&mut reader)?;
                    let ptr = reader.read_u64_varint().map_err(DecodeError::from)?;
                    let reduction = C::decode_reduction(&mut reader)?;
                    kps.push((key, ptr, reduction));
                }
                Ok(Node::Inner(kps))
            }
            tag => Err(DecodeError::InvalidTag(("BTreeNode", tag)).into()),
        }
    }
}

fn merge_actions<C: TreeCodec>(
    entries: Vec<(C::Key, C::Value)>,
    actions: &[(C::Key, Op<C::Value>)],
) -> Vec<(C::Key, C::Value)> {
    let mut out = Vec::with_capacity(entries.len() + actions.len());

    let mut entries = entries.into_iter().peekable();
    let mut actions = actions.iter().peekable();

    loop {
        match (entries.peek(), actions.peek()) {
            (Some((ek, _)), Some((ak, _))) => match ek.cmp(ak) {
                std::cmp::Ordering::Less => {
                    if let Some(entry) = entries.next() {
                        out.push(entry);
                    }
                }
                std::cmp::Ordering::Equal => {
                    let _ = entries.next();

                    match actions.next() {
                        Some((key, Op::Insert(value))) => out.push((key.clone(), value.clone())),
                        _ => {} // removed
                    }
                }
                std::cmp::Ordering::Greater => match actions.next() {
                    Some((key, Op::Insert(value))) => out.push((key.clone(), value.clone())),
                    _ => {} // removing an absent key
                },
            },
            (Some(_), None) => {
                out.extend(entries.by_ref());
            }
            (None, Some(_)) => match actions.next() {
                Some((key, Op::Insert(value))) => out.push((key.clone(), value.clone())),
                _ => {}
            },
            (None, None) => break,
        }
    }

    out
}

fn chunkify<T>(items: Vec<(T, Vec<u8>)>) -> Vec<Vec<(T, Vec<u8>)>> {
    let mut chunks = vec![];
    let mut current: Vec<(T, Vec<u8>)> = vec![];
    let mut current_size = 0;

    for (item, bytes) in items {
        if !current.is_empty() && current_size + bytes.len() > NODE_BYTE_THRESHOLD {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }

        current_size += bytes.len();
        current.push((item, bytes));
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{DecodeError, EncodeError};
    use test_log::test;

    /// u64 -> u64 entries, counting reduction
    enum Counted {}

    impl TreeCodec for Counted {
        type Key = u64;
        type Value = u64;
        type Reduction = u64;

        fn encode_key<W: Write>(key: &u64, writer: &mut W) -> Result<(), EncodeError> {
            writer.write_u64_varint(*key)?;
            Ok(())
        }

        fn decode_key<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
            Ok(reader.read_u64_varint()?)
        }

        fn encode_entry<W: Write>(
            key: &u64,
            value: &u64,
            writer: &mut W,
        ) -> Result<(), EncodeError> {
            writer.write_u64_varint(*key)?;
            writer.write_u64_varint(*value)?;
            Ok(())
        }

        fn decode_entry<R: Read>(reader: &mut R) -> Result<(u64, u64), DecodeError> {
            Ok((reader.read_u64_varint()?, reader.read_u64_varint()?))
        }

        fn reduce(entries: &[(u64, u64)]) -> u64 {
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

    fn test_tree() -> crate::Result<(tempfile::TempDir, BTree<Counted>)> {
        let dir = tempfile::tempdir()?;
        let fd = Arc::new(DatabaseFile::create(dir.path().join("tree"))?);
        let tree = BTree::<Counted>::open(fd, None, CompressionType::None)?;
        Ok((dir, tree))
    }

    #[test]
    fn btree_insert_lookup() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        tree.add_remove(vec![(1, 100), (2, 200), (3, 300)], vec![])?;

        assert_eq!(Some(200), tree.lookup(&2)?);
        assert_eq!(None, tree.lookup(&4)?);
        assert_eq!(Some(3), tree.full_reduce());

        Ok(())
    }

    #[test]
    fn btree_upsert_replaces() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        tree.add_remove(vec![(1, 100)], vec![])?;
        tree.add_remove(vec![(1, 111)], vec![])?;

        assert_eq!(Some(111), tree.lookup(&1)?);
        assert_eq!(Some(1), tree.full_reduce());

        Ok(())
    }

    #[test]
    fn btree_remove() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        tree.add_remove(vec![(1, 100), (2, 200)], vec![])?;
        tree.add_remove(vec![], vec![1])?;

        assert_eq!(None, tree.lookup(&1)?);
        assert_eq!(Some(200), tree.lookup(&2)?);
        assert_eq!(Some(1), tree.full_reduce());

        // removing everything empties the root
        tree.add_remove(vec![], vec![2])?;
        assert!(tree.is_empty());
        assert_eq!(None, tree.full_reduce());

        Ok(())
    }

    #[test]
    fn btree_many_entries_split_nodes() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        let count = 10_000u64;

        // insert in two interleaved batches to exercise the merge path
        tree.add_remove((0..count).step_by(2).map(|i| (i, i * 7)).collect(), vec![])?;
        tree.add_remove(
            (0..count).skip(1).step_by(2).map(|i| (i, i * 7)).collect(),
            vec![],
        )?;

        assert_eq!(Some(count), tree.full_reduce());

        for key in [0, 1, count / 2, count - 1] {
            assert_eq!(Some(key * 7), tree.lookup(&key)?, "key {key}");
        }

        // in-order fold sees every key
        let mut seen = vec![];
        tree.fold(None, &mut |k, _| {
            seen.push(*k);
            Ok(ControlFlow::Continue(()))
        })?;

        assert_eq!((0..count).collect::<Vec<_>>(), seen);

        Ok(())
    }

    #[test]
    fn btree_fold_from_start_key() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        tree.add_remove((0..1_000u64).map(|i| (i, i)).collect(), vec![])?;

        let mut seen = vec![];
        tree.fold(Some(&990), &mut |k, _| {
            seen.push(*k);
            Ok(ControlFlow::Continue(()))
        })?;

        assert_eq!((990..1_000).collect::<Vec<_>>(), seen);

        Ok(())
    }

    #[test]
    fn btree_fold_break_stops() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        tree.add_remove((0..100u64).map(|i| (i, i)).collect(), vec![])?;

        let mut seen = 0;
        let flow = tree.fold(None, &mut |_, _| {
            seen += 1;
            Ok(if seen == 5 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })?;

        assert!(flow.is_break());
        assert_eq!(5, seen);

        Ok(())
    }

    #[test]
    fn btree_state_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let fd = Arc::new(DatabaseFile::create(dir.path().join("tree"))?);

        let state = {
            let mut tree = BTree::<Counted>::open(fd.clone(), None, CompressionType::None)?;
            tree.add_remove((0..500u64).map(|i| (i, i + 1)).collect(), vec![])?;
            tree.state()?.expect("tree is non-empty")
        };

        let tree = BTree::<Counted>::open(fd, Some(&state), CompressionType::None)?;
        assert_eq!(Some(500), tree.full_reduce());
        assert_eq!(Some(43), tree.lookup(&42)?);

        Ok(())
    }

    #[test]
    fn btree_reduction_survives_mutation() -> crate::Result<()> {
        let (_dir, mut tree) = test_tree()?;

        tree.add_remove((0..3_000u64).map(|i| (i, i)).collect(), vec![])?;
        tree.add_remove(vec![], (0..1_000u64).collect())?;

        assert_eq!(Some(2_000), tree.full_reduce());

        Ok(())
    }
}
