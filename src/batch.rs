// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Grouping of incoming writes into id-sorted work units.
//!
//! The updater merges the grouped lists of coalesced batches id-wise; both
//! sides are id-sorted, so this is a stable two-way merge where runs with
//! identical ids are concatenated (first batch first). Coalescing is a
//! strict optimization: it must never change observable results.

use crate::doc::{Doc, DocId};

/// One document write, tagged with the client it came from and the
/// caller-side index (`ref`) used to correlate its result.
#[derive(Clone, Debug)]
pub struct GroupedDoc {
    pub client: usize,
    pub doc_ref: usize,
    pub doc: Doc,
}

/// A run of writes that all target the same document id.
#[derive(Clone, Debug)]
pub struct DocGroup {
    pub id: DocId,
    pub docs: Vec<GroupedDoc>,
}

/// Sorts writes by id (stably, so a client's edits keep their order) and
/// groups equal-id runs.
pub fn group_alike(docs: Vec<GroupedDoc>) -> Vec<DocGroup> {
    let mut docs = docs;
    docs.sort_by(|a, b| a.doc.id.cmp(&b.doc.id));

    let mut groups: Vec<DocGroup> = vec![];

    for doc in docs {
        match groups.last_mut() {
            Some(group) if group.id == doc.doc.id => group.docs.push(doc),
            _ => groups.push(DocGroup {
                id: doc.doc.id.clone(),
                docs: vec![doc],
            }),
        }
    }

    groups
}

/// Merges two id-sorted group lists, concatenating equal-id runs.
pub fn merge_groups(ours: Vec<DocGroup>, theirs: Vec<DocGroup>) -> Vec<DocGroup> {
    let mut out = Vec::with_capacity(ours.len() + theirs.len());

    let mut ours = ours.into_iter().peekable();
    let mut theirs = theirs.into_iter().peekable();

    loop {
        match (ours.peek(), theirs.peek()) {
            (Some(a), Some(b)) => match a.id.cmp(&b.id) {
                std::cmp::Ordering::Less => {
                    if let Some(group) = ours.next() {
                        out.push(group);
                    }
                }
                std::cmp::Ordering::Greater => {
                    if let Some(group) = theirs.next() {
                        out.push(group);
                    }
                }
                std::cmp::Ordering::Equal => {
                    if let (Some(mut a), Some(b)) = (ours.next(), theirs.next()) {
                        a.docs.extend(b.docs);
                        out.push(a);
                    }
                }
            },
            (Some(_), None) => out.extend(ours.by_ref()),
            (None, Some(_)) => out.extend(theirs.by_ref()),
            (None, None) => break,
        }
    }

    out
}
