// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The hot path: applying a (possibly coalesced) batch of document writes.
//!
//! Order of operations matters. Everything up to and including the body
//! flush only *appends* to the file and touches no state field, so the
//! attachment-fd retry sentinel can abort the whole batch without leaving
//! anything behind (orphaned chunks are reclaimed by compaction). Only
//! after the flush succeeds are the trees and counters updated.

use super::{commit_data, notify, BatchReply, Command, DbState, UpdateRequest, WriteOutcome};
use crate::{
    batch::{merge_groups, DocGroup},
    doc::{is_design_doc_id, new_rev_id, Doc, DocId, Revision},
    doc::{AttachmentRef, DocSummary},
    event::DbEvent,
    index::FullDocInfo,
    rev_tree::{DiskRev, PendingRev, RevPath, RevValue},
    Slice,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::mpsc::{Receiver, Sender},
};

// A retry aborts the batch without state change; everything else kills the
// actor.
enum PipelineError {
    Retry,
    Fatal(crate::Error),
}

impl From<crate::Error> for PipelineError {
    fn from(value: crate::Error) -> Self {
        Self::Fatal(value)
    }
}

struct ResultSink {
    per_client: Vec<Vec<(usize, WriteOutcome)>>,
}

impl ResultSink {
    fn new(clients: usize) -> Self {
        Self {
            per_client: vec![vec![]; clients],
        }
    }

    fn send(&mut self, client: usize, doc_ref: usize, outcome: WriteOutcome) {
        if let Some(results) = self.per_client.get_mut(client) {
            results.push((doc_ref, outcome));
        }
    }
}

pub(crate) fn update_docs(
    state: &mut DbState,
    req: UpdateRequest,
    rx: &Receiver<Command>,
    pending: &mut VecDeque<Command>,
) -> crate::Result<()> {
    let merge_conflicts = req.merge_conflicts;
    let locals = req.locals;

    let mut clients: Vec<Sender<BatchReply>> = vec![req.reply];
    let mut groups = req.groups;
    let mut full_commit = req.full_commit;

    // (a) Coalescing: greedily drain compatible batches already waiting in
    // the mailbox. Anything else is stashed and handled afterwards in
    // arrival order.
    if locals.is_empty() {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::UpdateDocs(next)
                    if next.merge_conflicts == merge_conflicts && next.locals.is_empty() =>
                {
                    let client = clients.len();
                    clients.push(next.reply);

                    let mut theirs = next.groups;

                    for group in &mut theirs {
                        for doc in &mut group.docs {
                            doc.client = client;
                        }
                    }

                    groups = merge_groups(groups, theirs);
                    full_commit |= next.full_commit;
                }
                other => pending.push_back(other),
            }
        }

        if clients.len() > 1 {
            log::trace!("Coalesced {} write batches", clients.len());
        }
    }

    let mut results = ResultSink::new(clients.len());

    match update_docs_int(
        state,
        groups,
        &locals,
        merge_conflicts,
        full_commit,
        &mut results,
    ) {
        Ok(()) => {
            for (client, results) in clients.iter().zip(results.per_client) {
                let _ = client.send(BatchReply::Done { results });
            }
            Ok(())
        }
        Err(PipelineError::Retry) => {
            log::debug!(
                "Write batch on {} raced a compaction swap, telling clients to retry",
                state.name,
            );

            for client in &clients {
                let _ = client.send(BatchReply::Retry);
            }
            Ok(())
        }
        Err(PipelineError::Fatal(e)) => Err(e),
    }
}

fn update_docs_int(
    state: &mut DbState,
    groups: Vec<DocGroup>,
    locals: &[(usize, Doc)],
    merge_conflicts: bool,
    full_commit: bool,
    results: &mut ResultSink,
) -> Result<(), PipelineError> {
    // (b) old-state lookup
    let mut old_infos = Vec::with_capacity(groups.len());

    for group in &groups {
        let info = state
            .by_id
            .lookup(&group.id)?
            .unwrap_or_else(|| FullDocInfo::new_empty(group.id.clone()));
        old_infos.push(info);
    }

    // (c) + (d): per-doc merge and seq assignment
    let mut seq = state.update_seq;
    let mut new_infos: Vec<FullDocInfo> = vec![];
    let mut remove_seqs: Vec<u64> = vec![];

    for (group, old) in groups.into_iter().zip(old_infos) {
        let old_tree = old.rev_tree.clone();
        let old_winner = old.winner();

        let mut acc = old.rev_tree;
        let mut old_deleted = old.deleted;

        for entry in group.docs {
            let doc = entry.doc;

            let path = RevPath::from_revs(doc.rev_start, &doc.rev_ids, pending_value(&doc));

            if merge_conflicts {
                acc = acc.merge(&path, state.revs_limit).0;
                continue;
            }

            let (merged, outcome) = acc.clone().merge(&path, state.revs_limit);

            use crate::rev_tree::MergeOutcome::{Conflicts, NoConflicts};

            match outcome {
                Conflicts if !old_deleted => {
                    results.send(entry.client, entry.doc_ref, WriteOutcome::Conflict);
                }

                Conflicts if doc.rev_ids.len() > 1 => {
                    // the caller named a parent; accept if that parent is
                    // still an actual leaf
                    let parent = Revision {
                        pos: doc.rev_start - 1,
                        id: doc.rev_ids.get(1).cloned().unwrap_or_default(),
                    };

                    if acc.is_leaf(&parent) {
                        acc = merged;
                        old_deleted = doc.deleted;
                    } else {
                        results.send(entry.client, entry.doc_ref, WriteOutcome::Conflict);
                    }
                }

                Conflicts => {
                    acc = merged;
                    old_deleted = doc.deleted;
                }

                NoConflicts if merged == acc => {
                    // the tree did not change: this revision was already
                    // edited again...
                    if doc.rev_start == 1 && old_deleted {
                        // ...unless we are recreating a previously deleted
                        // document: graft the new edit onto the deletion
                        if let Some(winner) = &old_winner {
                            let new_id =
                                new_rev_id(Some(&winner.rev.id), doc.deleted, &doc.body, &doc.atts);
                            let new_pos = winner.rev.pos + 1;

                            let grafted = RevPath::from_revs(
                                new_pos,
                                &[new_id.clone(), winner.rev.id.clone()],
                                pending_value(&doc),
                            );

                            acc = acc.merge(&grafted, state.revs_limit).0;
                            old_deleted = doc.deleted;

                            results.send(
                                entry.client,
                                entry.doc_ref,
                                WriteOutcome::Ok(Revision {
                                    pos: new_pos,
                                    id: new_id,
                                }),
                            );
                        } else {
                            results.send(entry.client, entry.doc_ref, WriteOutcome::Conflict);
                        }
                    } else {
                        results.send(entry.client, entry.doc_ref, WriteOutcome::Conflict);
                    }
                }

                NoConflicts => {
                    acc = merged;
                    old_deleted = doc.deleted;
                }
            }
        }

        if acc == old_tree {
            // nothing changed for this document
            continue;
        }

        seq += 1;

        if old.update_seq > 0 {
            remove_seqs.push(old.update_seq);
        }

        new_infos.push(FullDocInfo {
            id: group.id,
            update_seq: seq,
            deleted: old.deleted,
            rev_tree: acc,
            leafs_size: None,
        });
    }

    // (e) local docs: compare-and-set on the stored integer revision
    let mut local_changes: BTreeMap<DocId, Option<(u64, Slice)>> = BTreeMap::new();

    for (doc_ref, doc) in locals {
        let given: u64 = doc
            .rev_ids
            .first()
            .and_then(|id| std::str::from_utf8(id).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let stored = match local_changes.get(&doc.id) {
            // an earlier doc in this batch already touched the id
            Some(change) => change.as_ref().map_or(0, |(rev, _)| *rev),
            None => state
                .local
                .lookup(&doc.id)?
                .map_or(0, |(rev, _)| rev),
        };

        if given != stored {
            results.send(0, *doc_ref, WriteOutcome::Conflict);
            continue;
        }

        if doc.deleted {
            local_changes.insert(doc.id.clone(), None);
            results.send(
                0,
                *doc_ref,
                WriteOutcome::Ok(Revision {
                    pos: 0,
                    id: Slice::from("0"),
                }),
            );
        } else {
            let next = stored + 1;
            local_changes.insert(doc.id.clone(), Some((next, doc.body.clone())));
            results.send(
                0,
                *doc_ref,
                WriteOutcome::Ok(Revision {
                    pos: 0,
                    id: Slice::from(next.to_string()),
                }),
            );
        }
    }

    // (f) flush: write bodies; nothing below may touch state before this
    // point succeeds
    let new_infos = flush_trees(state, new_infos)?;

    // (g) index entries
    let mut doc_infos = Vec::with_capacity(new_infos.len());
    let mut ddoc_ids = vec![];

    for info in &new_infos {
        doc_infos.push((info.update_seq, info.to_doc_info()));

        if is_design_doc_id(&info.id) {
            ddoc_ids.push(info.id.clone());
        }
    }

    // (h) apply to trees
    let id_inserts: Vec<_> = new_infos
        .iter()
        .map(|info| (info.id.clone(), info.clone()))
        .collect();

    state.by_id.add_remove(id_inserts, vec![])?;
    state.by_seq.add_remove(doc_infos, remove_seqs)?;

    let mut local_adds = vec![];
    let mut local_removes = vec![];

    for (id, change) in local_changes {
        match change {
            Some(value) => local_adds.push((id, value)),
            None => local_removes.push(id),
        }
    }

    let locals_changed = !local_adds.is_empty() || !local_removes.is_empty();

    state.local.add_remove(local_adds, local_removes)?;

    let seq_changed = seq != state.update_seq;
    state.update_seq = seq;

    // (i) commit and notify
    if full_commit {
        commit_data(state, false)?;
    } else if seq_changed || locals_changed {
        commit_data(state, true)?;
    }

    if seq_changed {
        notify(state, &DbEvent::Updated {
            name: state.name.clone(),
        });
    }

    for id in ddoc_ids {
        notify(state, &DbEvent::DdocUpdated {
            name: state.name.clone(),
            id,
        });
    }

    Ok(())
}

fn pending_value(doc: &Doc) -> RevValue {
    RevValue::InMemory(PendingRev {
        deleted: doc.deleted,
        body: doc.body.clone(),
        atts: doc.atts.clone(),
        atts_fd: doc.atts_fd,
    })
}

/// Writes every unflushed revision to the file, turning it into an on-disk
/// leaf carrying the document's new update seq.
fn flush_trees(
    state: &DbState,
    infos: Vec<FullDocInfo>,
) -> Result<Vec<FullDocInfo>, PipelineError> {
    let mut out = Vec::with_capacity(infos.len());

    for mut info in infos {
        let seq = info.update_seq;

        let tree = info.rev_tree.try_map(&mut |_, _, value, _| match value {
            RevValue::InMemory(rev) => {
                if !rev.atts.is_empty() && rev.atts_fd != Some(state.fd.id()) {
                    // the attachments were streamed to a file that has since
                    // been compacted away
                    return Err(PipelineError::Retry);
                }

                let mut atts = Vec::with_capacity(rev.atts.len());
                let mut atts_size = 0u64;

                for att in &rev.atts {
                    let (ptr, len) = match &att.data {
                        crate::doc::AttachmentData::OnDisk { ptr, len } => (*ptr, *len),
                        crate::doc::AttachmentData::Inline(data) => {
                            let ptr = state.fd.append_chunk(data)?;
                            (ptr, data.len() as u64)
                        }
                    };

                    atts_size += len;
                    atts.push(AttachmentRef {
                        name: att.name.clone(),
                        ptr,
                        len,
                    });
                }

                let summary = DocSummary {
                    body: rev.body.clone(),
                    atts,
                };

                let (ptr, summary_len) =
                    state.fd.append_term(&summary, state.config.compression)?;

                Ok(RevValue::OnDisk(DiskRev {
                    deleted: rev.deleted,
                    ptr,
                    seq,
                    size: Some(summary_len + atts_size),
                }))
            }
            value => Ok(value),
        })?;

        info.rev_tree = tree;
        info.refresh_aggregates();
        out.push(info);
    }

    Ok(out)
}
