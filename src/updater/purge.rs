// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Purging: irrevocable removal of specific revisions.
//!
//! Unlike a deletion (which is just another revision), a purge rewrites the
//! revision trees as if the purged revisions never existed. Surviving
//! leaves are re-sequenced so downstream consumers of the by-seq index see
//! the affected documents again.

use super::{commit_data, DbState, PurgeResult};
use crate::{
    doc::{DocId, PurgedDocs, Revision},
    index::FullDocInfo,
    rev_tree::RevValue,
};

pub(crate) fn purge_docs(
    state: &mut DbState,
    pairs: Vec<(DocId, Vec<Revision>)>,
) -> crate::Result<PurgeResult> {
    let mut purged: Vec<(DocId, Vec<Revision>)> = vec![];
    let mut updates: Vec<FullDocInfo> = vec![];
    let mut id_removes: Vec<DocId> = vec![];
    let mut remove_seqs: Vec<u64> = vec![];

    let mut seq = state.update_seq;

    for (id, revs) in pairs {
        let Some(info) = state.by_id.lookup(&id)? else {
            continue;
        };

        let (tree, removed) = info.rev_tree.clone().remove_leaves(&revs);

        if removed.is_empty() {
            continue;
        }

        log::debug!(
            "Purging {} revision(s) of {:?} from {}",
            removed.len(),
            id,
            state.name,
        );

        purged.push((id.clone(), removed));

        if info.update_seq > 0 {
            remove_seqs.push(info.update_seq);
        }

        if tree.is_empty() {
            id_removes.push(id);
            continue;
        }

        // surviving leaves get a fresh seq so they show up in the changes
        // feed again
        seq += 1;

        let tree = tree.map(&mut |_, _, value, is_leaf| match value {
            RevValue::OnDisk(mut rev) if is_leaf => {
                rev.seq = seq;
                RevValue::OnDisk(rev)
            }
            value => value,
        });

        let mut update = FullDocInfo {
            id,
            update_seq: seq,
            deleted: info.deleted,
            rev_tree: tree,
            leafs_size: None,
        };
        update.refresh_aggregates();

        updates.push(update);
    }

    let doc_infos: Vec<_> = updates
        .iter()
        .map(|info| (info.update_seq, info.to_doc_info()))
        .collect();

    let id_inserts: Vec<_> = updates
        .iter()
        .map(|info| (info.id.clone(), info.clone()))
        .collect();

    state.by_seq.add_remove(doc_infos, remove_seqs)?;
    state.by_id.add_remove(id_inserts, id_removes)?;

    let purged_record = PurgedDocs(purged.clone());
    let (ptr, _) = state
        .fd
        .append_term(&purged_record, state.config.compression)?;

    state.purged_docs = Some(ptr);
    state.purge_seq += 1;
    state.update_seq = seq;

    commit_data(state, false)?;

    Ok(PurgeResult {
        purge_seq: state.purge_seq,
        purged,
    })
}
