// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::CompactionOptions;
use crate::{
    btree::{BTree, TreeCodec},
    coding::Decode,
    doc::DocSummary,
    file::{compact_path, DatabaseFile},
    header::Header,
    index::{ById, BySeq, DocInfo, FullDocInfo},
    rev_tree::{DiskRev, RevValue},
    updater::{write_header_record, Command},
};
use rustc_hash::FxHashSet;
use std::{ops::ControlFlow, sync::Arc};

struct Target {
    fd: Arc<DatabaseFile>,
    by_id: BTree<ById>,
    by_seq: BTree<BySeq>,
    header: Header,
    update_seq: u64,
    purge_seq: u64,
    purged_docs: Option<u64>,
    security_ptr: Option<u64>,
}

/// Opens the sidecar file, resuming from its checkpointed state if a
/// previous (interrupted or outrun) compaction left a valid header behind.
fn open_target(opts: &CompactionOptions) -> crate::Result<(Target, bool)> {
    let path = compact_path(&opts.db_path);

    if path.exists() {
        let fd = Arc::new(DatabaseFile::open(&path)?);

        if let Some(bytes) = fd.read_last_header()? {
            if let Ok(header) = Header::from_slice(&bytes) {
                log::debug!(
                    "Resuming compaction of {} from update_seq={}",
                    opts.name,
                    header.update_seq,
                );

                let by_id = BTree::open(fd.clone(), header.by_id_state.as_ref(), opts.compression)?;
                let by_seq =
                    BTree::open(fd.clone(), header.by_seq_state.as_ref(), opts.compression)?;

                return Ok((
                    Target {
                        update_seq: header.update_seq,
                        purge_seq: header.purge_seq,
                        purged_docs: header.purged_docs,
                        security_ptr: header.security_ptr,
                        fd,
                        by_id,
                        by_seq,
                        header,
                    },
                    true,
                ));
            }
        }
    }

    let fd = Arc::new(DatabaseFile::create(&path)?);

    let header = Header {
        revs_limit: opts.revs_limit,
        ..Header::default()
    };

    write_header_record(&fd, &header, opts.fsync)?;

    let by_id = BTree::open(fd.clone(), None, opts.compression)?;
    let by_seq = BTree::open(fd.clone(), None, opts.compression)?;

    Ok((
        Target {
            update_seq: 0,
            purge_seq: 0,
            purged_docs: None,
            security_ptr: None,
            fd,
            by_id,
            by_seq,
            header,
        },
        false,
    ))
}

fn commit_target(target: &mut Target, opts: &CompactionOptions) -> crate::Result<()> {
    let header = Header {
        disk_version: crate::header::CURRENT_DISK_VERSION,
        update_seq: target.update_seq,
        purge_seq: target.purge_seq,
        purged_docs: target.purged_docs,
        by_id_state: target.by_id.state()?,
        by_seq_state: target.by_seq.state()?,
        // local docs are inserted by the updater at hand-off
        local_state: target.header.local_state.clone(),
        security_ptr: target.security_ptr,
        revs_limit: opts.revs_limit,
    };

    if header != target.header {
        write_header_record(&target.fd, &header, opts.fsync)?;
        target.header = header;
    }

    Ok(())
}

/// Copies one id-deduplicated batch of documents into the target,
/// rewriting every leaf body and stemming the trees.
///
/// Returns the number of payload bytes appended.
fn copy_docs(
    opts: &CompactionOptions,
    source_by_id: &BTree<ById>,
    target: &mut Target,
    mut infos: Vec<DocInfo>,
    retry: bool,
) -> crate::Result<u64> {
    // within one flush, the first occurrence of an id wins
    let mut seen = FxHashSet::default();
    infos.retain(|info| seen.insert(info.id.clone()));

    let last_seq = infos.last().map(|info| info.high_seq);

    let mut copied = 0u64;
    let mut new_infos: Vec<FullDocInfo> = Vec::with_capacity(infos.len());

    for info in infos {
        let Some(full) = source_by_id.lookup(&info.id)? else {
            // cannot happen on a consistent snapshot
            log::warn!("Compaction of {} found no record for a seq entry", opts.name);
            continue;
        };

        let tree = full.rev_tree.try_map(&mut |_, _, value, is_leaf| {
            if !is_leaf {
                // interior bodies are dropped; only leaves survive
                return Ok::<RevValue, crate::Error>(RevValue::Missing);
            }

            match value {
                RevValue::OnDisk(rev) => {
                    let bytes = opts.fd.pread_term(rev.ptr)?;
                    let mut summary = DocSummary::decode_from(&mut &bytes[..])
                        .map_err(crate::Error::from)?;

                    let mut atts_size = 0u64;

                    for att in &mut summary.atts {
                        let data = opts.fd.pread_chunk(att.ptr)?;
                        att.ptr = target.fd.append_chunk(&data)?;
                        atts_size += att.len;
                        copied += data.len() as u64;
                    }

                    let (ptr, summary_len) =
                        target.fd.append_term(&summary, opts.compression)?;
                    copied += summary_len;

                    Ok(RevValue::OnDisk(DiskRev {
                        deleted: rev.deleted,
                        ptr,
                        seq: rev.seq,
                        size: Some(summary_len + atts_size),
                    }))
                }

                // a leaf without a body (exposed by a purge) stays as-is
                value => Ok(value),
            }
        })?;

        let tree = tree.stem(opts.revs_limit);

        let mut new_full = FullDocInfo {
            id: full.id,
            update_seq: full.update_seq,
            deleted: full.deleted,
            rev_tree: tree,
            leafs_size: None,
        };
        new_full.refresh_aggregates();

        new_infos.push(new_full);
    }

    let mut remove_seqs = vec![];

    if retry {
        // documents already copied in a previous round moved seq since
        for info in &new_infos {
            if let Some(existing) = target.by_id.lookup(&info.id)? {
                if existing.update_seq != info.update_seq {
                    remove_seqs.push(existing.update_seq);
                }
            }
        }
    }

    let doc_infos: Vec<_> = new_infos
        .iter()
        .map(|info| (info.update_seq, info.to_doc_info()))
        .collect();

    let id_inserts: Vec<_> = new_infos
        .into_iter()
        .map(|info| (info.id.clone(), info))
        .collect();

    target.by_seq.add_remove(doc_infos, remove_seqs)?;
    target.by_id.add_remove(id_inserts, vec![])?;

    if let Some(seq) = last_seq {
        target.update_seq = seq;
    }

    Ok(copied)
}

/// The compactor state machine. Returns `Ok(false)` when cancelled.
pub(super) fn run(opts: &CompactionOptions) -> crate::Result<bool> {
    let (mut target, retry) = open_target(opts)?;

    // carry the purge marker over so the target agrees about purge history
    if opts.purge_seq > 0 && target.purge_seq < opts.purge_seq {
        if let Some(ptr) = opts.purged_docs {
            let chunk = opts.fd.pread_chunk(ptr)?;
            target.purged_docs = Some(target.fd.append_chunk(&chunk)?);
            target.purge_seq = opts.purge_seq;
        }
    }

    let source_by_id = BTree::<ById>::open(
        opts.fd.clone(),
        opts.by_id_state.as_ref(),
        opts.compression,
    )?;
    let source_by_seq = BTree::<BySeq>::open(
        opts.fd.clone(),
        opts.by_seq_state.as_ref(),
        opts.compression,
    )?;

    log::debug!(
        "Compacting {} from update_seq={} to update_seq={}",
        opts.name,
        target.update_seq,
        opts.update_seq,
    );

    let start = target.update_seq + 1;

    let mut buffer: Vec<DocInfo> = vec![];
    let mut buffered_bytes = 0u64;
    let mut since_checkpoint = 0u64;
    let mut scratch = vec![];

    let flow = source_by_seq.fold(Some(&start), &mut |_, info| {
        if opts.stop.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(ControlFlow::Break(()));
        }

        scratch.clear();
        BySeq::encode_entry(&info.high_seq, info, &mut scratch)?;
        buffered_bytes += scratch.len() as u64;

        buffer.push(info.clone());

        if buffered_bytes >= opts.doc_buffer_size {
            since_checkpoint += copy_docs(
                opts,
                &source_by_id,
                &mut target,
                std::mem::take(&mut buffer),
                retry,
            )?;
            buffered_bytes = 0;

            if since_checkpoint >= opts.checkpoint_after {
                commit_target(&mut target, opts)?;
                since_checkpoint = 0;
            }
        }

        Ok(ControlFlow::Continue(()))
    })?;

    if flow.is_break() {
        return Ok(false);
    }

    if !buffer.is_empty() {
        copy_docs(opts, &source_by_id, &mut target, buffer, retry)?;
    }

    // carry the security blob if one was ever set
    if !opts.security.is_empty() {
        let (ptr, _) = target.fd.append_term(&opts.security, opts.compression)?;
        target.security_ptr = Some(ptr);
    }

    // commit at the seq the fold started from; the updater decides at
    // hand-off whether that still matches the live seq
    target.update_seq = opts.update_seq;
    commit_target(&mut target, opts)?;

    let path = target.fd.path().to_path_buf();
    drop(target);

    let _ = opts.tx.send(Command::CompactDone { path });

    Ok(true)
}
