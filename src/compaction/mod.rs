// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Compaction: rewriting the database into a sibling file.
//!
//! The worker copies only reachable state (live leaves, stemmed trees, the
//! purge marker, the security blob) into `<path>.compact` while the updater
//! keeps serving writes against the original. The updater performs the
//! hand-off; if writes arrived while copying, it respawns the worker, which
//! resumes from the target's checkpointed seq.

mod worker;

use crate::{
    file::DatabaseFile,
    header::TreeState,
    updater::Command,
    CompressionType, FsyncOptions, Slice,
};
use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, mpsc::Sender, Arc},
    thread::JoinHandle,
};

/// Everything the compactor needs: an immutable snapshot of the source
/// plus a configuration snapshot taken at spawn time.
pub(crate) struct CompactionOptions {
    pub name: String,
    pub db_path: PathBuf,

    /// Source file; read via positional reads only.
    pub fd: Arc<DatabaseFile>,

    pub by_id_state: Option<TreeState>,
    pub by_seq_state: Option<TreeState>,

    /// Source update seq at spawn; the target is committed at this seq, and
    /// the updater compares against its live seq at hand-off.
    pub update_seq: u64,

    pub purge_seq: u64,
    pub purged_docs: Option<u64>,
    pub security: Slice,
    pub revs_limit: u64,

    pub compression: CompressionType,
    pub fsync: FsyncOptions,
    pub doc_buffer_size: u64,
    pub checkpoint_after: u64,

    /// Set to `true` by the updater to interrupt the worker (cancellation
    /// or shutdown); checked once per copied doc-info.
    pub stop: Arc<AtomicBool>,
    pub tx: Sender<Command>,
}

/// Spawns the compactor on its own thread.
pub(crate) fn spawn(opts: CompactionOptions) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("compaction/{}", opts.name))
        .spawn(move || {
            let name = opts.name.clone();

            match worker::run(&opts) {
                Ok(true) => {}
                Ok(false) => log::debug!("Compaction of {name} cancelled"),
                Err(e) => {
                    log::error!("Compaction of {name} failed: {e}");

                    // ask the updater to reap this task and its partial
                    // output, so a later compaction can start fresh
                    let (reply, _) = std::sync::mpsc::channel();
                    let _ = opts.tx.send(Command::CancelCompact { reply });
                }
            }
        })
}
