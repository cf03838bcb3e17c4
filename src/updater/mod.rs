// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The updater actor: single-threaded owner of all mutable database state.
//!
//! Every mutation flows through one thread consuming a command channel, so
//! the cross-tree invariant (by-id, by-seq and header always describe the
//! same set of documents) never needs a lock. Readers get cheap immutable
//! snapshots; the compactor runs next to the actor and only ever talks back
//! through one terminal message.

pub mod purge;
pub mod write;

use crate::{
    batch::DocGroup,
    btree::BTree,
    coding::Encode,
    compaction::{self, CompactionOptions},
    config::Config,
    doc::{Doc, DocId, Revision},
    event::DbEvent,
    file::{compact_path, fsync_directory, DatabaseFile},
    header::Header,
    index::{ById, BySeq, LocalDocs},
    snapshot::Snapshot,
    FsyncOptions, Slice,
};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// How long a delayed commit may be owed before the header is forced.
const COMMIT_DELAY: Duration = Duration::from_secs(1);

/// Per-document result of a write batch
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    /// The write was accepted under this revision.
    Ok(Revision),

    /// The write lost against the current revision tree.
    Conflict,
}

/// Result of a purge operation
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PurgeResult {
    /// The purge seq after this batch.
    pub purge_seq: u64,

    /// The `(id, revs)` pairs that were actually removed.
    pub purged: Vec<(DocId, Vec<Revision>)>,
}

/// Reply to one (possibly coalesced) write batch.
pub(crate) enum BatchReply {
    /// The batch was applied; `results` carries per-doc outcomes, keyed by
    /// the caller-side doc index. Docs without an entry were accepted
    /// under their prepared revision.
    Done {
        results: Vec<(usize, WriteOutcome)>,
    },

    /// A compaction swap raced this batch; nothing was applied, the caller
    /// must re-prepare against the fresh file and resubmit.
    Retry,
}

pub(crate) struct UpdateRequest {
    pub groups: Vec<DocGroup>,
    pub locals: Vec<(usize, Doc)>,
    pub merge_conflicts: bool,
    pub full_commit: bool,
    pub reply: Sender<BatchReply>,
}

pub(crate) enum Command {
    GetDb {
        reply: Sender<Snapshot>,
    },
    FullCommit {
        reply: Sender<u64>,
    },
    UpdateDocs(Box<UpdateRequest>),
    IncrementUpdateSeq {
        reply: Sender<u64>,
    },
    SetRevsLimit {
        limit: u64,
        reply: Sender<()>,
    },
    SetSecurity {
        blob: Slice,
        reply: Sender<()>,
    },
    PurgeDocs {
        pairs: Vec<(DocId, Vec<Revision>)>,
        reply: Sender<crate::Result<PurgeResult>>,
    },
    StartCompact {
        reply: Sender<()>,
    },
    CancelCompact {
        reply: Sender<()>,
    },

    /// Terminal message of the compactor task.
    CompactDone {
        path: PathBuf,
    },

    /// Sent by the last dropped handle.
    Shutdown,
}

pub(crate) struct CompactorTask {
    thread: JoinHandle<()>,

    /// Interrupts the worker when set.
    stop: Arc<AtomicBool>,
}

/// The mutable database state, owned exclusively by the actor thread
pub(crate) struct DbState {
    pub name: String,
    pub path: PathBuf,
    pub fd: Arc<DatabaseFile>,
    pub header: Header,
    pub by_id: BTree<ById>,
    pub by_seq: BTree<BySeq>,
    pub local: BTree<LocalDocs>,
    pub update_seq: u64,
    pub committed_update_seq: u64,
    pub purge_seq: u64,
    pub purged_docs: Option<u64>,
    pub revs_limit: u64,
    pub security: Slice,
    pub security_ptr: Option<u64>,
    pub instance_start_time: u64,
    pub compactor: Option<CompactorTask>,
    pub delayed_commit: Option<Instant>,
    pub config: Config,
    pub tx: Sender<Command>,
}

/// Writes a header record honoring the fsync options.
pub(crate) fn write_header_record(
    fd: &DatabaseFile,
    header: &Header,
    fsync: FsyncOptions,
) -> crate::Result<()> {
    if fsync.before_header {
        fd.sync()?;
    }

    fd.write_header(&header.encode_into_vec()?)?;

    if fsync.after_header {
        fd.sync()?;
    }

    Ok(())
}

/// Builds the in-memory state from a (possibly just-written) header.
pub(crate) fn init_db(
    name: String,
    path: PathBuf,
    fd: Arc<DatabaseFile>,
    header: Header,
    config: Config,
    instance_start_time: u64,
    tx: Sender<Command>,
) -> crate::Result<DbState> {
    let by_id = BTree::open(fd.clone(), header.by_id_state.as_ref(), config.compression)?;
    let by_seq = BTree::open(fd.clone(), header.by_seq_state.as_ref(), config.compression)?;
    let local = BTree::open(fd.clone(), header.local_state.as_ref(), config.compression)?;

    let security = match header.security_ptr {
        Some(ptr) => fd.pread_term(ptr)?.into(),
        None => Slice::empty(),
    };

    Ok(DbState {
        name,
        path,
        update_seq: header.update_seq,
        committed_update_seq: header.update_seq,
        purge_seq: header.purge_seq,
        purged_docs: header.purged_docs,
        revs_limit: header.revs_limit,
        security,
        security_ptr: header.security_ptr,
        instance_start_time,
        compactor: None,
        delayed_commit: None,
        header,
        fd,
        by_id,
        by_seq,
        local,
        config,
        tx,
    })
}

/// Opens (or creates) the database file and builds the initial state.
pub(crate) fn open(config: Config, name: String, tx: Sender<Command>) -> crate::Result<DbState> {
    let path = config.path.clone();

    let fd = Arc::new(DatabaseFile::open(&path)?);

    if config.fsync.on_file_open {
        fd.sync()?;
    }

    // a sidecar left behind by an interrupted compaction is stale
    match std::fs::remove_file(compact_path(&path)) {
        Ok(()) => log::debug!("Removed stale compaction file of {name}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let (header, upgraded) = match fd.read_last_header()? {
        Some(bytes) => (Header::from_slice(&bytes)?, Header::was_upgraded(&bytes)),
        None => {
            let header = Header::default();
            write_header_record(&fd, &header, config.fsync)?;
            (header, false)
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    let instance_start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;

    let mut state = init_db(name, path, fd, header, config, instance_start_time, tx)?;

    if upgraded {
        log::info!(
            "Upgraded {} to disk version {}",
            state.name,
            state.header.disk_version,
        );
        // rewrite at the current width right away
        let fresh = make_header(&state)?;
        write_header_record(&state.fd, &fresh, state.config.fsync)?;
        state.header = fresh;
    }

    Ok(state)
}

fn make_header(state: &DbState) -> crate::Result<Header> {
    Ok(Header {
        disk_version: crate::header::CURRENT_DISK_VERSION,
        update_seq: state.update_seq,
        purge_seq: state.purge_seq,
        purged_docs: state.purged_docs,
        by_id_state: state.by_id.state()?,
        by_seq_state: state.by_seq.state()?,
        local_state: state.local.state()?,
        security_ptr: state.security_ptr,
        revs_limit: state.revs_limit,
    })
}

/// Commits the current state, or arms the delayed-commit timer.
///
/// A delayed call arms the 1 s timer if none is armed and returns; a forced
/// call cancels the timer, and writes a header only if something actually
/// changed since the last one.
pub(crate) fn commit_data(state: &mut DbState, delayed: bool) -> crate::Result<()> {
    if delayed {
        if state.delayed_commit.is_none() {
            state.delayed_commit = Some(Instant::now() + COMMIT_DELAY);
        }
        return Ok(());
    }

    state.delayed_commit = None;

    let header = make_header(state)?;

    if header == state.header {
        return Ok(());
    }

    write_header_record(&state.fd, &header, state.config.fsync)?;

    state.header = header;
    state.committed_update_seq = state.update_seq;

    log::trace!(
        "Committed {} at update_seq={}",
        state.name,
        state.update_seq,
    );

    Ok(())
}

fn make_snapshot(state: &DbState) -> Snapshot {
    Snapshot {
        fd: state.fd.clone(),
        by_id: state.by_id.clone(),
        by_seq: state.by_seq.clone(),
        local: state.local.clone(),
        update_seq: state.update_seq,
        committed_update_seq: state.committed_update_seq,
        purge_seq: state.purge_seq,
        revs_limit: state.revs_limit,
        security: state.security.clone(),
        instance_start_time: state.instance_start_time,
        compacting: state.compactor.is_some(),
    }
}

pub(crate) fn notify(state: &DbState, event: &DbEvent) {
    if let Some(listener) = &state.config.listener {
        listener(event);
    }
}

fn start_compact(state: &mut DbState) -> crate::Result<()> {
    if state.compactor.is_some() {
        log::debug!("Compaction of {} already running", state.name);
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));

    let opts = CompactionOptions {
        name: state.name.clone(),
        db_path: state.path.clone(),
        fd: state.fd.clone(),
        by_id_state: state.by_id.state()?,
        by_seq_state: state.by_seq.state()?,
        update_seq: state.update_seq,
        purge_seq: state.purge_seq,
        purged_docs: state.purged_docs,
        security: state.security.clone(),
        revs_limit: state.revs_limit,
        compression: state.config.compression,
        fsync: state.config.fsync,
        doc_buffer_size: state.config.doc_buffer_size,
        checkpoint_after: state.config.effective_checkpoint_after(),
        stop: stop.clone(),
        tx: state.tx.clone(),
    };

    log::info!("Starting compaction of {}", state.name);

    let thread = compaction::spawn(opts)?;
    state.compactor = Some(CompactorTask { thread, stop });

    Ok(())
}

fn cancel_compact(state: &mut DbState) -> crate::Result<()> {
    let Some(task) = state.compactor.take() else {
        return Ok(());
    };

    log::info!("Cancelling compaction of {}", state.name);

    task.stop.store(true, Ordering::Release);
    let _ = task.thread.join();
    let _ = std::fs::remove_file(compact_path(&state.path));

    Ok(())
}

/// Compaction hand-off: swap to the target if it caught up, otherwise send
/// the compactor back for another round.
fn compact_done(state: &mut DbState, target_path: PathBuf) -> crate::Result<()> {
    let Some(task) = state.compactor.take() else {
        // cancelled while the terminal message was in flight
        log::debug!("Ignoring stale compact_done for {}", state.name);
        return Ok(());
    };

    let _ = task.thread.join();

    let fd = Arc::new(DatabaseFile::open(&target_path)?);

    let header_bytes = fd.read_last_header()?.ok_or_else(|| {
        crate::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "compaction target has no header",
        ))
    })?;
    let header = Header::from_slice(&header_bytes)?;

    let mut target = init_db(
        state.name.clone(),
        target_path.clone(),
        fd,
        header,
        state.config.clone(),
        state.instance_start_time,
        state.tx.clone(),
    )?;

    if target.update_seq == state.update_seq {
        // dump local docs; they are never touched by the copy loop
        let mut locals = vec![];

        state.local.fold(None, &mut |key, value| {
            locals.push((key.clone(), value.clone()));
            Ok(std::ops::ControlFlow::Continue(()))
        })?;

        target.local.add_remove(locals, vec![])?;
        target.revs_limit = state.revs_limit;

        commit_data(&mut target, false)?;

        std::fs::remove_file(&state.path)?;
        std::fs::rename(&target_path, &state.path)?;

        if let Some(parent) = state.path.parent() {
            fsync_directory(parent)?;
        }

        log::info!(
            "Compaction of {} finished at update_seq={}",
            state.name,
            target.update_seq,
        );

        // the swapped-in state is the live state now; the compactor handle
        // is cleared on it unconditionally
        target.path = state.path.clone();
        target.compactor = None;
        target.delayed_commit = None;

        *state = target;

        notify(state, &DbEvent::Compacted {
            name: state.name.clone(),
        });
    } else {
        log::debug!(
            "Compaction of {} fell behind (target={}, live={}), restarting",
            state.name,
            target.update_seq,
            state.update_seq,
        );

        drop(target);
        start_compact(state)?;
    }

    Ok(())
}

fn handle(
    state: &mut DbState,
    cmd: Command,
    rx: &Receiver<Command>,
    pending: &mut VecDeque<Command>,
) -> crate::Result<()> {
    match cmd {
        Command::GetDb { reply } => {
            let _ = reply.send(make_snapshot(state));
        }

        Command::FullCommit { reply } => {
            commit_data(state, false)?;
            let _ = reply.send(state.committed_update_seq);
        }

        Command::UpdateDocs(req) => {
            write::update_docs(state, *req, rx, pending)?;
        }

        Command::IncrementUpdateSeq { reply } => {
            state.update_seq += 1;
            commit_data(state, false)?;
            let _ = reply.send(state.update_seq);
        }

        Command::SetRevsLimit { limit, reply } => {
            state.revs_limit = limit.max(1);
            state.update_seq += 1;
            commit_data(state, false)?;
            let _ = reply.send(());
        }

        Command::SetSecurity { blob, reply } => {
            let (ptr, _) = state
                .fd
                .append_term(&blob, state.config.compression)?;

            state.security = blob;
            state.security_ptr = Some(ptr);
            state.update_seq += 1;
            commit_data(state, false)?;
            let _ = reply.send(());
        }

        Command::PurgeDocs { pairs, reply } => {
            if state.compactor.is_some() {
                let _ = reply.send(Err(crate::Error::PurgeDuringCompaction));
            } else {
                let result = purge::purge_docs(state, pairs)?;
                let _ = reply.send(Ok(result));
            }
        }

        Command::StartCompact { reply } => {
            start_compact(state)?;
            let _ = reply.send(());
        }

        Command::CancelCompact { reply } => {
            cancel_compact(state)?;
            let _ = reply.send(());
        }

        Command::CompactDone { path } => {
            compact_done(state, path)?;
        }

        Command::Shutdown => {
            // handled by the loop
        }
    }

    Ok(())
}

fn shutdown(mut state: DbState) {
    // a still-armed delayed commit would silently lose acknowledged writes
    if state.delayed_commit.is_some() {
        if let Err(e) = commit_data(&mut state, false) {
            log::error!("Final commit of {} failed: {e}", state.name);
        }
    }

    if let Err(e) = cancel_compact(&mut state) {
        log::error!("Stopping compactor of {} failed: {e}", state.name);
    }

    log::debug!("Updater of {} shutting down", state.name);
}

/// The actor loop. Runs until the last handle shuts it down or an
/// unrecoverable error occurs.
pub(crate) fn run(rx: &Receiver<Command>, mut state: DbState) {
    let mut pending: VecDeque<Command> = VecDeque::new();

    loop {
        let cmd = if let Some(cmd) = pending.pop_front() {
            Some(cmd)
        } else if let Some(deadline) = state.delayed_commit {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = commit_data(&mut state, false) {
                        log::error!("Delayed commit of {} failed: {e}", state.name);
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => None,
            }
        } else {
            rx.recv().ok()
        };

        let Some(cmd) = cmd else {
            break;
        };

        if matches!(cmd, Command::Shutdown) {
            break;
        }

        if let Err(e) = handle(&mut state, cmd, rx, &mut pending) {
            log::error!("Updater of {} terminating: {e}", state.name);
            break;
        }
    }

    shutdown(state);
}
