// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    batch::{group_alike, GroupedDoc},
    config::Config,
    doc::{is_local_doc_id, new_rev_id, AttachmentData, Doc, DocId, Revision},
    snapshot::{Snapshot, StoredDoc},
    updater::{self, BatchReply, Command, PurgeResult, UpdateRequest, WriteOutcome},
    Slice,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

/// Options for a batch write
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateOptions {
    /// Replicated mode: docs carry full revision paths and conflicting
    /// revisions are preserved instead of rejected.
    pub replicated: bool,

    /// Commit the header before replying instead of arming the delayed
    /// commit timer.
    pub full_commit: bool,
}

struct Inner {
    tx: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    name: String,
    path: PathBuf,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);

        if let Ok(mut thread) = self.thread.lock() {
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Handle to an open database
///
/// Cheap to clone; all clones talk to the same updater. The updater shuts
/// down (committing any pending delayed commit) when the last clone is
/// dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Database({:?})", self.inner.path)
    }
}

impl Database {
    pub(crate) fn open_with(config: Config) -> crate::Result<Self> {
        let name = config
            .path
            .file_stem()
            .map_or_else(|| "db".to_string(), |s| s.to_string_lossy().into_owned());

        let (tx, rx) = mpsc::channel();

        let state = updater::open(config, name.clone(), tx.clone())?;
        let path = state.path.clone();

        log::info!("Opened {name} at update_seq={}", state.update_seq);

        let thread = std::thread::Builder::new()
            .name(format!("updater/{name}"))
            .spawn(move || updater::run(&rx, state))?;

        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                thread: Mutex::new(Some(thread)),
                name,
                path,
            }),
        })
    }

    /// The database name (file stem).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn send(&self, cmd: Command) -> crate::Result<()> {
        self.inner.tx.send(cmd).map_err(|_| crate::Error::Stopped)
    }

    fn call<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> crate::Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(make(reply_tx))?;
        reply_rx.recv().map_err(|_| crate::Error::Stopped)
    }

    /// Takes an immutable snapshot of the current state.
    pub fn snapshot(&self) -> crate::Result<Snapshot> {
        self.call(|reply| Command::GetDb { reply })
    }

    /// Forces any pending delayed commit, making every previously
    /// acknowledged write durable. Returns the committed update seq.
    pub fn full_commit(&self) -> crate::Result<u64> {
        self.call(|reply| Command::FullCommit { reply })
    }

    /// Writes a batch of documents.
    ///
    /// Returns one outcome per input document, in input order. In normal
    /// mode each doc names its parent revision (or none, for a new doc) and
    /// gets a freshly generated revision on success; in replicated mode
    /// (see [`UpdateOptions::replicated`]) docs carry their full revision
    /// path and conflicts are preserved.
    ///
    /// Documents with the `_local/` id prefix are non-replicated: they are
    /// stored by value under an integer revision, never enter the revision
    /// trees and never advance the update seq.
    ///
    /// If the batch races a compaction swap it is transparently re-prepared
    /// and resubmitted.
    ///
    /// A document carrying a malformed revision path fails the whole batch
    /// with [`Error::InvalidRevisionPath`](crate::Error::InvalidRevisionPath)
    /// before anything is submitted.
    pub fn update_docs(
        &self,
        docs: Vec<Doc>,
        options: &UpdateOptions,
    ) -> crate::Result<Vec<WriteOutcome>> {
        loop {
            let snap = self.snapshot()?;
            let prepared = prepare_docs(&snap, docs.clone(), options.replicated)?;

            let mut defaults: Vec<Revision> = Vec::with_capacity(prepared.len());
            let mut grouped = vec![];
            let mut locals = vec![];

            for (doc_ref, (doc, rev)) in prepared.into_iter().enumerate() {
                defaults.push(rev);

                if is_local_doc_id(&doc.id) {
                    locals.push((doc_ref, doc));
                } else {
                    grouped.push(GroupedDoc {
                        client: 0,
                        doc_ref,
                        doc,
                    });
                }
            }

            let (reply_tx, reply_rx) = mpsc::channel();

            self.send(Command::UpdateDocs(Box::new(UpdateRequest {
                groups: group_alike(grouped),
                locals,
                merge_conflicts: options.replicated,
                full_commit: options.full_commit,
                reply: reply_tx,
            })))?;

            match reply_rx.recv().map_err(|_| crate::Error::Stopped)? {
                BatchReply::Retry => {
                    log::debug!("Write batch raced a compaction swap, resubmitting");
                }
                BatchReply::Done { results } => {
                    let mut out: Vec<WriteOutcome> =
                        defaults.into_iter().map(WriteOutcome::Ok).collect();

                    for (doc_ref, outcome) in results {
                        if let Some(slot) = out.get_mut(doc_ref) {
                            *slot = outcome;
                        }
                    }

                    return Ok(out);
                }
            }
        }
    }

    /// Writes a single document, returning its new revision.
    ///
    /// A conflicting write is an [`Error::Conflict`](crate::Error::Conflict).
    pub fn save_doc(&self, doc: Doc) -> crate::Result<Revision> {
        match self
            .update_docs(vec![doc], &UpdateOptions::default())?
            .pop()
        {
            Some(WriteOutcome::Ok(rev)) => Ok(rev),
            Some(WriteOutcome::Conflict) => Err(crate::Error::Conflict),
            None => Err(crate::Error::Stopped),
        }
    }

    /// Deletes a document revision, returning the deletion's revision.
    pub fn delete_doc<I: Into<DocId>>(&self, id: I, rev: &Revision) -> crate::Result<Revision> {
        self.save_doc(Doc::delete(id, rev))
    }

    /// Reads the winning revision of a document (see [`Snapshot::doc`]).
    pub fn doc<I: AsRef<[u8]>>(&self, id: I) -> crate::Result<Option<StoredDoc>> {
        self.snapshot()?.doc(id)
    }

    /// Bumps the update seq by one and commits. Returns the new seq.
    pub fn increment_update_seq(&self) -> crate::Result<u64> {
        self.call(|reply| Command::IncrementUpdateSeq { reply })
    }

    /// Sets the maximum revision tree depth and commits.
    pub fn set_revs_limit(&self, limit: u64) -> crate::Result<()> {
        self.call(|reply| Command::SetRevsLimit { limit, reply })
    }

    /// Stores the opaque security policy blob and commits.
    pub fn set_security<B: Into<Slice>>(&self, blob: B) -> crate::Result<()> {
        let blob = blob.into();
        self.call(|reply| Command::SetSecurity { blob, reply })
    }

    /// Irrevocably removes the given `(id, revs)` pairs from their revision
    /// trees.
    ///
    /// Fails with [`Error::PurgeDuringCompaction`](crate::Error::PurgeDuringCompaction)
    /// while a compaction is running.
    pub fn purge_docs(
        &self,
        pairs: Vec<(DocId, Vec<Revision>)>,
    ) -> crate::Result<PurgeResult> {
        self.call(|reply| Command::PurgeDocs { pairs, reply })?
    }

    /// Starts a background compaction; a no-op if one is already running.
    ///
    /// Under a sustained write load the compactor may need several rounds
    /// to catch up, so there is no wall-clock bound on completion.
    pub fn start_compact(&self) -> crate::Result<()> {
        self.call(|reply| Command::StartCompact { reply })
    }

    /// Cancels a running compaction and removes its partial output.
    pub fn cancel_compact(&self) -> crate::Result<()> {
        self.call(|reply| Command::CancelCompact { reply })
    }

    /// Compacts the database and blocks until the hand-off happened.
    pub fn compact(&self) -> crate::Result<()> {
        self.start_compact()?;

        while self.snapshot()?.is_compacting() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        Ok(())
    }
}

/// Client-side preparation: generates revision ids for plain edits, writes
/// attachment payloads to the current file, and stamps each doc with the
/// file id those payloads went to.
fn prepare_docs(
    snap: &Snapshot,
    docs: Vec<Doc>,
    replicated: bool,
) -> crate::Result<Vec<(Doc, Revision)>> {
    docs.into_iter()
        .map(|mut doc| {
            for att in &mut doc.atts {
                if let AttachmentData::Inline(data) = &att.data {
                    let ptr = snap.fd.append_chunk(data)?;
                    att.data = AttachmentData::OnDisk {
                        ptr,
                        len: data.len() as u64,
                    };
                }
            }

            if !doc.atts.is_empty() {
                doc.atts_fd = Some(snap.fd.id());
            }

            if is_local_doc_id(&doc.id) {
                // local revisions are assigned by the updater
                let rev = doc
                    .rev()
                    .unwrap_or_else(|| Revision::new(0, Slice::from("0")));
                return Ok((doc, rev));
            }

            if replicated {
                // a replicated write must carry a well-formed revision path
                let Some(newest) = doc.rev_ids.first().cloned() else {
                    return Err(crate::Error::InvalidRevisionPath);
                };

                if doc.rev_start < doc.rev_ids.len() as u64 {
                    return Err(crate::Error::InvalidRevisionPath);
                }

                let rev = Revision {
                    pos: doc.rev_start,
                    id: newest,
                };
                return Ok((doc, rev));
            }

            if doc.rev_start < doc.rev_ids.len() as u64 {
                return Err(crate::Error::InvalidRevisionPath);
            }

            // recreating a deleted document: graft onto the deleted winner
            // so the recreation continues its edit history
            if doc.rev_ids.is_empty() {
                if let Some(info) = snap.full_doc_info(&doc.id)? {
                    if info.deleted {
                        if let Some(winner) = info.winner() {
                            doc.rev_start = winner.rev.pos;
                            doc.rev_ids = vec![winner.rev.id];
                        }
                    }
                }
            }

            let parent = doc.rev_ids.first().cloned();
            let new_id = new_rev_id(parent.as_ref(), doc.deleted, &doc.body, &doc.atts);

            doc.rev_start += 1;
            doc.rev_ids.insert(0, new_id.clone());

            let rev = Revision {
                pos: doc.rev_start,
                id: new_id,
            };

            Ok((doc, rev))
        })
        .collect()
}
