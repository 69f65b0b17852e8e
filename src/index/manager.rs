//! The index manager
//!
//! Owns one collection's barrels: the in-memory barrel accepting documents,
//! the manifest of flushed barrels, tombstones, the binlog and the merge
//! machinery. Readers get immutable snapshots and never block indexing.
//!
//! Lock order: `writer` before `barrels`. Merge commits take `barrels` only.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::{debug, error, info, warn};

use crate::config::{IndexManagerConfig, MergeMode};
use crate::error::{IndexError, Result};
use crate::store::{delete_if_exists, Directory, DirectoryRegistry};

use super::barrel_info::{barrel_stem, BarrelInfo, BarrelsInfo, BarrelsInfoHolder, MANIFEST_TMP_FILE};
use super::barrel_reader::{BarrelFiles, MultiIndexBarrelReader, SingleIndexBarrelReader};
use super::barrel_writer::IndexBarrelWriter;
use super::binlog::{Binlog, BINLOG_TMP_FILE};
use super::deletion::DeletedDocs;
use super::doc_length::{DocLengthReader, DocLengthWriter};
use super::merge_policy::{MergeBarrelEntry, MergePlan, MergePolicy};
use super::merger::IndexMerger;
use super::progress::{IndexingProgressStatus, ProgressTracker};
use super::types::{BarrelId, DocId, IndexerDocument};

enum MergeRequest {
    Merge(MergePlan),
    /// Answered once every earlier request is done
    Sync(Sender<()>),
}

/// State of the single writer
struct WriterState {
    barrel: Option<IndexBarrelWriter>,
    doc_lengths: DocLengthWriter,
    binlog: Option<Binlog>,
    last_doc_id: Option<DocId>,
    /// RAM copy of `barrel` for realtime readers, dropped on every add
    snapshot: Option<Arc<BarrelFiles>>,
}

struct ManagerInner {
    config: IndexManagerConfig,
    directory: Arc<dyn Directory>,
    manifest: BarrelsInfoHolder,
    deleted: DeletedDocs,
    /// Opened barrels, shared with readers
    barrels: Mutex<HashMap<BarrelId, Arc<BarrelFiles>>>,
    writer: Mutex<WriterState>,
    policy: Mutex<MergePolicy>,
    /// One merge at a time
    merge_lock: Mutex<()>,
    merger: IndexMerger,
    merge_tx: Mutex<Option<Sender<MergeRequest>>>,
    progress: ProgressTracker,
}

pub struct IndexManager {
    inner: Arc<ManagerInner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl IndexManager {
    /// Open the index at `config.index_location` through `registry`
    pub fn open(config: IndexManagerConfig, registry: &DirectoryRegistry) -> Result<Self> {
        config.validate()?;
        let directory = registry.open(config.directory, &config.index_location)?;
        Self::open_with_directory(config, directory)
    }

    pub fn open_with_directory(
        config: IndexManagerConfig,
        directory: Arc<dyn Directory>,
    ) -> Result<Self> {
        config.validate()?;
        let manifest = BarrelsInfoHolder::open(directory.clone())?;
        let snapshot = manifest.snapshot();
        remove_orphans(directory.as_ref(), &snapshot)?;

        let deleted = DeletedDocs::open(directory.clone())?;
        let doc_lengths =
            DocLengthWriter::open(directory.as_ref(), config.schema.num_indexed_properties())?;

        let mut policy = MergePolicy::new(config.merge.strategy);
        let restored = policy.restore(
            snapshot
                .iter()
                .map(|b| MergeBarrelEntry::new(directory.clone(), b.clone()))
                .collect(),
        )?;

        let (merge_tx, worker_rx) = match config.merge.mode {
            MergeMode::Background => {
                let (tx, rx) = channel::unbounded();
                (Some(tx), Some(rx))
            }
            MergeMode::Synchronous => (None, None),
        };

        let inner = Arc::new(ManagerInner {
            merger: IndexMerger::new(config.posting, config.memory),
            writer: Mutex::new(WriterState {
                barrel: None,
                doc_lengths,
                binlog: None,
                last_doc_id: snapshot.max_doc_id(),
                snapshot: None,
            }),
            config,
            directory,
            manifest,
            deleted,
            barrels: Mutex::new(HashMap::new()),
            policy: Mutex::new(policy),
            merge_lock: Mutex::new(()),
            merge_tx: Mutex::new(merge_tx),
            progress: ProgressTracker::new(),
        });
        let worker = worker_rx.map(|rx| spawn_merge_worker(inner.clone(), rx));
        let manager = Self { inner, worker };

        if manager.inner.config.binlog {
            manager.recover(snapshot.max_doc_id())?;
        }
        for plan in restored {
            manager.inner.schedule(plan);
        }
        info!(
            barrels = snapshot.len(),
            docs = snapshot.total_doc_count(),
            deleted = manager.inner.deleted.len(),
            "index opened"
        );
        Ok(manager)
    }

    /// Re-index logged documents that never reached a barrel
    ///
    /// The records still owed a barrel become the new log before any of them
    /// is indexed; records the index would refuse are dropped with a warning.
    fn recover(&self, flushed_max: Option<DocId>) -> Result<()> {
        let replay = Binlog::replay(self.inner.directory.as_ref())?;
        let mut state = self.inner.writer.lock();
        let mut last = state.last_doc_id;
        let mut pending = Vec::new();
        for doc in replay.documents {
            if flushed_max.is_some_and(|max| doc.doc_id <= max) {
                continue;
            }
            if let Err(e) = check_next(last, &doc) {
                warn!(doc_id = doc.doc_id, error = %e, "binlog record skipped");
                continue;
            }
            last = Some(doc.doc_id);
            pending.push(doc);
        }
        state.binlog = Some(Binlog::rewrite(self.inner.directory.clone(), &pending)?);

        let recovered = pending.len();
        let mut logged = true;
        for doc in pending {
            if !logged {
                if let Some(binlog) = &mut state.binlog {
                    binlog.append(&doc)?;
                }
            }
            self.inner.add_locked(&mut state, doc)?;
            // a flush truncated the log, later records must be written again
            logged &= state.binlog.as_ref().map_or(true, |b| !b.is_empty());
        }
        if recovered > 0 || replay.torn_records > 0 {
            info!(recovered, torn = replay.torn_records, "recovered documents from binlog");
        }
        Ok(())
    }

    pub fn config(&self) -> &IndexManagerConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.inner.directory
    }

    /// Index one analyzed document; ids must grow strictly
    pub fn add_document(&self, doc: IndexerDocument) -> Result<()> {
        let mut state = self.inner.writer.lock();
        self.inner.add_logged(&mut state, doc)
    }

    /// Tombstone a document; false if it already was
    pub fn delete_document(&self, doc_id: DocId) -> Result<bool> {
        let known = self
            .inner
            .writer
            .lock()
            .last_doc_id
            .is_some_and(|last| doc_id <= last);
        if !known {
            return Err(IndexError::InvalidArgument(format!(
                "doc {} was never indexed",
                doc_id
            )));
        }
        self.inner.deleted.delete(doc_id)
    }

    /// Write the in-memory barrel out and hand it to the merge policy
    pub fn flush(&self) -> Result<Option<BarrelInfo>> {
        let mut state = self.inner.writer.lock();
        self.inner.flush_locked(&mut state)
    }

    /// Merge every flushed barrel into one
    pub fn optimize(&self) -> Result<()> {
        self.flush()?;
        self.wait_for_merges();
        let plan = self.inner.policy.lock().optimize();
        if let Some(plan) = plan {
            self.inner.run_plan(plan)?;
        }
        Ok(())
    }

    /// Block until the merge worker is idle
    pub fn wait_for_merges(&self) {
        let tx = self.inner.merge_tx.lock().clone();
        let Some(tx) = tx else {
            return;
        };
        let (ack_tx, ack_rx) = channel::bounded(1);
        if tx.send(MergeRequest::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Snapshot reader over every searchable barrel
    pub fn reader(&self) -> Result<MultiIndexBarrelReader> {
        let inner = &self.inner;
        let mut writer = inner.config.realtime.then(|| inner.writer.lock());
        let realtime = match writer.as_deref_mut() {
            Some(state) => state.realtime_snapshot()?,
            None => None,
        };

        let deleted = inner.deleted.snapshot();
        let mut cache = inner.barrels.lock();
        let manifest = inner.manifest.snapshot();
        let mut readers = Vec::with_capacity(manifest.len() + 1);
        for info in manifest.iter().filter(|b| b.searchable) {
            let files = match cache.get(&info.id) {
                Some(files) => files.clone(),
                None => {
                    let files = BarrelFiles::open(inner.directory.clone(), info.clone())?;
                    cache.insert(info.id, files.clone());
                    files
                }
            };
            readers.push(SingleIndexBarrelReader::new(files, deleted.clone()));
        }
        drop(cache);
        drop(writer);

        if let Some(files) = realtime {
            readers.push(SingleIndexBarrelReader::new(files, deleted.clone()));
        }
        Ok(MultiIndexBarrelReader::new(readers))
    }

    /// Per-document field lengths written so far
    pub fn doc_lengths(&self) -> Result<DocLengthReader> {
        let mut state = self.inner.writer.lock();
        state.doc_lengths.flush()?;
        DocLengthReader::open(
            self.inner.directory.as_ref(),
            self.inner.config.schema.num_indexed_properties(),
        )
    }

    pub fn barrels(&self) -> Arc<BarrelsInfo> {
        self.inner.manifest.snapshot()
    }

    pub fn deleted_docs(&self) -> Arc<RoaringBitmap> {
        self.inner.deleted.snapshot()
    }

    pub fn progress(&self) -> IndexingProgressStatus {
        self.inner.progress.status()
    }

    pub fn set_total_document_count(&self, total: u64) {
        self.inner.progress.set_total(total);
    }

    /// Flush, finish pending merges and release the files
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.wait_for_merges();
        let plans = self.inner.policy.lock().end_merge();
        for plan in plans {
            self.inner.run_plan(plan)?;
        }
        self.stop_worker();

        let mut state = self.inner.writer.lock();
        state.doc_lengths.flush()?;
        if let Some(binlog) = state.binlog.take() {
            binlog.close()?;
        }
        info!(barrels = self.inner.manifest.snapshot().len(), "index closed");
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.inner.merge_tx.lock().take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("merge worker panicked");
            }
        }
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl WriterState {
    fn realtime_snapshot(&mut self) -> Result<Option<Arc<BarrelFiles>>> {
        if self.snapshot.is_none() {
            if let Some(barrel) = &self.barrel {
                self.snapshot = barrel.snapshot()?;
            }
        }
        Ok(self.snapshot.clone())
    }
}

impl ManagerInner {
    /// Validate, append to the binlog, then index
    ///
    /// Nothing is logged for a document the barrel would refuse.
    fn add_logged(&self, state: &mut WriterState, doc: IndexerDocument) -> Result<()> {
        check_next(state.last_doc_id, &doc)?;
        if let Some(binlog) = &mut state.binlog {
            binlog.append(&doc)?;
        }
        self.add_locked(state, doc)
    }

    fn add_locked(&self, state: &mut WriterState, doc: IndexerDocument) -> Result<()> {
        if state.barrel.is_none() {
            let id = self.manifest.update(|m| Ok(m.allocate_barrel_id()))?;
            let writer = IndexBarrelWriter::new(
                BarrelInfo::new(id, BarrelInfo::flushed_name(id)),
                &self.config.schema,
                self.config.posting,
                self.config.memory,
            )?;
            debug!(barrel = %writer.info().name, "new in-memory barrel");
            state.barrel = Some(writer);
        }
        let Some(barrel) = state.barrel.as_mut() else {
            return Err(IndexError::collapse("no in-memory barrel"));
        };
        if let Err(e) = barrel.add_document(&doc, &mut state.doc_lengths) {
            if barrel.info().contains(doc.doc_id) {
                // part of the document reached the postings
                state.last_doc_id = Some(doc.doc_id);
                state.snapshot = None;
                self.deleted.delete(doc.doc_id)?;
                warn!(doc_id = doc.doc_id, error = %e, "partially indexed document deleted");
            }
            return Err(e);
        }
        let full = barrel.is_cache_full();
        state.last_doc_id = Some(doc.doc_id);
        state.snapshot = None;
        self.progress.record_indexed(1);

        if full {
            self.flush_locked(state)?;
        }
        Ok(())
    }

    fn flush_locked(&self, state: &mut WriterState) -> Result<Option<BarrelInfo>> {
        state.doc_lengths.flush()?;
        let barrel = match state.barrel.take() {
            Some(barrel) if !barrel.is_empty() => Some(barrel),
            _ => None,
        };
        state.snapshot = None;
        let Some(mut barrel) = barrel else {
            // nothing unflushed, any logged record is obsolete
            if let Some(binlog) = &mut state.binlog {
                binlog.reset()?;
            }
            return Ok(None);
        };

        let info = match barrel.write(self.directory.as_ref()) {
            Ok(info) => info,
            Err(e) => {
                state.barrel = Some(barrel);
                return Err(e);
            }
        };
        if let Err(e) = self.manifest.update(|m| m.add_barrel(info.clone())) {
            self.delete_barrel_files(&info);
            return Err(e);
        }
        if let Some(binlog) = &mut state.binlog {
            binlog.reset()?;
        }

        let entry = MergeBarrelEntry::new(self.directory.clone(), info.clone());
        let planned = self.policy.lock().add_barrel(entry);
        match planned {
            Ok(Some(plan)) => self.schedule(plan),
            Ok(None) => {}
            Err(e) if e.is_benign() => debug!(error = %e, "barrel not queued for merging"),
            Err(e) => warn!(error = %e, "merge policy rejected barrel"),
        }
        Ok(Some(info))
    }

    fn schedule(&self, plan: MergePlan) {
        let tx = self.merge_tx.lock().clone();
        match tx {
            Some(tx) => {
                if let Err(channel::SendError(MergeRequest::Merge(plan))) =
                    tx.send(MergeRequest::Merge(plan))
                {
                    warn!("merge worker gone, plan dropped");
                    self.policy.lock().merge_failed(plan);
                }
            }
            None => {
                if let Err(e) = self.run_plan(plan) {
                    error!(error = %e, "merge failed");
                }
            }
        }
    }

    /// Run `plan` and whatever merges it cascades into
    fn run_plan(&self, plan: MergePlan) -> Result<()> {
        let mut next = Some(plan);
        while let Some(plan) = next.take() {
            match self.merge_once(&plan) {
                Ok(cascade) => next = cascade,
                Err(e) => {
                    self.policy.lock().merge_failed(plan);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn merge_once(&self, plan: &MergePlan) -> Result<Option<MergePlan>> {
        let _merging = self.merge_lock.lock();
        self.policy.lock().merge_started(plan);
        info!(
            barrels = plan.queue.len(),
            docs = plan.queue.total_docs(),
            level = plan.level,
            reason = ?plan.reason,
            "merge started"
        );

        let (id, name) = self
            .manifest
            .update(|m| Ok((m.allocate_barrel_id(), m.next_merged_name(plan.level))))?;
        let mut target = BarrelInfo::new(id, name);
        target.level = plan.level;
        let deleted = self.deleted.snapshot();
        let merged = self
            .merger
            .merge(&plan.queue, &deleted, self.directory.as_ref(), target)?;

        let sources = plan.queue.ids();
        {
            let mut cache = self.barrels.lock();
            if let Err(e) = self.manifest.update(|m| m.replace(&sources, merged.clone())) {
                drop(cache);
                self.delete_barrel_files(&merged);
                return Err(e);
            }
            for entry in plan.queue.entries() {
                match cache.remove(&entry.id()) {
                    Some(files) => files.mark_obsolete(),
                    None => self.delete_barrel_files(&entry.barrel),
                }
            }
        }
        info!(barrel = %merged.name, docs = merged.doc_count, "merge committed");

        let entry = MergeBarrelEntry::new(self.directory.clone(), merged);
        self.policy.lock().add_merged_barrel(plan, Some(entry))
    }

    fn delete_barrel_files(&self, info: &BarrelInfo) {
        for file in info.files() {
            if let Err(e) = delete_if_exists(self.directory.as_ref(), &file) {
                warn!(file = %file, error = %e, "failed to delete barrel file");
            }
        }
    }
}

fn spawn_merge_worker(inner: Arc<ManagerInner>, rx: Receiver<MergeRequest>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(request) = rx.recv() {
            match request {
                MergeRequest::Merge(plan) => {
                    if let Err(e) = inner.run_plan(plan) {
                        error!(error = %e, "background merge failed");
                    }
                }
                MergeRequest::Sync(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("merge worker stopped");
    })
}

/// Delete barrel files the manifest does not know, left by interrupted
/// flushes and merges
/// Whether `doc` may follow `last` into the index
fn check_next(last: Option<DocId>, doc: &IndexerDocument) -> Result<()> {
    if let Some(last) = last {
        if doc.doc_id <= last {
            return Err(IndexError::InvalidArgument(format!(
                "doc {} does not follow doc {}",
                doc.doc_id, last
            )));
        }
    }
    doc.validate()
}

fn remove_orphans(directory: &dyn Directory, manifest: &BarrelsInfo) -> Result<()> {
    let live = manifest.stems();
    let mut removed = 0usize;
    for file in directory.list_files()? {
        let orphan = file == MANIFEST_TMP_FILE
            || file == BINLOG_TMP_FILE
            || barrel_stem(&file).is_some_and(|stem| !live.contains(stem));
        if orphan {
            delete_if_exists(directory, &file)?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(files = removed, "removed orphaned index files");
    }
    Ok(())
}
