//! Single writer thread for every durable mutation.
//!
//! Callers push [`WriteCommand`]s onto a bounded channel. The thread blocks
//! for the first command, drains whatever else is already queued, and applies
//! the whole burst inside one transaction under the pool's write lock. Each
//! command gets its own savepoint so a failure rolls back only that command.
//! Replies are sent after commit, and the reference index is brought in line
//! with what committed before any reply goes out.
//!
//! Failures of fire-and-forget commands are kept per submitting thread and
//! handed to that thread's next [`DeferredWriter::sync`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use rayon::prelude::*;
use rusqlite::{Connection, Transaction};

use crate::db::{images, ConnectionPool};
use crate::error::{Result, StoreError};
use crate::index::ReferenceIndex;
use crate::media::{extract_metadata, ImageMetadata};
use crate::tasks::{self, TaskProgress, TaskUpdate};

/// Meta key set by the schema upgrade that added decoded columns.
pub const METADATA_STALE_KEY: &str = "metadata_stale";

/// Blobs decoded per parallel chunk during a metadata rebuild.
const REBUILD_CHUNK: usize = 64;

/// Failure messages kept per thread between syncs.
const MAX_HELD_FAILURES: usize = 32;

pub type Reply<T> = Sender<Result<T>>;

pub enum WriteCommand {
    AddTag { ids: Vec<i64>, tag: String },
    RemoveTag { ids: Vec<i64>, tag: String },
    SetDeleted { ids: Vec<i64>, deleted: bool },
    /// Replies with `(id, created)`. `metadata` is `None` for bytes that
    /// could not be decoded.
    InsertImage {
        hash: String,
        url: Option<String>,
        metadata: Option<ImageMetadata>,
        data: Vec<u8>,
        reply: Reply<(i64, bool)>,
    },
    ReplaceImageData {
        id: i64,
        data: Vec<u8>,
        metadata: ImageMetadata,
        reply: Reply<()>,
    },
    /// Cache fill; failures are logged and otherwise dropped.
    StoreThumbnail { id: i64, size: u32, data: Vec<u8> },
    PurgeDeleted { reply: Reply<Vec<i64>> },
    RebuildMetadata {
        progress: Option<Sender<TaskUpdate>>,
        cancel: Arc<AtomicBool>,
        reply: Reply<usize>,
    },
    MetaPut { key: String, value: String },
    /// Completes once every earlier command has committed. Reports failures
    /// of fire-and-forget commands the same thread submitted since its
    /// previous sync.
    Sync { reply: Reply<()> },
}

impl WriteCommand {
    fn label(&self) -> &'static str {
        match self {
            WriteCommand::AddTag { .. } => "add tag",
            WriteCommand::RemoveTag { .. } => "remove tag",
            WriteCommand::SetDeleted { .. } => "set deleted",
            WriteCommand::InsertImage { .. } => "insert image",
            WriteCommand::ReplaceImageData { .. } => "replace image data",
            WriteCommand::StoreThumbnail { .. } => "store thumbnail",
            WriteCommand::PurgeDeleted { .. } => "purge deleted",
            WriteCommand::RebuildMetadata { .. } => "rebuild metadata",
            WriteCommand::MetaPut { .. } => "meta put",
            WriteCommand::Sync { .. } => "sync",
        }
    }

    /// Ids the facade already changed in the index for this command.
    fn optimistic_ids(&self) -> &[i64] {
        match self {
            WriteCommand::AddTag { ids, .. }
            | WriteCommand::RemoveTag { ids, .. }
            | WriteCommand::SetDeleted { ids, .. } => ids,
            _ => &[],
        }
    }

    /// Fire-and-forget commands whose failure the submitter hears about on sync.
    fn reports_on_sync(&self) -> bool {
        matches!(
            self,
            WriteCommand::AddTag { .. }
                | WriteCommand::RemoveTag { .. }
                | WriteCommand::SetDeleted { .. }
                | WriteCommand::MetaPut { .. }
        )
    }
}

struct Envelope {
    origin: ThreadId,
    command: WriteCommand,
}

/// A reply held back until the batch commits.
enum Pending {
    Insert(Reply<(i64, bool)>, Result<(i64, bool)>),
    Replace(Reply<()>, Result<()>),
    Purge(Reply<Vec<i64>>, Result<Vec<i64>>),
    Rebuild(Reply<usize>, Result<usize>),
    Sync(Reply<()>, ThreadId),
}

/// Fire-and-forget failures waiting for their submitter's next sync.
#[derive(Default)]
struct Failures(HashMap<ThreadId, Vec<String>>);

impl Failures {
    fn record(&mut self, origin: ThreadId, message: String) {
        let held = self.0.entry(origin).or_default();
        if held.len() < MAX_HELD_FAILURES {
            held.push(message);
        }
    }

    fn take(&mut self, origin: ThreadId) -> Option<String> {
        self.0.remove(&origin).map(|held| held.join("; "))
    }

    fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
struct Batch {
    pending: Vec<Pending>,
    /// One entry per id per optimistic command.
    optimistic: Vec<i64>,
    /// Optimistic ids whose command failed.
    stale: Vec<i64>,
    origins: HashSet<ThreadId>,
    inserted: Vec<i64>,
    replaced: Vec<i64>,
    purged: Vec<i64>,
    rebuilt: bool,
}

impl Batch {
    fn track(&mut self, envelope: &Envelope) {
        self.optimistic.extend_from_slice(envelope.command.optimistic_ids());
        if envelope.command.reports_on_sync() {
            self.origins.insert(envelope.origin);
        }
    }
}

/// Handle to the writer thread. Dropping it drains the queue and joins.
pub struct DeferredWriter {
    sender: Mutex<Option<SyncSender<Envelope>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredWriter {
    pub fn spawn(
        pool: Arc<ConnectionPool>,
        index: Arc<ReferenceIndex>,
        queue_capacity: usize,
    ) -> Result<Self> {
        let conn = pool.open_dedicated()?;
        let (sender, receiver) = mpsc::sync_channel(queue_capacity.max(1));

        let handle = thread::Builder::new()
            .name("thumper-writer".into())
            .spawn(move || writer_loop(conn, pool, index, receiver))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a command on behalf of the current thread. Blocks while the
    /// queue is full.
    pub fn submit(&self, command: WriteCommand) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(stopped)?;
        let envelope = Envelope {
            origin: thread::current().id(),
            command,
        };
        sender.send(envelope).map_err(|_| stopped())
    }

    /// Queue a command built around a reply channel and wait for its result.
    pub fn request<T>(&self, build: impl FnOnce(Reply<T>) -> WriteCommand) -> Result<T> {
        let (tx, rx) = mpsc::channel();
        self.submit(build(tx))?;
        rx.recv().map_err(|_| stopped())?
    }

    /// Block until everything this thread queued has committed.
    pub fn sync(&self) -> Result<()> {
        self.request(|reply| WriteCommand::Sync { reply })
    }

    /// Close the queue, let the thread finish what is queued, and join it.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(sender);

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.join() {
                tracing::error!(?e, "Writer thread panicked");
            }
        }
    }
}

impl Drop for DeferredWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stopped() -> StoreError {
    StoreError::Transaction("writer thread has shut down".into())
}

fn writer_loop(
    mut conn: Connection,
    pool: Arc<ConnectionPool>,
    index: Arc<ReferenceIndex>,
    receiver: Receiver<Envelope>,
) {
    tracing::debug!("Writer thread started");
    let mut failures = Failures::default();

    while let Ok(first) = receiver.recv() {
        let mut envelopes = vec![first];
        envelopes.extend(receiver.try_iter());
        run_batch(&mut conn, &pool, &index, envelopes, &mut failures);
    }

    let unreported = failures.len();
    if unreported > 0 {
        tracing::warn!(count = unreported, "Writer stopped with unreported failures");
    }
    tracing::debug!("Writer thread stopped");
}

fn run_batch(
    conn: &mut Connection,
    pool: &ConnectionPool,
    index: &ReferenceIndex,
    envelopes: Vec<Envelope>,
    failures: &mut Failures,
) {
    let count = envelopes.len();
    let mut batch = Batch::default();

    let commit_error = {
        let _lock = pool.write_lock();
        match conn.transaction() {
            Ok(mut tx) => {
                for envelope in envelopes {
                    batch.track(&envelope);
                    apply(&mut tx, envelope, &mut batch, failures);
                }
                tx.commit().err().map(|e| e.to_string())
            }
            Err(e) => {
                let reason = e.to_string();
                for envelope in envelopes {
                    batch.track(&envelope);
                    reject(envelope, &reason, &mut batch);
                }
                Some(reason)
            }
        }
    };

    match &commit_error {
        None => tracing::debug!(commands = count, "Committed write batch"),
        Some(e) => {
            tracing::error!(commands = count, error = %e, "Write batch rolled back");
            for &origin in &batch.origins {
                failures.record(origin, format!("batch of {} commands rolled back: {}", count, e));
            }
        }
    }

    refresh_index(conn, index, &batch, commit_error.is_some());

    for pending in batch.pending {
        match pending {
            Pending::Insert(reply, result) => {
                let _ = reply.send(settle(result, commit_error.as_deref()));
            }
            Pending::Replace(reply, result) => {
                let _ = reply.send(settle(result, commit_error.as_deref()));
            }
            Pending::Purge(reply, result) => {
                let _ = reply.send(settle(result, commit_error.as_deref()));
            }
            Pending::Rebuild(reply, result) => {
                let _ = reply.send(settle(result, commit_error.as_deref()));
            }
            Pending::Sync(reply, origin) => {
                let own = failures.take(origin);
                let result = match (&commit_error, own) {
                    (Some(e), _) => Err(StoreError::Transaction(e.clone())),
                    (None, Some(held)) => Err(StoreError::Transaction(held)),
                    (None, None) => Ok(()),
                };
                let _ = reply.send(result);
            }
        }
    }
}

fn settle<T>(result: Result<T>, commit_error: Option<&str>) -> Result<T> {
    match (result, commit_error) {
        (Ok(_), Some(e)) => Err(StoreError::Transaction(e.to_string())),
        (result, _) => result,
    }
}

fn in_savepoint<T>(tx: &mut Transaction<'_>, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let sp = tx.savepoint()?;
    let value = f(&sp)?;
    sp.commit()?;
    Ok(value)
}

/// Log and hold a fire-and-forget failure; marks the command's optimistic ids stale.
fn fire_and_forget(
    origin: ThreadId,
    label: &str,
    ids: &[i64],
    result: Result<()>,
    batch: &mut Batch,
    failures: &mut Failures,
) {
    if let Err(e) = result {
        tracing::warn!(command = label, error = %e, "Write command failed");
        failures.record(origin, format!("{}: {}", label, e));
        batch.stale.extend_from_slice(ids);
    }
}

fn apply(tx: &mut Transaction<'_>, envelope: Envelope, batch: &mut Batch, failures: &mut Failures) {
    let Envelope { origin, command } = envelope;
    let label = command.label();
    match command {
        WriteCommand::AddTag { ids, tag } => {
            let result = in_savepoint(tx, |c| images::add_tag(c, &ids, &tag).map(drop));
            fire_and_forget(origin, label, &ids, result, batch, failures);
        }
        WriteCommand::RemoveTag { ids, tag } => {
            let result = in_savepoint(tx, |c| images::remove_tag(c, &ids, &tag).map(drop));
            fire_and_forget(origin, label, &ids, result, batch, failures);
        }
        WriteCommand::SetDeleted { ids, deleted } => {
            let result = in_savepoint(tx, |c| images::set_deleted(c, &ids, deleted).map(drop));
            fire_and_forget(origin, label, &ids, result, batch, failures);
        }
        WriteCommand::InsertImage {
            hash,
            url,
            metadata,
            data,
            reply,
        } => {
            let result = in_savepoint(tx, |c| {
                images::insert_image(c, &hash, url.as_deref(), metadata.as_ref(), &data)
            });
            if let Ok((id, true)) = result {
                batch.inserted.push(id);
            }
            batch.pending.push(Pending::Insert(reply, result));
        }
        WriteCommand::ReplaceImageData {
            id,
            data,
            metadata,
            reply,
        } => {
            let result = in_savepoint(tx, |c| images::replace_image_data(c, id, &data, &metadata));
            if result.is_ok() {
                batch.replaced.push(id);
            }
            batch.pending.push(Pending::Replace(reply, result));
        }
        WriteCommand::StoreThumbnail { id, size, data } => {
            match in_savepoint(tx, |c| images::store_thumbnail(c, id, size, &data)) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(id, size, "Dropped rendition of a missing image"),
                Err(e) => tracing::warn!(id, size, error = %e, "Couldn't store rendition"),
            }
        }
        WriteCommand::PurgeDeleted { reply } => {
            let result = in_savepoint(tx, images::purge_deleted);
            if let Ok(ids) = &result {
                batch.purged.extend_from_slice(ids);
            }
            batch.pending.push(Pending::Purge(reply, result));
        }
        WriteCommand::RebuildMetadata {
            progress,
            cancel,
            reply,
        } => {
            let result = in_savepoint(tx, |c| rebuild_metadata(c, progress.as_ref(), &cancel));
            match &result {
                Ok(_) => batch.rebuilt = true,
                Err(e) => tasks::report(
                    progress.as_ref(),
                    TaskUpdate::Failed { error: e.to_string() },
                ),
            }
            batch.pending.push(Pending::Rebuild(reply, result));
        }
        WriteCommand::MetaPut { key, value } => {
            let result = in_savepoint(tx, |c| images::meta_put(c, &key, &value));
            fire_and_forget(origin, label, &[], result, batch, failures);
        }
        WriteCommand::Sync { reply } => batch.pending.push(Pending::Sync(reply, origin)),
    }
}

/// Fail a command without touching the database. Fire-and-forget commands
/// are reported through the batch's rollback.
fn reject(envelope: Envelope, reason: &str, batch: &mut Batch) {
    let err = || StoreError::Transaction(reason.to_string());
    match envelope.command {
        WriteCommand::InsertImage { reply, .. } => batch.pending.push(Pending::Insert(reply, Err(err()))),
        WriteCommand::ReplaceImageData { reply, .. } => {
            batch.pending.push(Pending::Replace(reply, Err(err())))
        }
        WriteCommand::PurgeDeleted { reply } => batch.pending.push(Pending::Purge(reply, Err(err()))),
        WriteCommand::RebuildMetadata { reply, .. } => {
            batch.pending.push(Pending::Rebuild(reply, Err(err())))
        }
        WriteCommand::Sync { reply } => batch.pending.push(Pending::Sync(reply, envelope.origin)),
        _ => {}
    }
}

/// Bring the index in line with what committed.
///
/// New rows are loaded whole; re-encoded and rebuilt rows only have their
/// decoded columns copied so tags and deletion flags changed since stay.
fn refresh_index(conn: &Connection, index: &ReferenceIndex, batch: &Batch, rolled_back: bool) {
    if !rolled_back {
        index.remove(&batch.purged);
        if let Err(e) = apply_committed(conn, index, batch) {
            tracing::error!(error = %e, "Couldn't refresh reference index");
        }
    }

    let stale = if rolled_back { &batch.optimistic } else { &batch.stale };
    if let Err(e) = index.settle(conn, &batch.optimistic, stale) {
        tracing::error!(error = %e, "Couldn't reload index records after failed writes");
    }
}

fn apply_committed(conn: &Connection, index: &ReferenceIndex, batch: &Batch) -> Result<()> {
    index.reload(conn, &batch.inserted)?;
    let rows = if batch.rebuilt {
        images::load_images(conn)?
    } else {
        batch
            .replaced
            .iter()
            .filter_map(|&id| images::load_image(conn, id).transpose())
            .collect::<Result<Vec<_>>>()?
    };
    index.apply_metadata(rows);
    Ok(())
}

/// Recompute decoded metadata for every image and drop all renditions.
///
/// Runs inside the caller's savepoint; a cancel request returns an error so
/// the whole rebuild rolls back.
fn rebuild_metadata(
    conn: &Connection,
    progress: Option<&Sender<TaskUpdate>>,
    cancel: &AtomicBool,
) -> Result<usize> {
    images::clear_thumbnails(conn)?;

    let ids = images::all_ids(conn)?;
    let total = ids.len();
    tasks::report(progress, TaskUpdate::Started { total });
    tracing::info!(total, "Rebuilding image metadata");

    let mut done = 0;
    let mut updated = 0;
    for chunk in ids.chunks(REBUILD_CHUNK) {
        if tasks::is_cancelled(cancel) {
            tasks::report(progress, TaskUpdate::Cancelled);
            return Err(StoreError::Transaction("metadata rebuild cancelled".into()));
        }

        let blobs = chunk
            .iter()
            .map(|&id| images::image_data(conn, id).map(|data| (id, data)))
            .collect::<Result<Vec<_>>>()?;

        let extracted: Vec<(i64, Result<ImageMetadata>)> = blobs
            .par_iter()
            .map(|(id, data)| (*id, extract_metadata(data)))
            .collect();

        for (id, metadata) in extracted {
            match metadata {
                Ok(metadata) => {
                    images::update_metadata(conn, id, &metadata)?;
                    updated += 1;
                }
                Err(e) => tracing::warn!(id, error = %e, "Skipping image during metadata rebuild"),
            }
            done += 1;
            tasks::report(
                progress,
                TaskUpdate::Progress(TaskProgress::new(done, total).with_item(id.to_string())),
            );
        }
    }

    images::meta_put(conn, METADATA_STALE_KEY, "0")?;
    tasks::report(
        progress,
        TaskUpdate::Completed {
            message: format!("Updated metadata for {} of {} images", updated, total),
        },
    );
    Ok(updated)
}
