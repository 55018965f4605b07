//! Body-on-disk store.
//!
//! Wraps a metadata store (the *info store*) and keeps each message body in
//! its own file, `<data_dir>/msg-<id>`, raw bytes with no framing. Writes to
//! the info store carry bodyless records; read paths rehydrate records with
//! their body from memory or disk.
//!
//! The pending-write table is the race ledger. A body lives there from the
//! moment `store` accepts it until its file is flushed, which pins down the
//! three orderings that would otherwise corrupt state:
//!
//! 1. remove before the write begins: the entry is taken out of the table
//!    before the writer task gets to it; the writer finds nothing and stops.
//! 2. remove while the write is in flight: the entry is flagged and the
//!    file is unlinked right after the flush, in the same lock scope that
//!    drops the entry.
//! 3. read before the write lands: rehydration serves the body straight
//!    from the table, and never cancels the write, because a claim can
//!    still be NACKed and the message must end up durable regardless.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use kestrel_common::{LogName, log};
use tokio::{fs, sync::Notify};

use crate::{
    claim::DestinationGate,
    error::{Result, StorageError},
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    /// Accepted, writer task not yet started.
    Queued,
    /// Writer task owns the file handle.
    Writing,
}

#[derive(Debug)]
struct PendingWrite {
    body: Arc<[u8]>,
    state: WriteState,
    delete_after_write: bool,
}

/// What became of an id's pending write when a removal consulted the table.
enum PendingClaim {
    /// No write pending; the body, if any, is on disk.
    None,
    /// The write had not begun and was aborted; no file will appear.
    Aborted(Arc<[u8]>),
    /// The write is in flight; its file will be unlinked after the flush.
    Deferred(Arc<[u8]>),
}

/// State shared with the detached writer tasks.
#[derive(Debug)]
struct BodyShared {
    name: LogName,
    data_dir: PathBuf,
    pending: Mutex<HashMap<MessageId, PendingWrite>>,
    /// Signalled whenever the pending table becomes empty.
    drained: Notify,
    accepting: AtomicBool,
}

impl BodyShared {
    /// File path for `id`, refusing ids that could escape the data dir.
    fn body_path(&self, id: &MessageId) -> Result<PathBuf> {
        let raw = id.as_str();
        if raw.contains('/') || raw.contains('\\') || raw.contains("..") {
            return Err(StorageError::Integrity(format!(
                "message id {raw:?} is not a valid file name"
            )));
        }
        Ok(self.data_dir.join(format!("msg-{raw}")))
    }

    fn pending_body(&self, id: &MessageId) -> Option<Arc<[u8]>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|pw| Arc::clone(&pw.body))
    }

    /// Consult the pending table on behalf of a removal.
    fn claim_pending(&self, id: &MessageId) -> PendingClaim {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.get_mut(id) {
            None => PendingClaim::None,
            Some(pw) if pw.state == WriteState::Queued => {
                let body = Arc::clone(&pw.body);
                pending.remove(id);
                if pending.is_empty() {
                    self.drained.notify_waiters();
                }
                PendingClaim::Aborted(body)
            }
            Some(pw) => {
                // Cancelling an active write would leak the file handle;
                // mark it and let the writer clean up after the flush.
                pw.delete_after_write = true;
                PendingClaim::Deferred(Arc::clone(&pw.body))
            }
        }
    }

    /// The detached writer task for one message body.
    async fn write_body(self: Arc<Self>, id: MessageId) {
        let body = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get_mut(&id) {
                // Removed before the write began
                None => return,
                Some(pw) => {
                    pw.state = WriteState::Writing;
                    Arc::clone(&pw.body)
                }
            }
        };

        let outcome = self.flush(&id, &body).await;

        {
            // Entry removal and the deferred unlink are one causal step: a
            // reader that no longer sees the entry must not see the file.
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = pending.remove(&id);
            if entry.is_some_and(|pw| pw.delete_after_write) {
                if let Ok(path) = self.body_path(&id) {
                    let _ = std::fs::remove_file(path);
                }
            }
            if pending.is_empty() {
                self.drained.notify_waiters();
            }
        }

        if let Err(e) = outcome {
            tracing::error!(
                target: "kestrel",
                engine = %self.name,
                id = %id,
                error = %e,
                "body write failed; the message will repair as missing on read"
            );
        }
    }

    /// Write to a temp file, then move it into place.
    async fn flush(&self, id: &MessageId, body: &[u8]) -> Result<()> {
        let path = self.body_path(id)?;
        let temp = self.data_dir.join(format!(".tmp-msg-{id}"));
        fs::write(&temp, body).await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn read_body_file(&self, id: &MessageId) -> Result<Option<Arc<[u8]>>> {
        let path = self.body_path(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Arc::from(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn take_body_file(&self, id: &MessageId) -> Result<Option<Arc<[u8]>>> {
        let Some(body) = self.read_body_file(id).await? else {
            return Ok(None);
        };
        match fs::remove_file(self.body_path(id)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Some(body))
    }
}

/// Storage decorator that splits bodies out to one file per message.
#[derive(Debug)]
pub struct BodyStore<S> {
    info: S,
    gate: DestinationGate,
    shared: Arc<BodyShared>,
}

impl<S: Storage> BodyStore<S> {
    /// Create a body store over `info`, keeping body files in `data_dir`
    /// (created if missing).
    ///
    /// # Errors
    /// Fails if the data directory cannot be created.
    pub fn new(info: S, data_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new_named(info, data_dir, LogName::root("BODY"))
    }

    /// As [`BodyStore::new`], with the engine name supplied by the
    /// assembling parent.
    ///
    /// # Errors
    /// Fails if the data directory cannot be created.
    pub fn new_named(info: S, data_dir: impl Into<PathBuf>, name: LogName) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        Ok(Self {
            info,
            gate: DestinationGate::new(),
            shared: Arc::new(BodyShared {
                name,
                data_dir,
                pending: Mutex::new(HashMap::new()),
                drained: Notify::new(),
                accepting: AtomicBool::new(true),
            }),
        })
    }

    /// Number of body writes accepted but not yet flushed.
    ///
    /// # Panics
    /// Panics if the pending table lock is poisoned.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The wrapped info store.
    pub fn info(&self) -> &S {
        &self.info
    }

    async fn rehydrate(&self, meta: Message) -> Result<Option<Message>> {
        // The body may still be on its way to disk; serve it from memory
        // and let the write finish.
        if let Some(body) = self.shared.pending_body(&meta.id) {
            return Ok(Some(meta.with_body(body)));
        }
        match self.shared.read_body_file(&meta.id).await? {
            Some(body) => Ok(Some(meta.with_body(body))),
            None => {
                // A row without a file: crash leftovers. Repair by dropping
                // the row and reporting the message gone (it was never
                // acknowledged as durable).
                log::emergency(
                    &self.shared.name,
                    &format!("no body file for stored message {}; removing the record", meta.id),
                );
                self.info.discard(std::slice::from_ref(&meta.id)).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<S: Storage> Storage for BodyStore<S> {
    async fn store(&self, message: Message) -> Result<()> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(StorageError::ShuttingDown);
        }
        // Validate the id before accepting anything
        self.shared.body_path(&message.id)?;

        tracing::debug!(
            target: "kestrel",
            engine = %self.shared.name,
            id = %message.id,
            size = message.size,
            "storing message, body queued for disk"
        );

        let meta = message.without_body();
        {
            // The entry must be visible before this method first suspends,
            // so a racing remove always finds it.
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.insert(
                message.id.clone(),
                PendingWrite {
                    body: Arc::clone(&message.body),
                    state: WriteState::Queued,
                    delete_after_write: false,
                },
            );
        }
        tokio::spawn(BodyShared::write_body(
            Arc::clone(&self.shared),
            message.id.clone(),
        ));

        if let Err(e) = self.info.store(meta).await {
            // The record was never accepted; unwind the body write too
            let _ = self.shared.claim_pending(&message.id);
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let claims: Vec<PendingClaim> =
            ids.iter().map(|id| self.shared.claim_pending(id)).collect();
        let metas = self.info.remove(ids).await?;

        let mut removed = Vec::with_capacity(ids.len());
        for ((id, meta), claim) in ids.iter().zip(metas).zip(claims) {
            let Some(meta) = meta else {
                removed.push(None);
                continue;
            };
            let body = match claim {
                PendingClaim::Aborted(body) | PendingClaim::Deferred(body) => body,
                PendingClaim::None => match self.shared.take_body_file(id).await? {
                    Some(body) => body,
                    None => {
                        log::emergency(
                            &self.shared.name,
                            &format!("no body file for removed message {id}"),
                        );
                        Arc::from(&[][..])
                    }
                },
            };
            removed.push(Some(meta.with_body(body)));
        }
        Ok(removed)
    }

    async fn discard(&self, ids: &[MessageId]) -> Result<()> {
        let claims: Vec<PendingClaim> =
            ids.iter().map(|id| self.shared.claim_pending(id)).collect();
        self.info.discard(ids).await?;

        for (id, claim) in ids.iter().zip(claims) {
            if matches!(claim, PendingClaim::None) {
                match fs::remove_file(self.shared.body_path(id)?).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        let metas = self.info.empty().await?;
        let mut removed = Vec::with_capacity(metas.len());
        for meta in metas {
            let body = match self.shared.claim_pending(&meta.id) {
                PendingClaim::Aborted(body) | PendingClaim::Deferred(body) => body,
                PendingClaim::None => self
                    .shared
                    .take_body_file(&meta.id)
                    .await?
                    .unwrap_or_else(|| Arc::from(&[][..])),
            };
            removed.push(meta.with_body(body));
        }
        Ok(removed)
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        // One claim per destination at a time, dispatched in arrival order
        let _permit = self.gate.acquire(destination).await;

        let Some(meta) = self.info.claim_and_retrieve(destination, client).await? else {
            return Ok(None);
        };
        self.rehydrate(meta).await
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        self.info.disown(destination, client).await
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let metas = self.info.peek(ids).await?;
        let mut found = Vec::with_capacity(ids.len());
        for meta in metas {
            match meta {
                None => found.push(None),
                Some(meta) => found.push(self.rehydrate(meta).await?),
            }
        }
        Ok(found)
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        match self.info.peek_oldest().await? {
            None => Ok(None),
            Some(meta) => self.rehydrate(meta).await,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        tracing::info!(
            target: "kestrel",
            engine = %self.shared.name,
            pending = self.pending_writes(),
            "shutting down, waiting for body writes to land"
        );

        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self
                .shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
            {
                break;
            }
            notified.await;
        }

        self.info.shutdown().await
    }
}
