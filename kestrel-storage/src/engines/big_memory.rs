//! Volatile in-process store, indexed flavor.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::RwLock,
};

use async_trait::async_trait;
use kestrel_common::LogName;

use crate::{
    error::Result,
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

/// The four indexes, always updated together so they agree.
#[derive(Debug, Default)]
struct Indexes {
    /// Primary: id to message.
    messages: HashMap<MessageId, Message>,
    /// Destination to its ids, oldest-id first.
    by_destination: HashMap<String, BTreeSet<MessageId>>,
    /// Claimant to the ids it holds, across all destinations.
    by_claimant: HashMap<ClientId, HashSet<MessageId>>,
    /// All ids ordered by (timestamp, id).
    by_age: BTreeSet<(u64, MessageId)>,
}

impl Indexes {
    fn insert(&mut self, message: Message) {
        let id = message.id.clone();
        self.by_destination
            .entry(message.destination.clone())
            .or_default()
            .insert(id.clone());
        if let Some(claimant) = message.claimant {
            self.by_claimant.entry(claimant).or_default().insert(id.clone());
        }
        self.by_age.insert((message.timestamp, id.clone()));
        self.messages.insert(id, message);
    }

    fn take(&mut self, id: &MessageId) -> Option<Message> {
        let message = self.messages.remove(id)?;
        if let Some(ids) = self.by_destination.get_mut(&message.destination) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_destination.remove(&message.destination);
            }
        }
        if let Some(claimant) = message.claimant {
            self.release_claim(claimant, id);
        }
        self.by_age.remove(&(message.timestamp, id.clone()));
        Some(message)
    }

    fn set_claimant(&mut self, id: &MessageId, claimant: Option<ClientId>) {
        let previous = match self.messages.get_mut(id) {
            Some(message) => std::mem::replace(&mut message.claimant, claimant),
            None => return,
        };
        if let Some(previous) = previous {
            self.release_claim(previous, id);
        }
        if let Some(client) = claimant {
            self.by_claimant.entry(client).or_default().insert(id.clone());
        }
    }

    fn release_claim(&mut self, client: ClientId, id: &MessageId) {
        if let Some(ids) = self.by_claimant.get_mut(&client) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_claimant.remove(&client);
            }
        }
    }
}

/// In-memory message store with secondary indexes.
///
/// Same semantics as [`crate::engines::MemoryStore`], different profile:
/// claims walk only the destination's own id set, disowns walk only the
/// claimant's id set, and the oldest message is the first entry of an
/// age-ordered set.
#[derive(Debug)]
pub struct BigMemoryStore {
    name: LogName,
    inner: RwLock<Indexes>,
}

impl BigMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: LogName::root("BIGMEMORY"),
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Replace the engine's log name (set by the assembling parent).
    #[must_use]
    pub fn named(mut self, name: LogName) -> Self {
        self.name = name;
        self
    }

    /// Number of resident messages.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .messages
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BigMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for BigMemoryStore {
    async fn store(&self, message: Message) -> Result<()> {
        tracing::debug!(target: "kestrel", engine = %self.name, id = %message.id, "storing message");
        self.inner.write()?.insert(message);
        Ok(())
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let mut inner = self.inner.write()?;
        Ok(ids.iter().map(|id| inner.take(id)).collect())
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        let mut inner = self.inner.write()?;
        let drained = std::mem::take(&mut *inner);
        Ok(drained.messages.into_values().collect())
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        let mut inner = self.inner.write()?;
        let candidate = inner.by_destination.get(destination).and_then(|ids| {
            ids.iter()
                .find(|id| {
                    inner
                        .messages
                        .get(*id)
                        .is_some_and(|m| m.claimant.is_none())
                })
                .cloned()
        });

        let Some(id) = candidate else {
            return Ok(None);
        };

        inner.set_claimant(&id, Some(client));
        tracing::debug!(
            target: "kestrel",
            engine = %self.name,
            id = %id,
            client = %client,
            "claimed message"
        );
        Ok(inner.messages.get(&id).cloned())
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        let mut inner = self.inner.write()?;
        let Some(held) = inner.by_claimant.get(&client) else {
            return Ok(());
        };

        let matching: Vec<MessageId> = held
            .iter()
            .filter(|id| {
                inner
                    .messages
                    .get(*id)
                    .is_some_and(|m| m.destination == destination)
            })
            .cloned()
            .collect();

        for id in matching {
            inner.set_claimant(&id, None);
        }
        Ok(())
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let inner = self.inner.read()?;
        Ok(ids.iter().map(|id| inner.messages.get(id).cloned()).collect())
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        let inner = self.inner.read()?;
        Ok(inner
            .by_age
            .first()
            .and_then(|(_, id)| inner.messages.get(id))
            .cloned())
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::debug!(target: "kestrel", engine = %self.name, "shutdown (volatile, nothing to flush)");
        Ok(())
    }
}
