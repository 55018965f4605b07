//! Volatile in-process store, linear-scan flavor.

use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;
use kestrel_common::LogName;

use crate::{
    error::Result,
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

/// In-memory message store backed by a single ordered map.
///
/// Claims scan the map in id order until an unclaimed message for the
/// destination turns up; correct and simple, O(n) per claim. Fine as the
/// front tier of a two-tier stack, where the map holds only the last few
/// seconds of traffic. For large resident sets use
/// [`crate::engines::BigMemoryStore`].
///
/// Holds nothing durable; [`Storage::shutdown`] is a no-op.
#[derive(Debug)]
pub struct MemoryStore {
    name: LogName,
    messages: RwLock<BTreeMap<MessageId, Message>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: LogName::root("MEMORY"),
            messages: RwLock::new(BTreeMap::new()),
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
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn store(&self, message: Message) -> Result<()> {
        tracing::debug!(target: "kestrel", engine = %self.name, id = %message.id, "storing message");
        self.messages.write()?.insert(message.id.clone(), message);
        Ok(())
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let mut messages = self.messages.write()?;
        Ok(ids.iter().map(|id| messages.remove(id)).collect())
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        let mut messages = self.messages.write()?;
        let drained = std::mem::take(&mut *messages);
        Ok(drained.into_values().collect())
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        let mut messages = self.messages.write()?;
        for message in messages.values_mut() {
            if message.destination == destination && message.claimant.is_none() {
                message.claimant = Some(client);
                tracing::debug!(
                    target: "kestrel",
                    engine = %self.name,
                    id = %message.id,
                    client = %client,
                    "claimed message"
                );
                return Ok(Some(message.clone()));
            }
        }
        Ok(None)
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        let mut messages = self.messages.write()?;
        for message in messages.values_mut() {
            if message.destination == destination && message.claimant == Some(client) {
                message.claimant = None;
            }
        }
        Ok(())
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let messages = self.messages.read()?;
        Ok(ids.iter().map(|id| messages.get(id).cloned()).collect())
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        let messages = self.messages.read()?;
        // Map iteration is id-ascending, so the first hit for the minimal
        // timestamp is already the id tie-break winner.
        let mut oldest: Option<&Message> = None;
        for message in messages.values() {
            match oldest {
                Some(best) if best.timestamp <= message.timestamp => {}
                _ => oldest = Some(message),
            }
        }
        Ok(oldest.cloned())
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::debug!(target: "kestrel", engine = %self.name, "shutdown (volatile, nothing to flush)");
        Ok(())
    }
}
