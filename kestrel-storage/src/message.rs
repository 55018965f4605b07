//! The message record and its identifiers.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// Identifier for a stored message.
///
/// Opaque to the storage stack; the broker assigns it and guarantees
/// uniqueness for the broker's lifetime. Ordering is lexicographic, which is
/// also the stack's age order within a destination (the broker allocates ids
/// monotonically).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a connected client, used as the claimant of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A message owned by the storage stack.
///
/// Immutable once built, with one exception: `claimant` tracks the exclusive
/// assignment of the message to a client and is updated in place by the
/// engine that owns the record at the time.
///
/// `size` is recorded at build time so it survives the body being split off
/// by the body store.
#[derive(Debug, Clone)]
pub struct Message {
    /// Globally unique message id.
    pub id: MessageId,
    /// The queue this message was sent to.
    pub destination: String,
    /// Whether the message must survive a broker restart.
    pub persistent: bool,
    /// Opaque payload bytes.
    pub body: Arc<[u8]>,
    /// Seconds since epoch at receive time.
    pub timestamp: u64,
    /// Body length in bytes at receive time.
    pub size: u64,
    /// The client this message is exclusively assigned to, if any.
    pub claimant: Option<ClientId>,
}

impl Message {
    /// Create a new `Message` builder.
    #[must_use]
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// A copy of this message with the body stripped.
    ///
    /// `size` still reports the original body length.
    #[must_use]
    pub fn without_body(&self) -> Self {
        Self {
            body: Arc::from(&[][..]),
            ..self.clone()
        }
    }

    /// A copy of this message carrying `body`.
    #[must_use]
    pub fn with_body(mut self, body: Arc<[u8]>) -> Self {
        self.body = body;
        self
    }

    /// Whether this message may be handed to `client`.
    #[must_use]
    pub fn claimable_by(&self, client: ClientId) -> bool {
        match self.claimant {
            None => true,
            Some(owner) => owner == client,
        }
    }
}

/// Error type for `MessageBuilder` validation failures.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    destination: Option<String>,
    persistent: bool,
    body: Option<Arc<[u8]>>,
    timestamp: Option<u64>,
}

impl MessageBuilder {
    /// Set the message id.
    #[must_use]
    pub fn id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the destination queue name.
    #[must_use]
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Mark the message persistent (default: not persistent).
    #[must_use]
    pub const fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the payload (default: empty).
    #[must_use]
    pub fn body(mut self, body: impl Into<Arc<[u8]>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the receive timestamp in seconds since epoch.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Build the final [`Message`].
    ///
    /// # Errors
    /// Returns `BuilderError::MissingField` if `id`, `destination`, or
    /// `timestamp` is not set.
    pub fn build(self) -> Result<Message, BuilderError> {
        let body = self.body.unwrap_or_else(|| Arc::from(&[][..]));
        let size = body.len() as u64;

        Ok(Message {
            id: self.id.ok_or(BuilderError::MissingField("id"))?,
            destination: self
                .destination
                .ok_or(BuilderError::MissingField("destination"))?,
            persistent: self.persistent,
            body,
            timestamp: self
                .timestamp
                .ok_or(BuilderError::MissingField("timestamp"))?,
            size,
            claimant: None,
        })
    }
}
