//! The storage engine contract.
//!
//! Every engine in the stack (the memory front store, the SQLite metadata
//! store, the body-on-disk store, and the decorators over them) implements
//! [`Storage`]. Wrapping engines delegate most operations to their inner
//! engine while interposing their own logic.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::Result,
    message::{ClientId, Message, MessageId},
};

/// Asynchronous message storage.
///
/// Operations resolve once their effect is visible to subsequent operations
/// on the same engine. None of them can be cancelled from the outside; an
/// operation that has started always runs to completion, and
/// [`Storage::shutdown`] waits for quiescence.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Insert `message`.
    ///
    /// Storing an id that already exists anywhere in the stack is a caller
    /// bug; engines are not required to detect it.
    ///
    /// # Errors
    /// Fails if the engine cannot accept the message (shutting down, disk or
    /// database failure).
    async fn store(&self, message: Message) -> Result<()>;

    /// Delete by id, returning one entry per requested id in request order:
    /// the removed message (body included) or `None` where the id was not
    /// found.
    ///
    /// # Errors
    /// Fails on disk or database failure; partial removal is possible.
    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>>;

    /// Delete by id without materialising the removed messages.
    ///
    /// The ACK path: engines that would otherwise read bodies back from disk
    /// just to discard them override this.
    ///
    /// # Errors
    /// As [`Storage::remove`].
    async fn discard(&self, ids: &[MessageId]) -> Result<()> {
        self.remove(ids).await.map(|_| ())
    }

    /// Remove and return every message in the engine.
    ///
    /// # Errors
    /// Fails on disk or database failure.
    async fn empty(&self) -> Result<Vec<Message>>;

    /// Find the oldest unclaimed message in `destination`, assign it to
    /// `client`, and return it. Returns `Ok(None)` when the destination has
    /// no claimable message.
    ///
    /// At most one claim per destination is in flight at a time; see
    /// [`crate::claim::DestinationGate`].
    ///
    /// # Errors
    /// Fails on database failure; the broker treats that the same as an
    /// empty destination.
    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>>;

    /// Clear the claimant of every message in `destination` claimed by
    /// `client`, making them claimable again.
    ///
    /// # Errors
    /// Fails on database failure.
    async fn disown(&self, destination: &str, client: ClientId) -> Result<()>;

    /// Read by id without touching claim state. One entry per requested id,
    /// in request order.
    ///
    /// # Errors
    /// Fails on disk or database failure.
    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>>;

    /// The single oldest message across all destinations, ties broken by id
    /// ascending.
    ///
    /// # Errors
    /// Fails on disk or database failure.
    async fn peek_oldest(&self) -> Result<Option<Message>>;

    /// Flush all pending work and refuse further stores.
    ///
    /// Once this resolves, the engine's durable state is complete: every
    /// accepted persistent message is on disk.
    ///
    /// # Errors
    /// Fails if pending work could not be flushed.
    async fn shutdown(&self) -> Result<()>;
}

// Smart pointers to an engine are engines too; the config layer leans on
// this to assemble boxed fronts, and tests keep an Arc aside to inspect a
// tier after handing it to a wrapping engine.
macro_rules! delegate_storage {
    ($pointer:ident) => {
        #[async_trait]
        impl<S: Storage + ?Sized> Storage for $pointer<S> {
            async fn store(&self, message: Message) -> Result<()> {
                (**self).store(message).await
            }

            async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
                (**self).remove(ids).await
            }

            async fn discard(&self, ids: &[MessageId]) -> Result<()> {
                (**self).discard(ids).await
            }

            async fn empty(&self) -> Result<Vec<Message>> {
                (**self).empty().await
            }

            async fn claim_and_retrieve(
                &self,
                destination: &str,
                client: ClientId,
            ) -> Result<Option<Message>> {
                (**self).claim_and_retrieve(destination, client).await
            }

            async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
                (**self).disown(destination, client).await
            }

            async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
                (**self).peek(ids).await
            }

            async fn peek_oldest(&self) -> Result<Option<Message>> {
                (**self).peek_oldest().await
            }

            async fn shutdown(&self) -> Result<()> {
                (**self).shutdown().await
            }
        }
    };
}

delegate_storage!(Box);
delegate_storage!(Arc);
