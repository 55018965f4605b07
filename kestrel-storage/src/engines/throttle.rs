//! Bounded-concurrency store decorator.
//!
//! Back-store writes (disk I/O under a metadata insert) are the stack's
//! bottleneck; under burst load this queue absorbs the spike instead of
//! letting the kernel buffer an unbounded pile of writes.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_common::LogName;
use tokio::sync::Semaphore;

use crate::{
    error::{Result, StorageError},
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

/// Caps the number of in-flight `store` calls against the inner engine at
/// `max_in_flight`; excess stores queue in arrival order. Every other
/// operation passes straight through.
#[derive(Debug)]
pub struct Throttle<S> {
    inner: S,
    name: LogName,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl<S: Storage> Throttle<S> {
    /// Default bound on concurrent inner stores.
    pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

    /// Wrap `inner`, allowing at most `max_in_flight` concurrent stores.
    #[must_use]
    pub fn new(inner: S, max_in_flight: usize) -> Self {
        Self {
            inner,
            name: LogName::root("THROTTLE"),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Replace the engine's log name (set by the assembling parent).
    #[must_use]
    pub fn named(mut self, name: LogName) -> Self {
        self.name = name;
        self
    }

    /// The configured bound.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// The wrapped engine.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Storage> Storage for Throttle<S> {
    async fn store(&self, message: Message) -> Result<()> {
        // The semaphore queue is FIFO, so stores dispatch in arrival order
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StorageError::ShuttingDown)?;
        self.inner.store(message).await
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        self.inner.remove(ids).await
    }

    async fn discard(&self, ids: &[MessageId]) -> Result<()> {
        self.inner.discard(ids).await
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        self.inner.empty().await
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        self.inner.claim_and_retrieve(destination, client).await
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        self.inner.disown(destination, client).await
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        self.inner.peek(ids).await
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        self.inner.peek_oldest().await
    }

    async fn shutdown(&self) -> Result<()> {
        // Queued stores are ahead of us in the FIFO, so taking every permit
        // drains the queue; closing then turns late stores away.
        let drained = self
            .permits
            .acquire_many(self.max_in_flight as u32)
            .await
            .map_err(|_| StorageError::ShuttingDown)?;
        self.permits.close();
        drop(drained);

        tracing::info!(target: "kestrel", engine = %self.name, "store queue drained, shutting down inner engine");
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engines::{MemoryStore, ProbeStore};

    fn message(id: &str) -> Message {
        Message::builder()
            .id(id)
            .destination("/queue/a")
            .body(id.as_bytes().to_vec())
            .timestamp(100)
            .build()
            .expect("build message")
    }

    #[tokio::test]
    async fn test_stores_never_exceed_the_bound() {
        let probe = ProbeStore::gated(MemoryStore::new());
        let handle = probe.handle();
        let throttle = Arc::new(Throttle::new(probe, 2));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let throttle = Arc::clone(&throttle);
            tasks.push(tokio::spawn(async move {
                throttle.store(message(&format!("m{i}"))).await
            }));
        }

        // Two stores reach the inner engine and park on the gate; the rest
        // queue in the throttle.
        handle.wait_for_in_flight_stores(2).await;
        assert_eq!(handle.stores_in_flight(), 2);

        handle.release_stores(8);
        for task in tasks {
            task.await.expect("store task").expect("store result");
        }

        assert_eq!(handle.max_stores_in_flight(), 2);
        assert_eq!(handle.completed_stores(), 8);
    }

    #[tokio::test]
    async fn test_other_operations_bypass_the_queue() {
        let probe = ProbeStore::gated(MemoryStore::new());
        let handle = probe.handle();
        let throttle = Arc::new(Throttle::new(probe, 1));

        // Saturate the single store slot
        let blocked = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.store(message("m1")).await })
        };
        handle.wait_for_in_flight_stores(1).await;

        // Reads are not throttled and must not wait for the store
        let peeked = throttle.peek(&[MessageId::new("m1")]).await.unwrap();
        assert!(peeked[0].is_none(), "m1 still parked in the gated store");

        handle.release_stores(1);
        blocked.await.expect("task").expect("store");
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_stores_first() {
        let probe = ProbeStore::gated(MemoryStore::new());
        let handle = probe.handle();
        let throttle = Arc::new(Throttle::new(probe, 1));

        let mut stores = Vec::new();
        for i in 0..3 {
            let throttle = Arc::clone(&throttle);
            stores.push(tokio::spawn(async move {
                throttle.store(message(&format!("m{i}"))).await
            }));
        }
        handle.wait_for_in_flight_stores(1).await;

        let shutdown = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.shutdown().await })
        };

        // Shutdown cannot finish while stores are queued
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        handle.release_stores(3);
        for task in stores {
            task.await.expect("task").expect("queued store completed");
        }
        shutdown.await.expect("task").expect("shutdown");

        assert_eq!(handle.completed_stores(), 3);

        // Late stores are turned away
        let err = throttle.store(message("late")).await.unwrap_err();
        assert!(matches!(err, StorageError::ShuttingDown));
    }
}
