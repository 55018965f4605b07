//! Instrumented wrapper store for exercising decorators in tests.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::{
    error::Result,
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

#[derive(Debug)]
struct ProbeState {
    gated: bool,
    /// Permits released by the test; each admits one gated store.
    gate: Semaphore,
    stores_in_flight: AtomicUsize,
    max_stores_in_flight: AtomicUsize,
    completed_stores: AtomicUsize,
    operations: Mutex<Vec<String>>,
    changed: Notify,
}

impl ProbeState {
    fn record(&self, operation: String) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation);
    }
}

/// Wraps any engine, counting concurrent stores and recording the operation
/// sequence. A *gated* probe additionally parks every store until the test
/// releases it, which is how tests hold an inner engine "busy" at will.
#[derive(Debug)]
pub struct ProbeStore<S> {
    inner: S,
    state: Arc<ProbeState>,
}

impl<S: Storage> ProbeStore<S> {
    /// Wrap `inner`; stores pass through immediately.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self::build(inner, false)
    }

    /// Wrap `inner`; stores wait on [`ProbeHandle::release_stores`].
    #[must_use]
    pub fn gated(inner: S) -> Self {
        Self::build(inner, true)
    }

    fn build(inner: S, gated: bool) -> Self {
        Self {
            inner,
            state: Arc::new(ProbeState {
                gated,
                gate: Semaphore::new(0),
                stores_in_flight: AtomicUsize::new(0),
                max_stores_in_flight: AtomicUsize::new(0),
                completed_stores: AtomicUsize::new(0),
                operations: Mutex::new(Vec::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// A cloneable view onto the probe's counters, usable after the probe
    /// itself moved into a wrapping engine.
    #[must_use]
    pub fn handle(&self) -> ProbeHandle {
        ProbeHandle {
            state: Arc::clone(&self.state),
        }
    }
}

/// Observer side of a [`ProbeStore`].
#[derive(Debug, Clone)]
pub struct ProbeHandle {
    state: Arc<ProbeState>,
}

impl ProbeHandle {
    /// Stores currently inside the probe (parked or executing).
    #[must_use]
    pub fn stores_in_flight(&self) -> usize {
        self.state.stores_in_flight.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrent stores.
    #[must_use]
    pub fn max_stores_in_flight(&self) -> usize {
        self.state.max_stores_in_flight.load(Ordering::SeqCst)
    }

    /// Stores that ran to completion.
    #[must_use]
    pub fn completed_stores(&self) -> usize {
        self.state.completed_stores.load(Ordering::SeqCst)
    }

    /// Let `n` parked stores proceed (gated probes only).
    pub fn release_stores(&self, n: usize) {
        self.state.gate.add_permits(n);
    }

    /// The operations seen so far, in order.
    ///
    /// # Panics
    /// Panics if the operation log lock is poisoned.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.state
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `n` stores are in flight.
    ///
    /// # Panics
    /// Panics after five seconds, to fail a wedged test loudly.
    pub async fn wait_for_in_flight_stores(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.state.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.stores_in_flight() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for in-flight stores");
    }
}

#[async_trait]
impl<S: Storage> Storage for ProbeStore<S> {
    async fn store(&self, message: Message) -> Result<()> {
        self.state.record(format!("store {}", message.id));
        let in_flight = self.state.stores_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_stores_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        self.state.changed.notify_waiters();

        if self.state.gated {
            let permit = self
                .state
                .gate
                .acquire()
                .await
                .expect("probe gate closed mid-test");
            permit.forget();
        }

        let stored = self.inner.store(message).await;

        self.state.stores_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.state.completed_stores.fetch_add(1, Ordering::SeqCst);
        self.state.changed.notify_waiters();
        stored
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        self.state.record(format!("remove {}", join_ids(ids)));
        self.inner.remove(ids).await
    }

    async fn discard(&self, ids: &[MessageId]) -> Result<()> {
        self.state.record(format!("discard {}", join_ids(ids)));
        self.inner.discard(ids).await
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        self.state.record("empty".to_string());
        self.inner.empty().await
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        self.state
            .record(format!("claim {destination} by {client}"));
        self.inner.claim_and_retrieve(destination, client).await
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        self.state
            .record(format!("disown {destination} by {client}"));
        self.inner.disown(destination, client).await
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        self.inner.peek(ids).await
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        self.inner.peek_oldest().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.record("shutdown".to_string());
        self.inner.shutdown().await
    }
}

fn join_ids(ids: &[MessageId]) -> String {
    ids.iter()
        .map(MessageId::as_str)
        .collect::<Vec<_>>()
        .join("|")
}
