//! Two-tier coordinator.
//!
//! New messages land in the fast volatile front tier and the caller is
//! acknowledged immediately; a per-message timer later moves each persistent
//! message down to the durable back tier (non-persistent messages are simply
//! dropped there). Claims try the front first, then the back; within a tier
//! age order holds, and the tier boundary is an ordering boundary the broker
//! accepts.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use kestrel_common::LogName;
use tokio::sync::Notify;

use crate::{
    error::{Result, StorageError},
    message::{ClientId, Message, MessageId},
    storage::Storage,
};

#[derive(Debug)]
struct ComplexShared<F, B> {
    name: LogName,
    front: F,
    back: B,
    timeout: Duration,
    /// Ids with a live drain timer. Removing an id from this set is the
    /// exclusive right to drain it; losers of that race do nothing.
    timers: Mutex<HashSet<MessageId>>,
    /// Wakes every sleeping timer task at shutdown.
    halt: Notify,
    accepting: AtomicBool,
    drains_in_flight: AtomicUsize,
    drains_done: Notify,
}

impl<F: Storage, B: Storage> ComplexShared<F, B> {
    async fn timer(self: Arc<Self>, id: MessageId) {
        if !self.accepting.load(Ordering::SeqCst) {
            // Shutdown owns the sweep now
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(self.timeout) => self.drain(&id).await,
            () = self.halt.notified() => {}
        }
    }

    /// Timer-fired entry point; takes the id's drain right if still there.
    async fn drain(&self, id: &MessageId) {
        let owned = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if !owned {
            return;
        }
        self.drain_counted(id).await;
    }

    /// Run one drain with the in-flight counter held, so observers that
    /// miss the message in both tiers can wait the move out.
    async fn drain_counted(&self, id: &MessageId) {
        self.drains_in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.drain_now(id).await {
            tracing::error!(
                target: "kestrel",
                engine = %self.name,
                id = %id,
                error = %e,
                "drain failed"
            );
        }
        if self.drains_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drains_done.notify_waiters();
        }
    }

    /// Wait until no drain is mid-move.
    ///
    /// A message being drained is out of the front and not yet in the back.
    /// An operation that finds an id in neither tier calls this and looks
    /// again: once drains settle the message sits in exactly one tier, and
    /// its timer being consumed, nothing can move it any more, so the
    /// second look is authoritative.
    async fn drains_settled(&self) {
        loop {
            let notified = self.drains_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.drains_in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// The single oldest message across both tiers.
    async fn oldest_across_tiers(&self) -> Result<Option<Message>> {
        let front = self.front.peek_oldest().await?;
        let back = self.back.peek_oldest().await?;
        Ok(match (front, back) {
            (Some(f), Some(b)) => {
                if (f.timestamp, &f.id) <= (b.timestamp, &b.id) {
                    Some(f)
                } else {
                    Some(b)
                }
            }
            (front, None) => front,
            (None, back) => back,
        })
    }

    /// Move one message out of the front tier.
    ///
    /// The message is *taken* from the front first, so it is in transit
    /// (invisible to claims) while the back store write is in flight, and a
    /// claim can never see both copies. The other side of that coin is that
    /// mid-move the message is visible in *neither* tier; operations that
    /// miss an id in both cover it via [`ComplexShared::drains_settled`].
    async fn drain_now(&self, id: &MessageId) -> Result<()> {
        let taken = self.front.remove(std::slice::from_ref(id)).await?;
        let Some(message) = taken.into_iter().next().flatten() else {
            // Claimed-and-removed, or already drained
            return Ok(());
        };

        if message.claimant.is_some() && self.accepting.load(Ordering::SeqCst) {
            // In active delivery; it stays in front until ACK or disown.
            // At shutdown the claim is moot (no client survives a restart)
            // and the message falls through to the tiering below instead.
            return self.front.store(message).await;
        }

        if message.persistent {
            tracing::debug!(
                target: "kestrel",
                engine = %self.name,
                id = %id,
                "draining message to the back tier"
            );
            if let Err(e) = self.back.store(message.clone()).await {
                // Put it back rather than lose it
                let _ = self.front.store(message).await;
                return Err(e);
            }
        } else {
            tracing::debug!(
                target: "kestrel",
                engine = %self.name,
                id = %id,
                "dropping non-persistent message at drain"
            );
        }
        Ok(())
    }
}

/// The two-tier coordinator over a `front` and `back` engine.
#[derive(Debug)]
pub struct Complex<F, B> {
    shared: Arc<ComplexShared<F, B>>,
}

impl<F, B> Complex<F, B>
where
    F: Storage + 'static,
    B: Storage + 'static,
{
    /// Default front-to-back drain delay.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

    /// Compose `front` and `back`, draining after `timeout`.
    #[must_use]
    pub fn new(front: F, back: B, timeout: Duration) -> Self {
        Self::new_named(front, back, timeout, LogName::root("COMPLEX"))
    }

    /// As [`Complex::new`], with the engine name supplied by the assembling
    /// parent.
    #[must_use]
    pub fn new_named(front: F, back: B, timeout: Duration, name: LogName) -> Self {
        Self {
            shared: Arc::new(ComplexShared {
                name,
                front,
                back,
                timeout,
                timers: Mutex::new(HashSet::new()),
                halt: Notify::new(),
                accepting: AtomicBool::new(true),
                drains_in_flight: AtomicUsize::new(0),
                drains_done: Notify::new(),
            }),
        }
    }

    /// The front tier.
    pub fn front(&self) -> &F {
        &self.shared.front
    }

    /// The back tier.
    pub fn back(&self) -> &B {
        &self.shared.back
    }
}

#[async_trait]
impl<F, B> Storage for Complex<F, B>
where
    F: Storage + 'static,
    B: Storage + 'static,
{
    async fn store(&self, message: Message) -> Result<()> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(StorageError::ShuttingDown);
        }

        let id = message.id.clone();
        self.shared.front.store(message).await?;

        self.shared
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        tokio::spawn(ComplexShared::timer(Arc::clone(&self.shared), id.clone()));

        if !self.shared.accepting.load(Ordering::SeqCst) {
            // Shutdown began while we were storing; sweep our own timer
            self.shared.drain(&id).await;
        }
        Ok(())
    }

    async fn remove(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let front = self.shared.front.remove(ids).await?;
        let back = self.shared.back.remove(ids).await?;
        // A message lives in exactly one tier, so per id one side is None
        let mut removed: Vec<Option<Message>> =
            front.into_iter().zip(back).map(|(f, b)| f.or(b)).collect();

        // An id missing from both tiers may be mid-drain; wait the move out
        // and look again, or the caller would believe the removal happened
        // while the drain quietly re-persists the message.
        let unresolved: Vec<MessageId> = ids
            .iter()
            .zip(&removed)
            .filter(|(_, hit)| hit.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !unresolved.is_empty() {
            self.shared.drains_settled().await;
            let front = self.shared.front.remove(&unresolved).await?;
            let back = self.shared.back.remove(&unresolved).await?;
            let mut retried = front.into_iter().zip(back).map(|(f, b)| f.or(b));
            for slot in removed.iter_mut().filter(|slot| slot.is_none()) {
                *slot = retried.next().flatten();
            }
        }
        Ok(removed)
    }

    async fn discard(&self, ids: &[MessageId]) -> Result<()> {
        // The front is memory, so taking its hits costs nothing and tells
        // us which ids are fully resolved.
        let front = self.shared.front.remove(ids).await?;
        self.shared.back.discard(ids).await?;

        // Ids not found in the front may be mid-drain; sweep them again
        // once the move settles so an ACK cannot lose to a drain.
        let unresolved: Vec<MessageId> = ids
            .iter()
            .zip(&front)
            .filter(|(_, hit)| hit.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !unresolved.is_empty() {
            self.shared.drains_settled().await;
            self.shared.front.discard(&unresolved).await?;
            self.shared.back.discard(&unresolved).await?;
        }
        Ok(())
    }

    async fn empty(&self) -> Result<Vec<Message>> {
        let mut removed = self.shared.front.empty().await?;
        removed.extend(self.shared.back.empty().await?);
        // A message mid-drain is in neither tier yet; sweep again once the
        // moves settle so a purge cannot miss it.
        self.shared.drains_settled().await;
        removed.extend(self.shared.front.empty().await?);
        removed.extend(self.shared.back.empty().await?);
        Ok(removed)
    }

    async fn claim_and_retrieve(
        &self,
        destination: &str,
        client: ClientId,
    ) -> Result<Option<Message>> {
        if let Some(message) = self
            .shared
            .front
            .claim_and_retrieve(destination, client)
            .await?
        {
            return Ok(Some(message));
        }
        if let Some(message) = self
            .shared
            .back
            .claim_and_retrieve(destination, client)
            .await?
        {
            return Ok(Some(message));
        }

        // Nothing visible; the destination may still have a message that is
        // mid-drain between the tiers
        self.shared.drains_settled().await;
        if let Some(message) = self
            .shared
            .front
            .claim_and_retrieve(destination, client)
            .await?
        {
            return Ok(Some(message));
        }
        self.shared.back.claim_and_retrieve(destination, client).await
    }

    async fn disown(&self, destination: &str, client: ClientId) -> Result<()> {
        self.shared.front.disown(destination, client).await?;
        self.shared.back.disown(destination, client).await
    }

    async fn peek(&self, ids: &[MessageId]) -> Result<Vec<Option<Message>>> {
        let front = self.shared.front.peek(ids).await?;
        let back = self.shared.back.peek(ids).await?;
        let mut found: Vec<Option<Message>> =
            front.into_iter().zip(back).map(|(f, b)| f.or(b)).collect();

        // As in `remove`: an id in neither tier may be mid-drain, and a
        // reader must not report a live message as gone.
        let unresolved: Vec<MessageId> = ids
            .iter()
            .zip(&found)
            .filter(|(_, hit)| hit.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !unresolved.is_empty() {
            self.shared.drains_settled().await;
            let front = self.shared.front.peek(&unresolved).await?;
            let back = self.shared.back.peek(&unresolved).await?;
            let mut retried = front.into_iter().zip(back).map(|(f, b)| f.or(b));
            for slot in found.iter_mut().filter(|slot| slot.is_none()) {
                *slot = retried.next().flatten();
            }
        }
        Ok(found)
    }

    async fn peek_oldest(&self) -> Result<Option<Message>> {
        if let Some(message) = self.shared.oldest_across_tiers().await? {
            return Ok(Some(message));
        }
        // An apparently empty stack may have its only message mid-drain
        self.shared.drains_settled().await;
        self.shared.oldest_across_tiers().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.halt.notify_waiters();

        // Sweep every id still waiting on a timer
        let pending: Vec<MessageId> = {
            let mut timers = self
                .shared
                .timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            timers.drain().collect()
        };
        tracing::info!(
            target: "kestrel",
            engine = %self.shared.name,
            pending = pending.len(),
            "shutting down, draining timered messages"
        );
        for id in &pending {
            self.shared.drain_counted(id).await;
        }

        // Timers that fired just before the sweep may still be mid-drain
        self.shared.drains_settled().await;

        self.shared.front.shutdown().await?;
        self.shared.back.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{MemoryStore, ProbeStore};

    fn message(id: &str, persistent: bool, timestamp: u64) -> Message {
        Message::builder()
            .id(id)
            .destination("/queue/a")
            .persistent(persistent)
            .body(id.as_bytes().to_vec())
            .timestamp(timestamp)
            .build()
            .expect("build message")
    }

    type Tiers = (
        Arc<MemoryStore>,
        Arc<MemoryStore>,
        Complex<Arc<MemoryStore>, Arc<MemoryStore>>,
    );

    fn stack(timeout: Duration) -> Tiers {
        let front = Arc::new(MemoryStore::new());
        let back = Arc::new(MemoryStore::new());
        let complex = Complex::new(Arc::clone(&front), Arc::clone(&back), timeout);
        (front, back, complex)
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_acknowledges_before_touching_the_back() {
        let (front, back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", true, 100)).await.unwrap();

        assert_eq!(front.len(), 1);
        assert!(back.is_empty(), "back untouched until the timer fires");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_message_drains_after_timeout() {
        let (front, back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", true, 100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(front.len(), 1, "not drained at t+0.5s");
        assert!(back.is_empty());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(front.is_empty(), "drained at t+1.2s");
        let in_back = back.peek(&[MessageId::new("m1")]).await.unwrap();
        assert_eq!(&*in_back[0].as_ref().expect("in back").body, b"m1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_persistent_message_is_dropped_at_drain() {
        let (front, back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", false, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(front.is_empty());
        assert!(back.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_message_stays_in_front() {
        let (front, back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", true, 100)).await.unwrap();
        let claimed = complex
            .claim_and_retrieve("/queue/a", ClientId::new(5))
            .await
            .unwrap();
        assert!(claimed.is_some());

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(front.len(), 1, "claimed message is not drained");
        assert!(back.is_empty());
        let peeked = front.peek(&[MessageId::new("m1")]).await.unwrap();
        assert_eq!(peeked[0].as_ref().unwrap().claimant, Some(ClientId::new(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_tries_front_before_back() {
        let (_front, _back, complex) = stack(Duration::from_secs(1));

        // m1 drains to the back, m2 stays fresh in the front
        complex.store(message("m1", true, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        complex.store(message("m2", true, 200)).await.unwrap();

        let first = complex
            .claim_and_retrieve("/queue/a", ClientId::new(1))
            .await
            .unwrap()
            .expect("claimable");
        assert_eq!(
            first.id.as_str(),
            "m2",
            "front wins over an older back message; the tier boundary is an ordering boundary"
        );

        let second = complex
            .claim_and_retrieve("/queue/a", ClientId::new(1))
            .await
            .unwrap()
            .expect("back still has m1");
        assert_eq!(second.id.as_str(), "m1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_peek_merge_tiers() {
        let (_front, _back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", true, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        complex.store(message("m2", true, 200)).await.unwrap();

        let ids = [
            MessageId::new("m1"),
            MessageId::new("m2"),
            MessageId::new("missing"),
        ];
        let peeked = complex.peek(&ids).await.unwrap();
        assert!(peeked[0].is_some());
        assert!(peeked[1].is_some());
        assert!(peeked[2].is_none());

        let removed = complex.remove(&ids).await.unwrap();
        assert_eq!(removed[0].as_ref().unwrap().id.as_str(), "m1");
        assert_eq!(removed[1].as_ref().unwrap().id.as_str(), "m2");
        assert!(removed[2].is_none());

        assert!(complex.empty().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disown_reaches_both_tiers() {
        let (_front, _back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", true, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        // m1 is in the back now; claim it there
        let claimed = complex
            .claim_and_retrieve("/queue/a", ClientId::new(9))
            .await
            .unwrap();
        assert!(claimed.is_some());
        assert!(
            complex
                .claim_and_retrieve("/queue/a", ClientId::new(10))
                .await
                .unwrap()
                .is_none()
        );

        complex.disown("/queue/a", ClientId::new(9)).await.unwrap();

        let reclaimed = complex
            .claim_and_retrieve("/queue/a", ClientId::new(10))
            .await
            .unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_oldest_spans_tiers() {
        let (_front, _back, complex) = stack(Duration::from_secs(1));

        complex.store(message("m1", true, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        complex.store(message("m2", true, 50)).await.unwrap();

        // m2 (front) is younger by id but older by timestamp
        let oldest = complex.peek_oldest().await.unwrap().expect("not empty");
        assert_eq!(oldest.id.as_str(), "m2");
    }

    /// A stack whose back parks every store until the test releases it,
    /// holding a drain open mid-move.
    type GatedTiers = (
        Arc<MemoryStore>,
        Arc<ProbeStore<MemoryStore>>,
        crate::engines::ProbeHandle,
        Arc<Complex<Arc<MemoryStore>, Arc<ProbeStore<MemoryStore>>>>,
    );

    fn gated_stack(timeout: Duration) -> GatedTiers {
        let front = Arc::new(MemoryStore::new());
        let probe = ProbeStore::gated(MemoryStore::new());
        let handle = probe.handle();
        let back = Arc::new(probe);
        let complex = Arc::new(Complex::new(
            Arc::clone(&front),
            Arc::clone(&back),
            timeout,
        ));
        (front, back, handle, complex)
    }

    /// Fire the drain timer and leave the message parked between the tiers.
    async fn park_one_drain(
        front: &Arc<MemoryStore>,
        back: &Arc<ProbeStore<MemoryStore>>,
        handle: &crate::engines::ProbeHandle,
        complex: &Arc<Complex<Arc<MemoryStore>, Arc<ProbeStore<MemoryStore>>>>,
        id: &str,
    ) {
        complex.store(message(id, true, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        handle.wait_for_in_flight_stores(1).await;

        // Out of the front, not yet in the back: mid-move
        assert!(front.is_empty());
        assert!(back.peek(&[MessageId::new(id)]).await.unwrap()[0].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_waits_out_an_in_flight_drain() {
        let (front, back, handle, complex) = gated_stack(Duration::from_secs(1));
        park_one_drain(&front, &back, &handle, &complex, "m1").await;

        let remover = {
            let complex = Arc::clone(&complex);
            tokio::spawn(async move { complex.remove(&[MessageId::new("m1")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !remover.is_finished(),
            "remove must wait for the move to settle, not report the message gone"
        );

        handle.release_stores(1);
        let removed = remover.await.expect("task").expect("remove");
        assert_eq!(
            removed[0].as_ref().expect("returned despite the drain").id.as_str(),
            "m1"
        );

        // Removed means removed: the drain must not re-persist it
        assert!(front.is_empty());
        assert!(back.peek(&[MessageId::new("m1")]).await.unwrap()[0].is_none());
        assert!(complex.peek(&[MessageId::new("m1")]).await.unwrap()[0].is_none());
        assert_eq!(handle.completed_stores(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_sees_a_message_mid_drain() {
        let (front, back, handle, complex) = gated_stack(Duration::from_secs(1));
        park_one_drain(&front, &back, &handle, &complex, "m1").await;

        let peeker = {
            let complex = Arc::clone(&complex);
            tokio::spawn(async move { complex.peek(&[MessageId::new("m1")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!peeker.is_finished(), "peek must not report a live message gone");

        handle.release_stores(1);
        let peeked = peeker.await.expect("task").expect("peek");
        assert_eq!(&*peeked[0].as_ref().expect("still stored").body, b"m1");

        // Settled into exactly one tier and still claimable there
        assert!(front.is_empty());
        assert!(back.peek(&[MessageId::new("m1")]).await.unwrap()[0].is_some());
        let claimed = complex
            .claim_and_retrieve("/queue/a", ClientId::new(1))
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_during_drain_does_not_resurrect_the_message() {
        let (front, back, handle, complex) = gated_stack(Duration::from_secs(1));
        park_one_drain(&front, &back, &handle, &complex, "m1").await;

        let acker = {
            let complex = Arc::clone(&complex);
            tokio::spawn(async move { complex.discard(&[MessageId::new("m1")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!acker.is_finished(), "the ACK waits for the move to settle");

        handle.release_stores(1);
        acker.await.expect("task").expect("discard");

        // The ACK wins: nothing lingers in either tier to resurface later
        assert!(front.is_empty());
        assert!(back.peek(&[MessageId::new("m1")]).await.unwrap()[0].is_none());
        assert!(
            complex
                .claim_and_retrieve("/queue/a", ClientId::new(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_pending_timers() {
        let (front, back, complex) = stack(Duration::from_secs(60));

        complex.store(message("m1", true, 100)).await.unwrap();
        complex.store(message("m2", false, 101)).await.unwrap();

        // Long before any timer fires
        complex.shutdown().await.unwrap();

        assert!(front.is_empty(), "front swept at shutdown");
        let in_back = back.peek(&[MessageId::new("m1")]).await.unwrap();
        assert!(in_back[0].is_some(), "persistent message pushed to back");
        let dropped = back.peek(&[MessageId::new("m2")]).await.unwrap();
        assert!(dropped[0].is_none(), "non-persistent message dropped");

        let err = complex.store(message("m3", true, 102)).await.unwrap_err();
        assert!(matches!(err, StorageError::ShuttingDown));
    }
}
