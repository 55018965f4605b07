//! Per-destination claim serialization.
//!
//! A claim is a read-then-update: select the oldest unclaimed message, then
//! mark it claimed. Two claims for the same destination interleaving between
//! those steps would hand the same message to two clients, so an engine
//! whose claim path suspends between them holds the destination's permit for
//! the whole span. This is an application-level lock, not a database lock:
//! it is cheaper and avoids long-held database transactions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One FIFO queue of claims per destination.
///
/// Tokio's mutex is queue-fair, so claims are dispatched in arrival order.
/// Destinations with no claim in flight hold no entry in the map.
#[derive(Debug, Default)]
pub struct DestinationGate {
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DestinationGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for, and take, the exclusive right to claim from `destination`.
    ///
    /// The permit is released on drop; the next queued claim for the
    /// destination (if any) proceeds then.
    pub async fn acquire(&self, destination: &str) -> ClaimPermit<'_> {
        let gate = {
            let mut gates = self
                .gates
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(gates.entry(destination.to_string()).or_default())
        };

        let guard = gate.lock_owned().await;

        ClaimPermit {
            owner: self,
            destination: destination.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of destinations with a claim in flight or queued.
    #[must_use]
    pub fn active_destinations(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive right to run one claim against a destination.
#[derive(Debug)]
pub struct ClaimPermit<'a> {
    owner: &'a DestinationGate,
    destination: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ClaimPermit<'_> {
    fn drop(&mut self) {
        // Release the queue slot before deciding whether the destination's
        // entry can go away; the guard holds a reference on the gate.
        self.guard.take();

        let mut gates = self
            .owner
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(gate) = gates.get(&self.destination) {
            // Only the map's own reference left: nobody is claiming or queued.
            if Arc::strong_count(gate) == 1 {
                gates.remove(&self.destination);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn test_claims_serialize_per_destination() {
        let gate = Arc::new(DestinationGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire("/queue/a").await;
                order.lock().unwrap().push((i, "enter"));
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push((i, "exit"));
            }));
            // Give each task a chance to queue before the next
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.expect("claim task panicked");
        }

        // Every enter must be immediately followed by its own exit
        let order = order.lock().unwrap();
        for pair in order.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0, "claims overlapped: {order:?}");
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "exit");
        }
    }

    #[tokio::test]
    async fn test_destinations_do_not_block_each_other() {
        let gate = DestinationGate::new();

        let _a = gate.acquire("/queue/a").await;
        // Would deadlock if destinations shared a queue
        let _b = gate.acquire("/queue/b").await;

        assert_eq!(gate.active_destinations(), 2);
    }

    #[tokio::test]
    async fn test_idle_destinations_are_forgotten() {
        let gate = DestinationGate::new();

        {
            let _permit = gate.acquire("/queue/a").await;
            assert_eq!(gate.active_destinations(), 1);
        }

        assert_eq!(gate.active_destinations(), 0);

        // Reacquiring after cleanup works
        let _permit = gate.acquire("/queue/a").await;
        assert_eq!(gate.active_destinations(), 1);
    }
}
