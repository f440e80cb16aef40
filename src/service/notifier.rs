//! Capacity-change fan-out.
//!
//! Each subscription owns a one-slot channel. `signal` does a `try_send` on
//! every matching slot: a full slot means the subscriber has a wake pending
//! already, so the new signal coalesces into it. Producers never block and
//! never queue more than one wake per subscriber.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing as log;

/// Interval of the reconciliation signal that catches changes made outside
/// the daemon.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    vg: String,
    tx: mpsc::Sender<()>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subs: Mutex<HashMap<SubscriptionId, Registration>>,
}

impl Registry {
    fn subs(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Registration>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        self.subs().remove(&id).is_some()
    }
}

#[derive(Clone, Default)]
pub struct CapacityNotifier {
    registry: Arc<Registry>,
}

impl CapacityNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of `vg` may have changed.
    pub fn signal(&self, vg: &str) {
        let subs = self.registry.subs();
        for reg in subs.values().filter(|r| r.vg == vg) {
            // Full: a wake is already pending. Closed: the stream is going away.
            let _ = reg.tx.try_send(());
        }
    }

    /// Signals every volume group that has a subscriber.
    pub fn signal_all(&self) {
        let subs = self.registry.subs();
        for reg in subs.values() {
            let _ = reg.tx.try_send(());
        }
    }

    pub fn subscribe(&self, vg: &str) -> Subscription {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(1);
        self.registry.subs().insert(
            id,
            Registration {
                vg: vg.to_string(),
                tx,
            },
        );
        log::debug!(vg, id = id.0, "watch subscribed");
        Subscription {
            id,
            rx,
            notifier: self.clone(),
        }
    }

    /// Idempotent; unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.registry.remove(id) {
            log::debug!(id = id.0, "watch unsubscribed");
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.registry.subs().len()
    }

    /// Periodically signals every subscribed volume group until `stop` fires.
    pub fn spawn_ticker(&self, period: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        log::debug!("periodic capacity reconciliation");
                        notifier.signal_all();
                    }
                }
            }
            log::debug!("capacity ticker stopped");
        })
    }
}

/// Delivery end of a subscription. Dropping it deregisters, so every exit
/// path of the owning stream cleans up.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<()>,
    notifier: CapacityNotifier,
}

impl Subscription {
    #[cfg(test)]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next (possibly coalesced) wake. Cancel-safe.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn changed_now(&mut self) -> Option<()> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.id);
    }
}
