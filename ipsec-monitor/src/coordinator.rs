// Update coordinator for tunnel snapshots

//! Periodic and on-demand refresh of the tunnel snapshot
//!
//! The coordinator owns the latest [`TunnelMap`] and a list of listeners.
//! Every successful refresh swaps the snapshot in one step and then calls each
//! listener in registration order. A failed refresh leaves the previous
//! snapshot in place and notifies nobody.
//!
//! Only one refresh talks to the daemon at a time. A caller that arrives while
//! a refresh is running waits for it and reuses its outcome instead of
//! starting a second query.

use crate::fetcher::TunnelFetcher;
use crate::types::TunnelMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Interval between scheduled refreshes (seconds)
pub const REFRESH_INTERVAL_SECS: u64 = 60;

/// Handle returned by [`Coordinator::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Owner of the known-tunnel snapshot
pub struct Coordinator {
    fetcher: TunnelFetcher,
    data: RwLock<Arc<TunnelMap>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    /// Held for the whole fetch; serializes refreshes
    refresh_lock: tokio::sync::Mutex<()>,
    /// Number of finished refresh attempts
    completed: AtomicU64,
    last_ok: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator with an empty snapshot
    pub fn new(fetcher: TunnelFetcher) -> Self {
        Self {
            fetcher,
            data: RwLock::new(Arc::new(TunnelMap::new())),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            last_ok: AtomicBool::new(false),
        }
    }

    /// Current snapshot
    pub fn data(&self) -> Arc<TunnelMap> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the most recent refresh attempt succeeded
    pub fn last_refresh_ok(&self) -> bool {
        self.last_ok.load(Ordering::SeqCst)
    }

    /// Register a listener called after every successful refresh
    ///
    /// Registering the same closure twice yields two independent
    /// registrations.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fetch a new snapshot and notify listeners
    ///
    /// Returns true if the snapshot was replaced. Fetch errors are logged and
    /// stop here.
    pub async fn refresh(&self) -> bool {
        let seen = self.completed.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.completed.load(Ordering::SeqCst) != seen {
            log::debug!("Refresh finished while waiting, reusing its result");
            return self.last_refresh_ok();
        }

        let result = self.fetcher.fetch_all().await;
        self.completed.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(tunnels) => {
                log::debug!("Fetched {} IPsec connections", tunnels.len());
                *self.data.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tunnels);
                self.last_ok.store(true, Ordering::SeqCst);
                self.notify_listeners();
                true
            }
            Err(e) => {
                log::error!("Failed to refresh IPsec connections: {}", e);
                self.last_ok.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// [`refresh`](Self::refresh) that gives up as soon as `cancel` fires
    ///
    /// Returns `None` if cancelled; the snapshot is then untouched and no
    /// listener has run.
    pub async fn refresh_until_cancelled(&self, cancel: &CancellationToken) -> Option<bool> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Shutdown during refresh, abandoning it");
                None
            }
            ok = self.refresh() => Some(ok),
        }
    }

    fn notify_listeners(&self) {
        // Snapshot the list so listeners may (un)register while being called
        let listeners: Vec<(ListenerId, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            if let Err(e) = listener() {
                log::warn!("Listener {:?} failed: {:#}", id, e);
            }
        }
    }

    /// Refresh now and then every `period` until `cancel` fires
    ///
    /// Cycles never overlap: the next tick is only awaited after the previous
    /// refresh and its listener fan-out have finished. Cancellation abandons an
    /// in-flight fetch before it can touch the snapshot.
    pub fn schedule_refresh(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);

        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        if coordinator.refresh_until_cancelled(&cancel).await.is_none() {
                            break;
                        }
                    }
                }
            }

            log::info!("Periodic refresh stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{config, sa, Failure, FakeSource};
    use std::sync::atomic::AtomicUsize;

    fn coordinator_with(source: &Arc<FakeSource>) -> Arc<Coordinator> {
        Arc::new(Coordinator::new(TunnelFetcher::new(source.clone())))
    }

    fn counting_listener(coordinator: &Coordinator) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        coordinator.add_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        calls
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot_and_notifies_in_order() {
        let source = Arc::new(FakeSource::new());
        source.set_configs(vec![config("site-a", "10.0.0.1", "203.0.113.5")]);
        let coordinator = coordinator_with(&source);

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            let seen_by = coordinator.clone();
            coordinator.add_listener(move || {
                // Every listener already sees the new snapshot
                assert!(seen_by.data().contains_key("site-a"));
                order.lock().unwrap().push(label);
                Ok(())
            });
        }

        assert!(coordinator.refresh().await);
        assert!(coordinator.last_refresh_ok());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_snapshot() {
        let source = Arc::new(FakeSource::new());
        source.set_configs(vec![config("site-a", "10.0.0.1", "203.0.113.5")]);
        let coordinator = coordinator_with(&source);
        let calls = counting_listener(&coordinator);

        assert!(coordinator.refresh().await);
        let before = coordinator.data();

        source.set_configs(vec![config("site-b", "10.0.0.1", "198.51.100.7")]);
        source.fail_sas_with(Some(Failure::Protocol));
        assert!(!coordinator.refresh().await);
        assert!(!coordinator.last_refresh_ok());
        assert_eq!(*coordinator.data(), *before);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        source.fail_sas_with(None);
        assert!(coordinator.refresh().await);
        let after = coordinator.data();
        assert!(after.contains_key("site-b"));
        assert!(!after.contains_key("site-a"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_failure_before_first_success() {
        let source = Arc::new(FakeSource::new());
        source.fail_with(Some(Failure::Connection));
        let coordinator = coordinator_with(&source);
        let calls = counting_listener(&coordinator);

        assert!(!coordinator.refresh().await);
        assert!(coordinator.data().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unchanged_daemon_gives_identical_snapshot() {
        let source = Arc::new(FakeSource::new());
        source.set_configs(vec![
            config("site-a", "10.0.0.1", "203.0.113.5"),
            config("site-b", "10.0.0.1", "198.51.100.7"),
        ]);
        source.set_sas(vec![sa("site-b", "ESTABLISHED", "198.51.100.7")]);
        let coordinator = coordinator_with(&source);

        coordinator.refresh().await;
        let first = coordinator.data();
        coordinator.refresh().await;
        assert_eq!(*coordinator.data(), *first);
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator_with(&source);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = coordinator.add_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        coordinator.refresh().await;
        assert!(coordinator.remove_listener(id));
        assert!(!coordinator.remove_listener(id));
        coordinator.refresh().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_same_listener_registered_twice_is_called_twice() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator_with(&source);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        });
        let l1 = listener.clone();
        let l2 = listener.clone();
        let first = coordinator.add_listener(move || l1());
        coordinator.add_listener(move || l2());

        coordinator.refresh().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        coordinator.remove_listener(first);
        coordinator.refresh().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_fan_out() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator_with(&source);

        coordinator.add_listener(|| anyhow::bail!("entity update failed"));
        let calls = counting_listener(&coordinator);

        assert!(coordinator.refresh().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_can_unregister_during_fan_out() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator_with(&source);

        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&coordinator);
        let own_id = slot.clone();
        let id = coordinator.add_listener(move || {
            if let (Some(c), Some(id)) = (weak.upgrade(), *own_id.lock().unwrap()) {
                c.remove_listener(id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        coordinator.refresh().await;
        assert_eq!(coordinator.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_coalesced() {
        let source = Arc::new(FakeSource::new());
        source.set_configs(vec![config("site-a", "10.0.0.1", "203.0.113.5")]);
        let gate = source.hold();
        let coordinator = coordinator_with(&source);
        let calls = counting_listener(&coordinator);

        let first = tokio::spawn({
            let c = coordinator.clone();
            async move { c.refresh().await }
        });
        source.wait_entered().await;

        let second = tokio::spawn({
            let c = coordinator.clone();
            async move { c.refresh().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        gate.add_permits(16);
        assert!(first.await.unwrap());
        assert!(second.await.unwrap());

        assert_eq!(source.fetch_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_refreshes_immediately_then_periodically() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator_with(&source);
        let cancel = CancellationToken::new();

        let handle = coordinator.schedule_refresh(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.fetch_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetch_count(), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.fetch_count(), 4);

        cancel.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_on_demand_refresh_leaves_snapshot_alone() {
        let source = Arc::new(FakeSource::new());
        source.set_configs(vec![config("site-a", "10.0.0.1", "203.0.113.5")]);
        let gate = source.hold();
        let coordinator = coordinator_with(&source);
        let calls = counting_listener(&coordinator);
        let cancel = CancellationToken::new();

        let mut refreshes = tokio::task::JoinSet::new();
        for _ in 0..2 {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            refreshes.spawn(async move { coordinator.refresh_until_cancelled(&cancel).await });
        }
        source.wait_entered().await;

        cancel.cancel();
        while let Some(outcome) = refreshes.join_next().await {
            assert_eq!(outcome.unwrap(), None);
        }

        // Nothing may land after the tasks were joined
        gate.add_permits(16);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(coordinator.data().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Already cancelled token: returns without querying
        let before = source.fetch_count();
        assert_eq!(coordinator.refresh_until_cancelled(&cancel).await, None);
        assert_eq!(source.fetch_count(), before);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_in_flight_refresh() {
        let source = Arc::new(FakeSource::new());
        source.set_configs(vec![config("site-a", "10.0.0.1", "203.0.113.5")]);
        let gate = source.hold();
        let coordinator = coordinator_with(&source);
        let calls = counting_listener(&coordinator);
        let cancel = CancellationToken::new();

        let handle = coordinator.schedule_refresh(Duration::from_secs(60), cancel.clone());
        source.wait_entered().await;

        cancel.cancel();
        handle.await.unwrap();
        gate.add_permits(16);

        assert!(coordinator.data().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Coordinator stays usable after an abandoned refresh
        assert!(coordinator.refresh().await);
        assert!(coordinator.data().contains_key("site-a"));
    }
}
