// Entity reconciliation against the tunnel snapshot

//! Keep the set of entities in line with the configured tunnels
//!
//! The registry subscribes to the [`Coordinator`] before any entity does, so
//! on every refresh it sees the new snapshot first. New tunnels get an entity,
//! handed to the sink as one batch. Tunnels that vanished are reported once
//! and then handled according to the configured [`RemovalPolicy`].
//!
//! A sink call that fails is queued and retried on the next pass, so the
//! sink converges on the registry once it recovers.

use crate::coordinator::{Coordinator, ListenerId};
use crate::entity::{EntitySink, TunnelEntity};
use crate::types::RemovalPolicy;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Names added and removed by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tunnels that got a new entity
    pub added: Vec<String>,
    /// Tunnels that disappeared since the previous pass
    pub removed: Vec<String>,
}

impl ReconcileReport {
    /// True if nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    entities: BTreeMap<String, Arc<TunnelEntity>>,
    /// Tunnels already reported as deconfigured (retained entities only)
    stale: BTreeSet<String>,
    /// Entities the sink has not accepted yet
    pending_add: BTreeSet<String>,
    /// Removed entities the sink still shows
    pending_remove: BTreeSet<String>,
    last_report: ReconcileReport,
}

/// Owner of every tunnel entity
pub struct EntityRegistry {
    coordinator: Arc<Coordinator>,
    sink: Arc<dyn EntitySink>,
    policy: RemovalPolicy,
    state: Mutex<RegistryState>,
    listener: Mutex<Option<ListenerId>>,
}

impl EntityRegistry {
    /// Create an empty registry; call [`attach`](Self::attach) to start tracking
    pub fn new(
        coordinator: Arc<Coordinator>,
        sink: Arc<dyn EntitySink>,
        policy: RemovalPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            sink,
            policy,
            state: Mutex::new(RegistryState::default()),
            listener: Mutex::new(None),
        })
    }

    /// Subscribe to coordinator updates
    ///
    /// Must happen before the first refresh so that reconciliation runs ahead
    /// of every entity listener.
    pub fn attach(self: &Arc<Self>) {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let id = self.coordinator.add_listener(move || match weak.upgrade() {
            Some(registry) => registry.reconcile().map(|_| ()),
            None => Ok(()),
        });
        *listener = Some(id);
    }

    /// Diff the current snapshot against the known entities
    ///
    /// Sink calls queued by an earlier failed pass are retried first. Every
    /// sink call is attempted even if an earlier one fails; the failures are
    /// reported together.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let snapshot = self.coordinator.data();
        let mut report = ReconcileReport::default();
        let to_add: Vec<Arc<TunnelEntity>>;
        let to_remove: Vec<String>;

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            for (name, record) in snapshot.iter() {
                if state.stale.remove(name) {
                    log::info!("IPsec connection {} configured again", name);
                    continue;
                }
                if state.entities.contains_key(name) {
                    continue;
                }

                let entity = TunnelEntity::new(
                    name.clone(),
                    record.clone(),
                    self.coordinator.clone(),
                    self.sink.clone(),
                );
                entity.activate();
                state.entities.insert(name.clone(), entity);
                state.pending_remove.remove(name);
                state.pending_add.insert(name.clone());
                report.added.push(name.clone());
                log::info!("IPsec connection {} configured", name);
            }

            let missing: Vec<String> = state
                .entities
                .keys()
                .filter(|name| !snapshot.contains_key(*name) && !state.stale.contains(*name))
                .cloned()
                .collect();

            for name in missing {
                log::info!("IPsec connection {} deconfigured", name);
                match self.policy {
                    RemovalPolicy::Retain => {
                        state.stale.insert(name.clone());
                    }
                    RemovalPolicy::Remove => {
                        if let Some(entity) = state.entities.remove(&name) {
                            entity.deactivate();
                            state.pending_add.remove(&name);
                            state.pending_remove.insert(name.clone());
                        }
                    }
                }
                report.removed.push(name);
            }

            let pending_add = std::mem::take(&mut state.pending_add);
            to_add = pending_add
                .iter()
                .filter_map(|name| state.entities.get(name).cloned())
                .collect();
            to_remove = std::mem::take(&mut state.pending_remove).into_iter().collect();
            state.last_report = report.clone();
        }

        // Sink calls run without the registry lock held
        let mut failures = Vec::new();

        if !to_add.is_empty() {
            if let Err(e) = self.sink.add_entities(&to_add) {
                self.requeue(|state| {
                    for entity in &to_add {
                        // Skip entities removed while the lock was released
                        if state.entities.contains_key(entity.unique_id()) {
                            state.pending_add.insert(entity.unique_id().to_string());
                        }
                    }
                });
                failures.push(e.context("Failed to add tunnel entities"));
            }
        }

        for name in to_remove {
            if let Err(e) = self.sink.remove_entity(&name) {
                failures.push(e.context(format!("Failed to remove entity for {}", name)));
                self.requeue(|state| {
                    if !state.entities.contains_key(&name) {
                        state.pending_remove.insert(name);
                    }
                });
            }
        }

        if failures.is_empty() {
            return Ok(report);
        }
        let count = failures.len();
        let causes: Vec<String> = failures.iter().map(|e| format!("{:#}", e)).collect();
        anyhow::bail!(
            "{} sink update(s) failed, retrying on next refresh: {}",
            count,
            causes.join("; ")
        )
    }

    fn requeue<F>(&self, change: F)
    where
        F: FnOnce(&mut RegistryState),
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut *state);
    }

    /// Report of the most recent reconciliation pass
    pub fn last_report(&self) -> ReconcileReport {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_report
            .clone()
    }

    /// Number of sink calls waiting for a retry
    pub fn pending_sink_updates(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending_add.len() + state.pending_remove.len()
    }

    /// Entity for `name`, if one exists
    pub fn get(&self, name: &str) -> Option<Arc<TunnelEntity>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .get(name)
            .cloned()
    }

    /// Names of all known entities, sorted
    pub fn names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .keys()
            .cloned()
            .collect()
    }

    /// Number of known entities
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .len()
    }

    /// True if no entity exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unsubscribe from the coordinator and deactivate every entity
    pub fn shutdown(&self) {
        if let Some(id) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.coordinator.remove_listener(id);
        }

        let entities: Vec<Arc<TunnelEntity>> = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .values()
            .cloned()
            .collect();
        for entity in entities {
            entity.deactivate();
        }
        log::debug!("Entity registry shut down");
    }
}
