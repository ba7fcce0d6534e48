// Tunnel entities exposed to the presentation layer

//! One observable entity per known tunnel
//!
//! An entity is push-updated: it subscribes to the [`Coordinator`] when
//! activated, re-reads its own record on every notification and hands the
//! result to an [`EntitySink`]. It never polls the daemon itself.

use crate::coordinator::{Coordinator, ListenerId};
use crate::types::{TunnelRecord, ESTABLISHED};
use anyhow::Result;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Attribute labels, in presentation order
pub const ATTRIBUTE_LABELS: [&str; 6] = [
    "Local addr",
    "Remote addr",
    "Local net",
    "Remote net",
    "State",
    "Remote host",
];

/// Presentation status derived from the raw SA state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// SA is up
    Established,
    /// No SA, or one still negotiating
    Down,
}

impl DisplayStatus {
    /// `Established` only for an `ESTABLISHED` SA; everything else is down
    pub fn from_state(state: &str) -> Self {
        if state == ESTABLISHED {
            DisplayStatus::Established
        } else {
            DisplayStatus::Down
        }
    }

    /// Label shown to users
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayStatus::Established => "Established",
            DisplayStatus::Down => "Down",
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation boundary that renders entities
pub trait EntitySink: Send + Sync {
    /// Activate a batch of newly created entities
    fn add_entities(&self, entities: &[Arc<TunnelEntity>]) -> Result<()>;

    /// Entity state changed (or was re-read)
    fn publish(&self, entity: &TunnelEntity) -> Result<()>;

    /// Entity was torn down
    fn remove_entity(&self, unique_id: &str) -> Result<()>;
}

/// Observable state of one tunnel
pub struct TunnelEntity {
    tunnel: String,
    coordinator: Arc<Coordinator>,
    sink: Arc<dyn EntitySink>,
    record: Mutex<TunnelRecord>,
    subscription: Mutex<Option<ListenerId>>,
}

impl TunnelEntity {
    /// Create an inactive entity seeded with `initial`
    pub fn new(
        tunnel: String,
        initial: TunnelRecord,
        coordinator: Arc<Coordinator>,
        sink: Arc<dyn EntitySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel,
            coordinator,
            sink,
            record: Mutex::new(initial),
            subscription: Mutex::new(None),
        })
    }

    /// Stable identifier: the tunnel name
    pub fn unique_id(&self) -> &str {
        &self.tunnel
    }

    /// Human-readable name
    pub fn name(&self) -> String {
        format!("IPSec Connection {}", self.tunnel)
    }

    /// Last-known record
    pub fn record(&self) -> TunnelRecord {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Display status of the last-known record
    pub fn status(&self) -> DisplayStatus {
        DisplayStatus::from_state(&self.record().state)
    }

    /// Fixed-shape attribute set, labelled as in [`ATTRIBUTE_LABELS`]
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let record = self.record();
        let values = [
            record.local_addr,
            record.remote_addr,
            record.local_net,
            record.remote_net,
            record.state,
            record.remote_host,
        ];
        ATTRIBUTE_LABELS.into_iter().zip(values).collect()
    }

    /// Always false: updates are pushed by the coordinator
    pub fn should_poll(&self) -> bool {
        false
    }

    /// True between [`activate`](Self::activate) and [`deactivate`](Self::deactivate)
    pub fn is_active(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Subscribe to coordinator updates; no-op if already active
    pub fn activate(self: &Arc<Self>) {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let id = self.coordinator.add_listener(move || match weak.upgrade() {
            Some(entity) => entity.handle_update(),
            None => Ok(()),
        });
        *subscription = Some(id);
    }

    /// Unsubscribe; safe to call more than once
    pub fn deactivate(&self) {
        let id = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.coordinator.remove_listener(id);
            log::debug!("Entity for '{}' unsubscribed", self.tunnel);
        }
    }

    /// Re-read own record from the current snapshot and publish it
    ///
    /// A tunnel missing from the snapshot keeps its last-known attributes.
    pub fn handle_update(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        let snapshot = self.coordinator.data();
        match snapshot.get(&self.tunnel) {
            Some(record) => {
                *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record.clone();
            }
            None => {
                log::debug!(
                    "Tunnel '{}' not in snapshot, keeping last-known state",
                    self.tunnel
                );
            }
        }

        self.sink.publish(self)
    }
}

impl Drop for TunnelEntity {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl fmt::Debug for TunnelEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelEntity")
            .field("tunnel", &self.tunnel)
            .field("record", &self.record())
            .field("active", &self.is_active())
            .finish()
    }
}
