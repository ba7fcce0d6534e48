// Test doubles shared by the unit tests

use crate::entity::{DisplayStatus, EntitySink, TunnelEntity};
use crate::error::ViciError;
use crate::fetcher::TunnelSource;
use crate::types::{TunnelConfig, TunnelState};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

/// Kind of error a [`FakeSource`] query should return
#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    Connection,
    Protocol,
}

impl Failure {
    fn to_error(self) -> ViciError {
        match self {
            Failure::Connection => ViciError::connection(
                "/var/run/charon.vici",
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ),
            Failure::Protocol => ViciError::protocol("unexpected packet"),
        }
    }
}

#[derive(Default)]
struct SourceState {
    configs: Vec<TunnelConfig>,
    sas: Vec<TunnelState>,
    fail: Option<Failure>,
    fail_sas: Option<Failure>,
}

/// Scriptable in-memory daemon
#[derive(Default)]
pub(crate) struct FakeSource {
    state: Mutex<SourceState>,
    fetches: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    entered: Notify,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_configs(&self, configs: Vec<TunnelConfig>) {
        self.state.lock().unwrap().configs = configs;
    }

    pub(crate) fn set_sas(&self, sas: Vec<TunnelState>) {
        self.state.lock().unwrap().sas = sas;
    }

    pub(crate) fn fail_with(&self, failure: Option<Failure>) {
        self.state.lock().unwrap().fail = failure;
    }

    pub(crate) fn fail_sas_with(&self, failure: Option<Failure>) {
        self.state.lock().unwrap().fail_sas = failure;
    }

    /// Block every configuration query until permits are added to the
    /// returned semaphore
    pub(crate) fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Wait until a configuration query reaches the gate
    pub(crate) async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Number of configuration queries started so far
    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelSource for FakeSource {
    async fn list_configured_tunnels(&self) -> Result<Vec<TunnelConfig>, ViciError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| ViciError::protocol("gate closed"))?;
        }

        let state = self.state.lock().unwrap();
        match state.fail {
            Some(failure) => Err(failure.to_error()),
            None => Ok(state.configs.clone()),
        }
    }

    async fn list_active_associations(&self) -> Result<Vec<TunnelState>, ViciError> {
        let state = self.state.lock().unwrap();
        match state.fail_sas {
            Some(failure) => Err(failure.to_error()),
            None => Ok(state.sas.clone()),
        }
    }
}

pub(crate) fn config(name: &str, local: &str, remote: &str) -> TunnelConfig {
    TunnelConfig {
        name: name.to_string(),
        local_addr: local.to_string(),
        remote_addr: remote.to_string(),
        local_ts: Some("192.168.1.0/24".to_string()),
        remote_ts: Some("192.168.2.0/24".to_string()),
    }
}

pub(crate) fn sa(name: &str, state: &str, remote_host: &str) -> TunnelState {
    TunnelState {
        name: name.to_string(),
        state: state.to_string(),
        remote_host: remote_host.to_string(),
    }
}

/// Sink that records every call
#[derive(Default)]
pub(crate) struct RecordingSink {
    batches: Mutex<Vec<Vec<String>>>,
    published: Mutex<Vec<(String, DisplayStatus)>>,
    removed: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
    fail_adds: AtomicUsize,
    fail_removes: AtomicUsize,
}

/// Consume one scheduled failure, if any is left
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl RecordingSink {
    pub(crate) fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, DisplayStatus)> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub(crate) fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `add_entities`
    pub(crate) fn fail_next_adds(&self, n: usize) {
        self.fail_adds.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `remove_entity`
    pub(crate) fn fail_next_removes(&self, n: usize) {
        self.fail_removes.store(n, Ordering::SeqCst);
    }
}

impl EntitySink for RecordingSink {
    fn add_entities(&self, entities: &[Arc<TunnelEntity>]) -> anyhow::Result<()> {
        if take_failure(&self.fail_adds) {
            anyhow::bail!("sink rejected batch");
        }
        self.batches
            .lock()
            .unwrap()
            .push(entities.iter().map(|e| e.unique_id().to_string()).collect());
        Ok(())
    }

    fn publish(&self, entity: &TunnelEntity) -> anyhow::Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        self.published
            .lock()
            .unwrap()
            .push((entity.unique_id().to_string(), entity.status()));
        Ok(())
    }

    fn remove_entity(&self, unique_id: &str) -> anyhow::Result<()> {
        if take_failure(&self.fail_removes) {
            anyhow::bail!("sink rejected removal of {}", unique_id);
        }
        self.removed.lock().unwrap().push(unique_id.to_string());
        Ok(())
    }
}
