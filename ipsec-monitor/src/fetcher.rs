// Tunnel repository fetcher

//! Merge configured tunnels with their live SA state
//!
//! Configuration is the source of truth for which tunnels exist: an SA whose
//! name does not match a configured connection is dropped.

use crate::error::ViciError;
use crate::types::{TunnelConfig, TunnelMap, TunnelRecord, TunnelState};
use async_trait::async_trait;
use std::sync::Arc;

/// Query surface of the IKE daemon
#[async_trait]
pub trait TunnelSource: Send + Sync {
    /// All configured connections, active or not
    async fn list_configured_tunnels(&self) -> Result<Vec<TunnelConfig>, ViciError>;

    /// All currently active IKE SAs
    async fn list_active_associations(&self) -> Result<Vec<TunnelState>, ViciError>;
}

/// Builds complete [`TunnelMap`] snapshots from a [`TunnelSource`]
#[derive(Clone)]
pub struct TunnelFetcher {
    source: Arc<dyn TunnelSource>,
}

impl TunnelFetcher {
    /// Create a fetcher over `source`
    pub fn new(source: Arc<dyn TunnelSource>) -> Self {
        Self { source }
    }

    /// Fetch and merge both datasets
    ///
    /// Any failure in either query fails the whole fetch; a partial map is
    /// never returned.
    pub async fn fetch_all(&self) -> Result<TunnelMap, ViciError> {
        let configs = self.source.list_configured_tunnels().await?;
        let mut tunnels = TunnelMap::new();
        for config in &configs {
            if tunnels
                .insert(config.name.clone(), TunnelRecord::from_config(config))
                .is_some()
            {
                log::warn!(
                    "Connection '{}' reported twice, keeping the last definition",
                    config.name
                );
            }
        }

        let sas = self.source.list_active_associations().await?;
        merge_states(&mut tunnels, &sas);

        Ok(tunnels)
    }
}

/// Overlay SA state onto configured tunnels
///
/// SAs without a configured tunnel are discarded. When several SAs share a
/// name (rekey overlap), an established one is not replaced by a later
/// non-established duplicate.
pub fn merge_states(tunnels: &mut TunnelMap, sas: &[TunnelState]) {
    for sa in sas {
        let Some(record) = tunnels.get_mut(&sa.name) else {
            log::debug!("Discarding SA '{}' without a configured connection", sa.name);
            continue;
        };

        if record.is_established() && !sa.is_established() {
            log::debug!(
                "Keeping established state of '{}' over duplicate SA in state {}",
                sa.name,
                sa.state
            );
            continue;
        }

        record.apply_state(sa);
    }
}
