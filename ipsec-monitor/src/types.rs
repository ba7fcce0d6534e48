// Shared types for the tunnel monitor

//! Shared data structures
//!
//! Tunnel data as reported by the IKE daemon (static configuration and live
//! SA state), the merged per-tunnel record the rest of the crate works on,
//! and the configuration file structures.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// SA state string reported for an up tunnel
pub const ESTABLISHED: &str = "ESTABLISHED";

/// Default strongSwan VICI socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/charon.vici";

/// Default location of the rendered tunnel status file
pub const DEFAULT_STATE_FILE: &str = "/run/ipsec-monitor/tunnels";

/// Static definition of a configured tunnel (`list-conns`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Connection name, unique per daemon
    pub name: String,
    /// First local address (`local_addrs`)
    pub local_addr: String,
    /// First remote address (`remote_addrs`)
    pub remote_addr: String,
    /// First local traffic selector, if the connection has one
    pub local_ts: Option<String>,
    /// First remote traffic selector, if the connection has one
    pub remote_ts: Option<String>,
}

/// Live state of an active IKE SA (`list-sas`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelState {
    /// IKE SA name, matching a connection name
    pub name: String,
    /// Raw SA state, e.g. `ESTABLISHED` or `CONNECTING`
    pub state: String,
    /// Peer address the SA is bound to
    pub remote_host: String,
}

impl TunnelState {
    /// True if the SA is fully established
    pub fn is_established(&self) -> bool {
        self.state == ESTABLISHED
    }
}

/// Configuration merged with live SA state, keyed by tunnel name in a [`TunnelMap`]
///
/// `state` and `remote_host` stay empty while no SA is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelRecord {
    /// Configured local address
    pub local_addr: String,
    /// Configured remote address
    pub remote_addr: String,
    /// Local traffic selector, empty if none
    pub local_net: String,
    /// Remote traffic selector, empty if none
    pub remote_net: String,
    /// Raw SA state, empty while down
    pub state: String,
    /// Peer address of the active SA, empty while down
    pub remote_host: String,
}

impl TunnelRecord {
    /// Build the down-state record for a configured tunnel
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            local_addr: config.local_addr.clone(),
            remote_addr: config.remote_addr.clone(),
            local_net: config.local_ts.clone().unwrap_or_default(),
            remote_net: config.remote_ts.clone().unwrap_or_default(),
            state: String::new(),
            remote_host: String::new(),
        }
    }

    /// Overlay live SA state
    pub fn apply_state(&mut self, sa: &TunnelState) {
        self.state = sa.state.clone();
        self.remote_host = sa.remote_host.clone();
    }

    /// True if the record carries an established SA
    pub fn is_established(&self) -> bool {
        self.state == ESTABLISHED
    }
}

/// Snapshot of every known tunnel, keyed by name
pub type TunnelMap = BTreeMap<String, TunnelRecord>;

/// What happens to an entity whose tunnel disappears from the daemon
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Log the removal, keep the entity with its last-known state
    #[default]
    Retain,
    /// Deactivate the entity and drop it from the registry and sink
    Remove,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// `[general]` table
    #[serde(default)]
    pub general: GeneralConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// VICI control socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Status file written for external tools
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Handling of entities whose tunnel vanished
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
            state_file: default_state_file(),
            removal_policy: RemovalPolicy::default(),
        }
    }
}

// Default values for configuration
fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}
