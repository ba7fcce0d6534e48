// IPsec Tunnel Monitor Library
// Shared modules for daemon and tests

#![warn(missing_docs)]

//! IPsec Tunnel Monitor Library
//!
//! This library polls a strongSwan IKE daemon over its VICI control socket,
//! keeps a snapshot of every configured tunnel merged with its live SA state,
//! and keeps one observable entity per tunnel in sync with that snapshot.
//!
//! # Main Components
//!
//! - [`config`]: Configuration file parsing and validation
//! - [`coordinator`]: Periodic and on-demand refresh with listener fan-out
//! - [`entity`]: Per-tunnel entities and the presentation sink boundary
//! - [`error`]: Control socket error taxonomy
//! - [`fetcher`]: Merge of configured tunnels with live SA state
//! - [`reconciler`]: Entity creation and removal as tunnels come and go
//! - [`state_file`]: Status file rendering for external tools
//! - [`types`]: Shared data structures
//! - [`vici`]: VICI protocol codec and client

pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod fetcher;
pub mod reconciler;
pub mod state_file;
pub mod types;
pub mod vici;

#[cfg(test)]
pub(crate) mod testing;
