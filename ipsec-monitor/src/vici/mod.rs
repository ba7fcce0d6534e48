//! strongSwan VICI protocol
//!
//! - [`wire`]: message element codec
//! - [`packet`]: packet types carried in each length-prefixed frame
//! - [`client`]: short-lived socket sessions and tunnel decoding

pub mod client;
pub mod packet;
pub mod wire;

pub use client::ViciClient;
pub use packet::Packet;
pub use wire::{Message, Value};
