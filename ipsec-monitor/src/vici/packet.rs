// VICI packet layer

//! VICI packets
//!
//! Each frame on the socket carries one packet: a type byte, a name for the
//! named packet types, and a message payload. Length prefixing is handled by
//! the transport codec, not here.

use super::wire::{self, Message};
use crate::error::ViciError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CMD_REQUEST: u8 = 0;
const CMD_RESPONSE: u8 = 1;
const CMD_UNKNOWN: u8 = 2;
const EVENT_REGISTER: u8 = 3;
const EVENT_UNREGISTER: u8 = 4;
const EVENT_CONFIRM: u8 = 5;
const EVENT_UNKNOWN: u8 = 6;
const EVENT: u8 = 7;

/// One VICI packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Named command with arguments
    CmdRequest {
        /// Command name, e.g. `list-conns`
        command: String,
        /// Command arguments
        message: Message,
    },
    /// Result of the last command
    CmdResponse(Message),
    /// Daemon does not know the command
    CmdUnknown,
    /// Subscribe to a named event stream
    EventRegister(String),
    /// Cancel an event subscription
    EventUnregister(String),
    /// Subscription change accepted
    EventConfirm,
    /// Daemon does not know the event
    EventUnknown,
    /// Named event carrying data
    Event {
        /// Event name, e.g. `list-conn`
        name: String,
        /// Event payload
        message: Message,
    },
}

impl Packet {
    /// Serialize to a frame payload
    pub fn encode(&self) -> Result<Bytes, ViciError> {
        let mut buf = BytesMut::new();
        match self {
            Packet::CmdRequest { command, message } => {
                buf.put_u8(CMD_REQUEST);
                put_packet_name(&mut buf, command)?;
                message.encode(&mut buf)?;
            }
            Packet::CmdResponse(message) => {
                buf.put_u8(CMD_RESPONSE);
                message.encode(&mut buf)?;
            }
            Packet::CmdUnknown => buf.put_u8(CMD_UNKNOWN),
            Packet::EventRegister(name) => {
                buf.put_u8(EVENT_REGISTER);
                put_packet_name(&mut buf, name)?;
            }
            Packet::EventUnregister(name) => {
                buf.put_u8(EVENT_UNREGISTER);
                put_packet_name(&mut buf, name)?;
            }
            Packet::EventConfirm => buf.put_u8(EVENT_CONFIRM),
            Packet::EventUnknown => buf.put_u8(EVENT_UNKNOWN),
            Packet::Event { name, message } => {
                buf.put_u8(EVENT);
                put_packet_name(&mut buf, name)?;
                message.encode(&mut buf)?;
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a frame payload
    pub fn decode<B: Buf>(mut frame: B) -> Result<Self, ViciError> {
        if !frame.has_remaining() {
            return Err(ViciError::protocol("empty packet"));
        }

        let packet = match frame.get_u8() {
            CMD_REQUEST => {
                let command = wire::read_name(&mut frame)?;
                let message = Message::decode(&mut frame)?;
                Packet::CmdRequest { command, message }
            }
            CMD_RESPONSE => Packet::CmdResponse(Message::decode(&mut frame)?),
            CMD_UNKNOWN => Packet::CmdUnknown,
            EVENT_REGISTER => Packet::EventRegister(wire::read_name(&mut frame)?),
            EVENT_UNREGISTER => Packet::EventUnregister(wire::read_name(&mut frame)?),
            EVENT_CONFIRM => Packet::EventConfirm,
            EVENT_UNKNOWN => Packet::EventUnknown,
            EVENT => {
                let name = wire::read_name(&mut frame)?;
                let message = Message::decode(&mut frame)?;
                Packet::Event { name, message }
            }
            other => {
                return Err(ViciError::protocol(format!(
                    "unknown packet type {}",
                    other
                )))
            }
        };

        Ok(packet)
    }

    /// Short label for log and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::CmdRequest { .. } => "CMD_REQUEST",
            Packet::CmdResponse(_) => "CMD_RESPONSE",
            Packet::CmdUnknown => "CMD_UNKNOWN",
            Packet::EventRegister(_) => "EVENT_REGISTER",
            Packet::EventUnregister(_) => "EVENT_UNREGISTER",
            Packet::EventConfirm => "EVENT_CONFIRM",
            Packet::EventUnknown => "EVENT_UNKNOWN",
            Packet::Event { .. } => "EVENT",
        }
    }
}

fn put_packet_name(buf: &mut BytesMut, name: &str) -> Result<(), ViciError> {
    let len = u8::try_from(name.len())
        .map_err(|_| ViciError::protocol(format!("packet name too long: {}", name)))?;
    buf.put_u8(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}
