// VICI control socket client

//! Short-lived VICI sessions against the charon control socket
//!
//! Every query opens its own connection, runs one streamed command
//! (register event, send command, collect events until the response,
//! unregister) and closes the socket again. Retrying is left to the caller.

use super::packet::Packet;
use super::wire::Message;
use crate::error::ViciError;
use crate::fetcher::TunnelSource;
use crate::types::{TunnelConfig, TunnelState};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound for one complete streamed query (seconds)
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Largest frame accepted from the daemon (charon's own limit is 512 KiB)
const MAX_FRAME_LEN: usize = 512 * 1024;

/// Client for the strongSwan VICI socket
#[derive(Debug, Clone)]
pub struct ViciClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ViciClient {
    /// Create a client for the socket at `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    /// Override the per-query timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path of the control socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Raw `list-conn` event messages
    pub async fn list_conns(&self) -> Result<Vec<Message>, ViciError> {
        self.streamed("list-conns", "list-conn").await
    }

    /// Raw `list-sa` event messages
    pub async fn list_sas(&self) -> Result<Vec<Message>, ViciError> {
        self.streamed("list-sas", "list-sa").await
    }

    async fn streamed(&self, command: &str, event: &str) -> Result<Vec<Message>, ViciError> {
        let query = async {
            let mut session = Session::connect(&self.socket_path).await?;
            session.streamed_request(command, event).await
        };

        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(ViciError::connection(
                &self.socket_path,
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer to '{}' within {:?}", command, self.timeout),
                ),
            )),
        }
    }
}

#[async_trait]
impl TunnelSource for ViciClient {
    async fn list_configured_tunnels(&self) -> Result<Vec<TunnelConfig>, ViciError> {
        let mut tunnels = Vec::new();
        for event in self.list_conns().await? {
            tunnels.extend(parse_conn_event(&event)?);
        }
        Ok(tunnels)
    }

    async fn list_active_associations(&self) -> Result<Vec<TunnelState>, ViciError> {
        let mut sas = Vec::new();
        for event in self.list_sas().await? {
            sas.extend(parse_sa_event(&event)?);
        }
        Ok(sas)
    }
}

/// One open connection to the daemon
struct Session<'a> {
    path: &'a Path,
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl<'a> Session<'a> {
    async fn connect(path: &'a Path) -> Result<Session<'a>, ViciError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| ViciError::connection(path, e))?;

        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();

        Ok(Session {
            path,
            framed: Framed::new(stream, codec),
        })
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ViciError> {
        let frame = packet.encode()?;
        self.framed
            .send(frame)
            .await
            .map_err(|e| ViciError::connection(self.path, e))
    }

    async fn recv(&mut self) -> Result<Packet, ViciError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Packet::decode(frame),
            // Oversized frames surface as InvalidData from the codec
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ViciError::protocol(e.to_string()))
            }
            Some(Err(e)) => Err(ViciError::connection(self.path, e)),
            None => Err(ViciError::connection(
                self.path,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection",
                ),
            )),
        }
    }

    async fn change_subscription(&mut self, packet: Packet, event: &str) -> Result<(), ViciError> {
        self.send(packet).await?;
        match self.recv().await? {
            Packet::EventConfirm => Ok(()),
            Packet::EventUnknown => Err(ViciError::protocol(format!(
                "daemon does not know event '{}'",
                event
            ))),
            other => Err(ViciError::protocol(format!(
                "expected EVENT_CONFIRM for '{}', got {}",
                event,
                other.kind()
            ))),
        }
    }

    async fn streamed_request(
        &mut self,
        command: &str,
        event: &str,
    ) -> Result<Vec<Message>, ViciError> {
        self.change_subscription(Packet::EventRegister(event.to_string()), event)
            .await?;

        self.send(Packet::CmdRequest {
            command: command.to_string(),
            message: Message::new(),
        })
        .await?;

        let mut messages = Vec::new();
        loop {
            match self.recv().await? {
                Packet::Event { name, message } if name == event => messages.push(message),
                Packet::Event { name, .. } => {
                    log::debug!("Ignoring unexpected VICI event '{}'", name);
                }
                Packet::CmdResponse(response) => {
                    check_success(&response, command)?;
                    break;
                }
                Packet::CmdUnknown => {
                    return Err(ViciError::protocol(format!(
                        "daemon does not know command '{}'",
                        command
                    )))
                }
                other => {
                    return Err(ViciError::protocol(format!(
                        "unexpected {} while waiting for '{}'",
                        other.kind(),
                        command
                    )))
                }
            }
        }

        self.change_subscription(Packet::EventUnregister(event.to_string()), event)
            .await?;

        log::debug!("VICI '{}' returned {} entries", command, messages.len());
        Ok(messages)
    }
}

fn check_success(response: &Message, command: &str) -> Result<(), ViciError> {
    if response.str("success") == Some(&b"no"[..]) {
        let errmsg = response
            .str("errmsg")
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        return Err(ViciError::protocol(format!(
            "'{}' failed: {}",
            command, errmsg
        )));
    }
    Ok(())
}

fn text(raw: &[u8], tunnel: &str, field: &str) -> Result<String, ViciError> {
    String::from_utf8(raw.to_vec()).map_err(|_| {
        ViciError::protocol(format!(
            "field '{}' of '{}' is not valid UTF-8",
            field, tunnel
        ))
    })
}

/// First item of a list entry, decoded as text
fn first_item(section: &Message, key: &str, tunnel: &str) -> Result<Option<String>, ViciError> {
    section
        .list(key)
        .and_then(|items| items.first())
        .map(|raw| text(raw, tunnel, key))
        .transpose()
}

fn required_item(section: &Message, key: &str, tunnel: &str) -> Result<String, ViciError> {
    first_item(section, key, tunnel)?
        .ok_or_else(|| ViciError::protocol(format!("connection '{}' has no {}", tunnel, key)))
}

fn required_str(section: &Message, key: &str, tunnel: &str) -> Result<String, ViciError> {
    let raw = section
        .str(key)
        .ok_or_else(|| ViciError::protocol(format!("SA '{}' has no {}", tunnel, key)))?;
    text(raw, tunnel, key)
}

/// Decode the connections of one `list-conn` event
///
/// Only the first local/remote address is kept. Traffic selectors come from
/// the child named like the connection, falling back to the first child.
pub fn parse_conn_event(event: &Message) -> Result<Vec<TunnelConfig>, ViciError> {
    event
        .sections()
        .map(|(name, detail)| -> Result<TunnelConfig, ViciError> {
            let child = detail.section("children").and_then(|children| {
                children
                    .section(name)
                    .or_else(|| children.sections().next().map(|(_, c)| c))
            });

            let (local_ts, remote_ts) = match child {
                Some(child) => (
                    first_item(child, "local-ts", name)?,
                    first_item(child, "remote-ts", name)?,
                ),
                None => (None, None),
            };

            Ok(TunnelConfig {
                name: name.to_string(),
                local_addr: required_item(detail, "local_addrs", name)?,
                remote_addr: required_item(detail, "remote_addrs", name)?,
                local_ts,
                remote_ts,
            })
        })
        .collect()
}

/// Decode the IKE SAs of one `list-sa` event
pub fn parse_sa_event(event: &Message) -> Result<Vec<TunnelState>, ViciError> {
    event
        .sections()
        .map(|(name, detail)| -> Result<TunnelState, ViciError> {
            Ok(TunnelState {
                name: name.to_string(),
                state: required_str(detail, "state", name)?,
                remote_host: required_str(detail, "remote-host", name)?,
            })
        })
        .collect()
}
