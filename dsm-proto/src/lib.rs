//! Wire message types for the DSM coherence protocol.
//!
//! Every message is framed as a fixed 14-byte header
//! `{msg_type:u8, page_index:u64, requester:u32, granted_state:u8}`,
//! all integers little-endian, optionally followed by `page_size` bytes of
//! page payload when `msg_type == PageData`. The header shape is reused for
//! the barrier/lock control messages (§4.5) by repurposing `page_index` as
//! the barrier epoch or lock id — they carry no page payload.

use std::convert::TryFrom;
use std::io::{self, Read, Write};

pub type NodeId = u32;
pub type PageIndex = u64;

/// Size, in bytes, of the fixed message header.
pub const HEADER_LEN: usize = 1 + 8 + 4 + 1;

/// Read or write access that triggered a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    fn to_byte(self) -> u8 {
        match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AccessKind::Read),
            1 => Some(AccessKind::Write),
            _ => None,
        }
    }
}

/// Rights a `PageData` transfer installs the page with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantedState {
    Shared,
    Modified,
}

impl GrantedState {
    fn to_byte(self) -> u8 {
        match self {
            GrantedState::Shared => 0,
            GrantedState::Modified => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(GrantedState::Shared),
            1 => Some(GrantedState::Modified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MsgType {
    ReadReq = 1,
    WriteReq = 2,
    ForwardRead = 3,
    ForwardWrite = 4,
    PageData = 5,
    Invalidate = 6,
    InvAck = 7,
    Ack = 8,
    Gone = 9,
    BarrierEnter = 10,
    BarrierRelease = 11,
    LockReq = 12,
    LockRel = 13,
    LockGrant = 14,
    Leave = 15,
    UpgradeGrant = 16,
}

impl TryFrom<u8> for MsgType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            1 => MsgType::ReadReq,
            2 => MsgType::WriteReq,
            3 => MsgType::ForwardRead,
            4 => MsgType::ForwardWrite,
            5 => MsgType::PageData,
            6 => MsgType::Invalidate,
            7 => MsgType::InvAck,
            8 => MsgType::Ack,
            9 => MsgType::Gone,
            10 => MsgType::BarrierEnter,
            11 => MsgType::BarrierRelease,
            12 => MsgType::LockReq,
            13 => MsgType::LockRel,
            14 => MsgType::LockGrant,
            15 => MsgType::Leave,
            16 => MsgType::UpgradeGrant,
            other => return Err(FrameError::UnknownMsgType(other)),
        })
    }
}

/// A fully decoded protocol message, tagged with the node that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// "I need a shared copy." (Requester -> Manager)
    ReadReq { page: PageIndex, requester: NodeId },
    /// "I need exclusive ownership." (Requester -> Manager)
    WriteReq { page: PageIndex, requester: NodeId },
    /// Instructs the current owner to transfer the page. (Manager -> Owner)
    Forward {
        page: PageIndex,
        requester: NodeId,
        kind: AccessKind,
    },
    /// Carries a page copy and the rights to install it with.
    PageData {
        page: PageIndex,
        requester: NodeId,
        granted: GrantedState,
        bytes: Vec<u8>,
    },
    /// Drop a shared copy. (Manager -> Sharer)
    Invalidate { page: PageIndex },
    /// Acknowledges an invalidation. (Sharer -> Manager)
    InvAck { page: PageIndex, from: NodeId },
    /// "Installed; release the serialization slot." (Requester -> Manager)
    Ack { page: PageIndex, from: NodeId },
    /// A `Forward` raced a `dsm_free`; there is no page to send.
    Gone { page: PageIndex, from: NodeId },
    /// Collective barrier arrival. (Node -> Manager)
    BarrierEnter { epoch: u64, from: NodeId },
    /// Barrier release after all arrivals collected. (Manager -> Node)
    BarrierRelease { epoch: u64 },
    /// Request a named lock. (Node -> Manager)
    LockReq { lock_id: u64, from: NodeId },
    /// Release a named lock. (Node -> Manager)
    LockRel { lock_id: u64, from: NodeId },
    /// Grants a previously requested lock. (Manager -> Node)
    LockGrant { lock_id: u64 },
    /// Collective shutdown notice. (Node -> Manager)
    Leave { from: NodeId },
    /// Grants write rights on a page the requester already holds `Shared`
    /// locally, once the other sharers have been invalidated — the
    /// no-payload counterpart of `PageData` for the §4.3 "Upgrade" case,
    /// where no page bytes need to move. (Manager -> Requester)
    UpgradeGrant { page: PageIndex, requester: NodeId },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown wire message type {0}")]
    UnknownMsgType(u8),
    #[error("unknown granted-state byte {0}")]
    UnknownGrantedState(u8),
    #[error("unknown access-kind byte {0}")]
    UnknownAccessKind(u8),
    #[error("i/o error while framing a message: {0}")]
    Io(#[from] io::Error),
}

impl Message {
    /// Encode this message onto `w` as a header, then the page payload for
    /// `PageData`. Matches the 14-byte header layout fixed by the spec.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), FrameError> {
        let mut header = [0u8; HEADER_LEN];
        match self {
            Message::ReadReq { page, requester } => {
                encode_header(&mut header, MsgType::ReadReq, *page, *requester, 0);
            }
            Message::WriteReq { page, requester } => {
                encode_header(&mut header, MsgType::WriteReq, *page, *requester, 0);
            }
            Message::Forward {
                page,
                requester,
                kind,
            } => {
                let t = match kind {
                    AccessKind::Read => MsgType::ForwardRead,
                    AccessKind::Write => MsgType::ForwardWrite,
                };
                encode_header(&mut header, t, *page, *requester, 0);
            }
            Message::PageData {
                page,
                requester,
                granted,
                ..
            } => {
                encode_header(
                    &mut header,
                    MsgType::PageData,
                    *page,
                    *requester,
                    granted.to_byte(),
                );
            }
            Message::Invalidate { page } => {
                encode_header(&mut header, MsgType::Invalidate, *page, 0, 0);
            }
            Message::InvAck { page, from } => {
                encode_header(&mut header, MsgType::InvAck, *page, *from, 0);
            }
            Message::Ack { page, from } => {
                encode_header(&mut header, MsgType::Ack, *page, *from, 0);
            }
            Message::Gone { page, from } => {
                encode_header(&mut header, MsgType::Gone, *page, *from, 0);
            }
            Message::BarrierEnter { epoch, from } => {
                encode_header(&mut header, MsgType::BarrierEnter, *epoch, *from, 0);
            }
            Message::BarrierRelease { epoch } => {
                encode_header(&mut header, MsgType::BarrierRelease, *epoch, 0, 0);
            }
            Message::LockReq { lock_id, from } => {
                encode_header(&mut header, MsgType::LockReq, *lock_id, *from, 0);
            }
            Message::LockRel { lock_id, from } => {
                encode_header(&mut header, MsgType::LockRel, *lock_id, *from, 0);
            }
            Message::LockGrant { lock_id } => {
                encode_header(&mut header, MsgType::LockGrant, *lock_id, 0, 0);
            }
            Message::Leave { from } => {
                encode_header(&mut header, MsgType::Leave, 0, *from, 0);
            }
            Message::UpgradeGrant { page, requester } => {
                encode_header(&mut header, MsgType::UpgradeGrant, *page, *requester, 0);
            }
        }
        w.write_all(&header)?;
        if let Message::PageData { bytes, .. } = self {
            w.write_all(bytes)?;
        }
        Ok(())
    }

    /// Decode one message from `r`. `page_size` is needed to know how many
    /// trailing bytes to read for `PageData`.
    pub fn read_from<R: Read>(r: &mut R, page_size: usize) -> Result<Self, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header)?;
        let (msg_type, page_index, requester, granted_state) = decode_header(&header)?;

        Ok(match msg_type {
            MsgType::ReadReq => Message::ReadReq {
                page: page_index,
                requester,
            },
            MsgType::WriteReq => Message::WriteReq {
                page: page_index,
                requester,
            },
            MsgType::ForwardRead | MsgType::ForwardWrite => Message::Forward {
                page: page_index,
                requester,
                kind: if msg_type == MsgType::ForwardRead {
                    AccessKind::Read
                } else {
                    AccessKind::Write
                },
            },
            MsgType::PageData => {
                let granted = GrantedState::from_byte(granted_state)
                    .ok_or(FrameError::UnknownGrantedState(granted_state))?;
                let mut bytes = vec![0u8; page_size];
                r.read_exact(&mut bytes)?;
                Message::PageData {
                    page: page_index,
                    requester,
                    granted,
                    bytes,
                }
            }
            MsgType::Invalidate => Message::Invalidate { page: page_index },
            MsgType::InvAck => Message::InvAck {
                page: page_index,
                from: requester,
            },
            MsgType::Ack => Message::Ack {
                page: page_index,
                from: requester,
            },
            MsgType::Gone => Message::Gone {
                page: page_index,
                from: requester,
            },
            MsgType::BarrierEnter => Message::BarrierEnter {
                epoch: page_index,
                from: requester,
            },
            MsgType::BarrierRelease => Message::BarrierRelease { epoch: page_index },
            MsgType::LockReq => Message::LockReq {
                lock_id: page_index,
                from: requester,
            },
            MsgType::LockRel => Message::LockRel {
                lock_id: page_index,
                from: requester,
            },
            MsgType::LockGrant => Message::LockGrant { lock_id: page_index },
            MsgType::Leave => Message::Leave { from: requester },
            MsgType::UpgradeGrant => Message::UpgradeGrant {
                page: page_index,
                requester,
            },
        })
    }

    /// Whether this variant carries a trailing page payload.
    pub fn is_page_data(&self) -> bool {
        matches!(self, Message::PageData { .. })
    }
}

fn encode_header(out: &mut [u8; HEADER_LEN], ty: MsgType, page: u64, requester: u32, granted: u8) {
    out[0] = ty as u8;
    out[1..9].copy_from_slice(&page.to_le_bytes());
    out[9..13].copy_from_slice(&requester.to_le_bytes());
    out[13] = granted;
}

fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<(MsgType, u64, u32, u8), FrameError> {
    let ty = MsgType::try_from(buf[0])?;
    let page = u64::from_le_bytes(buf[1..9].try_into().unwrap());
    let requester = u32::from_le_bytes(buf[9..13].try_into().unwrap());
    let granted = buf[13];
    Ok((ty, page, requester, granted))
}

/// The transport collaborator's contract: deliver framed messages between
/// nodes in order per (source, destination) pair, at-least-once within a
/// connection's lifetime, with duplicate suppression at the framing layer.
/// `dsm-core` depends only on this trait, never on a concrete transport, so
/// its protocol tests can run against an in-memory double.
pub trait Transport: Send + Sync {
    /// Send `msg` to node `to`. Sending to `local_node()` is a valid
    /// same-process short-circuit (used by the manager-local fault path of
    /// §4.3) and must not touch the network.
    fn send(&self, to: NodeId, msg: Message) -> Result<(), TransportError>;

    /// Block until the next inbound message arrives.
    fn recv(&self) -> Result<Message, TransportError>;

    /// Non-blocking poll for the next inbound message.
    fn try_recv(&self) -> Result<Option<Message>, TransportError>;

    fn local_node(&self) -> NodeId;

    fn manager_node(&self) -> NodeId;

    /// Begin draining: stop accepting new sends is the caller's
    /// responsibility (via `DsmError::Shutdown`); this only tears down
    /// sockets/threads.
    fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to manager at {0}: {1}")]
    Connect(String, #[source] std::io::Error),
    #[error("i/o error on connection to node {node}: {source}")]
    Io {
        node: NodeId,
        #[source]
        source: std::io::Error,
    },
    #[error("no connection to node {0}")]
    NoSuchPeer(NodeId),
    #[error("connection to node {0} was lost")]
    ConnectionLost(NodeId),
    #[error("message framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("transport has been shut down")]
    ShutDown,
}

/// Cluster configuration, validated once at `init()`.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub port: u16,
    pub num_nodes: u32,
    pub is_manager: bool,
    pub manager_host: Option<String>,
    pub log_level: u8,
    pub page_size: Option<usize>,
    /// Per-round protocol deadline before the bounded retry of §9 kicks in.
    pub protocol_timeout: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 0,
            port: 9000,
            num_nodes: 1,
            is_manager: true,
            manager_host: None,
            log_level: 2,
            page_size: None,
            protocol_timeout: std::time::Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id {node_id} must be < num_nodes {num_nodes}")]
    NodeIdOutOfRange { node_id: NodeId, num_nodes: u32 },
    #[error("num_nodes must be >= 1")]
    ZeroNodes,
    #[error("non-manager node requires manager_host")]
    MissingManagerHost,
    #[error("manager node must not set manager_host")]
    ManagerHasManagerHost,
    #[error("log_level {0} out of range 0..=4")]
    BadLogLevel(u8),
    #[error("page_size override {given} does not match host page size {host}")]
    PageSizeMismatch { given: usize, host: usize },
}

impl Config {
    pub fn validate(&self, host_page_size: usize) -> Result<(), ConfigError> {
        if self.num_nodes == 0 {
            return Err(ConfigError::ZeroNodes);
        }
        if self.node_id >= self.num_nodes {
            return Err(ConfigError::NodeIdOutOfRange {
                node_id: self.node_id,
                num_nodes: self.num_nodes,
            });
        }
        if self.log_level > 4 {
            return Err(ConfigError::BadLogLevel(self.log_level));
        }
        if self.is_manager {
            if self.manager_host.is_some() {
                return Err(ConfigError::ManagerHasManagerHost);
            }
        } else if self.manager_host.is_none() {
            return Err(ConfigError::MissingManagerHost);
        }
        if let Some(given) = self.page_size {
            if given != host_page_size {
                return Err(ConfigError::PageSizeMismatch {
                    given,
                    host: host_page_size,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message, page_size: usize) {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let decoded = Message::read_from(&mut cursor, page_size).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn read_req_roundtrips() {
        roundtrip(
            Message::ReadReq {
                page: 42,
                requester: 3,
            },
            4096,
        );
    }

    #[test]
    fn page_data_roundtrips_with_payload() {
        roundtrip(
            Message::PageData {
                page: 7,
                requester: 1,
                granted: GrantedState::Modified,
                bytes: vec![0xAB; 4096],
            },
            4096,
        );
    }

    #[test]
    fn forward_carries_access_kind() {
        roundtrip(
            Message::Forward {
                page: 1,
                requester: 2,
                kind: AccessKind::Write,
            },
            4096,
        );
    }

    #[test]
    fn upgrade_grant_roundtrips() {
        roundtrip(
            Message::UpgradeGrant {
                page: 9,
                requester: 4,
            },
            4096,
        );
    }

    #[test]
    fn barrier_and_lock_messages_roundtrip() {
        roundtrip(Message::BarrierEnter { epoch: 5, from: 1 }, 4096);
        roundtrip(Message::BarrierRelease { epoch: 5 }, 4096);
        roundtrip(Message::LockReq { lock_id: 0, from: 2 }, 4096);
        roundtrip(Message::LockGrant { lock_id: 0 }, 4096);
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let mut buf = vec![0xFFu8; HEADER_LEN];
        buf[1..9].copy_from_slice(&0u64.to_le_bytes());
        let mut cursor = io::Cursor::new(buf);
        let err = Message::read_from(&mut cursor, 4096).unwrap_err();
        assert!(matches!(err, FrameError::UnknownMsgType(0xFF)));
    }

    #[test]
    fn config_rejects_node_id_out_of_range() {
        let cfg = Config {
            node_id: 5,
            num_nodes: 3,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(4096),
            Err(ConfigError::NodeIdOutOfRange { .. })
        ));
    }

    #[test]
    fn config_requires_manager_host_for_non_manager() {
        let cfg = Config {
            is_manager: false,
            manager_host: None,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(4096),
            Err(ConfigError::MissingManagerHost)
        ));
    }

    #[test]
    fn config_rejects_page_size_mismatch() {
        let cfg = Config {
            page_size: Some(8192),
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(4096),
            Err(ConfigError::PageSizeMismatch { .. })
        ));
    }
}
