//! Tag-framed mesh messages
//!
//! Every packet exchanged between mesh peers is `[1-byte tag][payload]`.
//! Tags fall into three classes:
//! - infrastructure tags are consumed by the mesh layer and never surface
//! - mixed tags update mesh bookkeeping and are then handed to the game
//! - every other tag is opaque game traffic passed through untouched
//!
//! Infrastructure bodies are bincode-encoded. Mixed bodies use a fixed
//! little-endian layout so game code can build them without the codec.

use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Tags at or above this value are never claimed by the mesh layer
pub const FIRST_GAME_TAG: u8 = 32;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty packet")]
    Empty,
    #[error("tag {0} is not a mesh message")]
    UnknownTag(u8),
    #[error("tag {tag} needs {needed} payload bytes, got {got}")]
    Truncated { tag: u8, needed: usize, got: usize },
    #[error("malformed body: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("invalid slot {0}")]
    InvalidSlot(u8),
}

/// How the mesh layer treats a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Infrastructure,
    Mixed,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ClientJoin = 1,
    PeerList = 2,
    PeerHello = 3,
    PeerAck = 4,
    MeshReady = 5,
    CoordinatorAnnounce = 6,

    Ready = 16,
    LoadComplete = 17,
    MatchStart = 18,
    StartCountdown = 19,
    SyncCheck = 20,
    DesyncNotify = 21,
    RestartReady = 22,
}

impl MessageType {
    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let message_type = match tag {
            1 => MessageType::ClientJoin,
            2 => MessageType::PeerList,
            3 => MessageType::PeerHello,
            4 => MessageType::PeerAck,
            5 => MessageType::MeshReady,
            6 => MessageType::CoordinatorAnnounce,
            16 => MessageType::Ready,
            17 => MessageType::LoadComplete,
            18 => MessageType::MatchStart,
            19 => MessageType::StartCountdown,
            20 => MessageType::SyncCheck,
            21 => MessageType::DesyncNotify,
            22 => MessageType::RestartReady,
            _ => return None,
        };
        Some(message_type)
    }

    pub fn class(self) -> MessageClass {
        match self {
            MessageType::ClientJoin
            | MessageType::PeerList
            | MessageType::PeerHello
            | MessageType::PeerAck
            | MessageType::MeshReady
            | MessageType::CoordinatorAnnounce => MessageClass::Infrastructure,
            MessageType::Ready
            | MessageType::LoadComplete
            | MessageType::MatchStart
            | MessageType::StartCountdown
            | MessageType::SyncCheck
            | MessageType::DesyncNotify
            | MessageType::RestartReady => MessageClass::Mixed,
        }
    }

    /// Smallest payload (tag excluded) a mixed message can carry
    pub fn min_payload_len(self) -> usize {
        match self {
            MessageType::Ready => 1,
            MessageType::SyncCheck => 12,
            MessageType::DesyncNotify => 4,
            _ => 0,
        }
    }
}

/// Classifies a raw tag. Unknown tags are passthrough.
pub fn classify(tag: u8) -> MessageClass {
    MessageType::from_tag(tag)
        .map(MessageType::class)
        .unwrap_or(MessageClass::Passthrough)
}

/// Prepends `tag` to `payload`
pub fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(tag);
    data.extend_from_slice(payload);
    data
}

/// One occupied slot as distributed in a peer list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub slot: u8,
    pub identity: PeerId,
    pub display_name: String,
    /// Address other peers should dial; `None` when only the port is known
    pub address: Option<IpAddr>,
    pub port: u16,
    pub nat_token: String,
}

/// Messages consumed entirely by the mesh layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    ClientJoin {
        identity: PeerId,
        display_name: String,
        listen_port: u16,
    },
    PeerList {
        coordinator_slot: u8,
        peers: Vec<PeerEntry>,
    },
    PeerHello {
        slot: u8,
        identity: PeerId,
        display_name: String,
    },
    PeerAck {
        slot: u8,
        identity: PeerId,
        display_name: String,
    },
    MeshReady {
        slot: u8,
    },
    CoordinatorAnnounce {
        slot: u8,
    },
}

impl MeshMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            MeshMessage::ClientJoin { .. } => MessageType::ClientJoin,
            MeshMessage::PeerList { .. } => MessageType::PeerList,
            MeshMessage::PeerHello { .. } => MessageType::PeerHello,
            MeshMessage::PeerAck { .. } => MessageType::PeerAck,
            MeshMessage::MeshReady { .. } => MessageType::MeshReady,
            MeshMessage::CoordinatorAnnounce { .. } => MessageType::CoordinatorAnnounce,
        }
    }

    /// Encodes the message including its leading tag
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            MeshMessage::ClientJoin {
                identity,
                display_name,
                listen_port,
            } => bincode::serialize(&(identity, display_name, listen_port))?,
            MeshMessage::PeerList {
                coordinator_slot,
                peers,
            } => bincode::serialize(&(coordinator_slot, peers))?,
            MeshMessage::PeerHello {
                slot,
                identity,
                display_name,
            }
            | MeshMessage::PeerAck {
                slot,
                identity,
                display_name,
            } => bincode::serialize(&(slot, identity, display_name))?,
            MeshMessage::MeshReady { slot } | MeshMessage::CoordinatorAnnounce { slot } => {
                vec![*slot]
            }
        };

        Ok(frame(self.message_type().tag(), &body))
    }

    /// Decodes a full packet (tag included)
    ///
    /// Slots outside the mesh are rejected here so handlers can index the
    /// slot table directly.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = data.split_first().ok_or(ProtocolError::Empty)?;
        let message_type = MessageType::from_tag(tag)
            .filter(|t| t.class() == MessageClass::Infrastructure)
            .ok_or(ProtocolError::UnknownTag(tag))?;

        let message = match message_type {
            MessageType::ClientJoin => {
                let (identity, display_name, listen_port): (PeerId, String, u16) =
                    bincode::deserialize(body)?;
                MeshMessage::ClientJoin {
                    identity,
                    display_name,
                    listen_port,
                }
            }
            MessageType::PeerList => {
                let (coordinator_slot, peers): (u8, Vec<PeerEntry>) = bincode::deserialize(body)?;
                check_slot(coordinator_slot)?;
                for entry in &peers {
                    check_slot(entry.slot)?;
                }
                MeshMessage::PeerList {
                    coordinator_slot,
                    peers,
                }
            }
            MessageType::PeerHello | MessageType::PeerAck => {
                let (slot, identity, display_name): (u8, PeerId, String) =
                    bincode::deserialize(body)?;
                check_slot(slot)?;
                if message_type == MessageType::PeerHello {
                    MeshMessage::PeerHello {
                        slot,
                        identity,
                        display_name,
                    }
                } else {
                    MeshMessage::PeerAck {
                        slot,
                        identity,
                        display_name,
                    }
                }
            }
            MessageType::MeshReady | MessageType::CoordinatorAnnounce => {
                let slot = *body.first().ok_or(ProtocolError::Truncated {
                    tag,
                    needed: 1,
                    got: 0,
                })?;
                check_slot(slot)?;
                if message_type == MessageType::MeshReady {
                    MeshMessage::MeshReady { slot }
                } else {
                    MeshMessage::CoordinatorAnnounce { slot }
                }
            }
            _ => return Err(ProtocolError::UnknownTag(tag)),
        };

        Ok(message)
    }
}

fn check_slot(slot: u8) -> Result<(), ProtocolError> {
    if (slot as usize) < crate::MAX_PEERS {
        Ok(())
    } else {
        Err(ProtocolError::InvalidSlot(slot))
    }
}

/// Messages the mesh layer reads before forwarding them to the game
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixedMessage {
    Ready { ready: bool },
    LoadComplete,
    MatchStart,
    StartCountdown,
    SyncCheck { frame: u32, hash: u64 },
    DesyncNotify { frame: u32 },
    RestartReady,
}

impl MixedMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            MixedMessage::Ready { .. } => MessageType::Ready,
            MixedMessage::LoadComplete => MessageType::LoadComplete,
            MixedMessage::MatchStart => MessageType::MatchStart,
            MixedMessage::StartCountdown => MessageType::StartCountdown,
            MixedMessage::SyncCheck { .. } => MessageType::SyncCheck,
            MixedMessage::DesyncNotify { .. } => MessageType::DesyncNotify,
            MixedMessage::RestartReady => MessageType::RestartReady,
        }
    }

    /// Parses the payload (tag excluded) of a mixed message
    ///
    /// Bytes past the fixed layout belong to the game and are ignored.
    pub fn parse(tag: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let message_type = MessageType::from_tag(tag)
            .filter(|t| t.class() == MessageClass::Mixed)
            .ok_or(ProtocolError::UnknownTag(tag))?;

        let needed = message_type.min_payload_len();
        if payload.len() < needed {
            return Err(ProtocolError::Truncated {
                tag,
                needed,
                got: payload.len(),
            });
        }

        let message = match message_type {
            MessageType::Ready => MixedMessage::Ready {
                ready: payload[0] != 0,
            },
            MessageType::LoadComplete => MixedMessage::LoadComplete,
            MessageType::MatchStart => MixedMessage::MatchStart,
            MessageType::StartCountdown => MixedMessage::StartCountdown,
            MessageType::SyncCheck => MixedMessage::SyncCheck {
                frame: read_u32(&payload[0..4]),
                hash: read_u64(&payload[4..12]),
            },
            MessageType::DesyncNotify => MixedMessage::DesyncNotify {
                frame: read_u32(&payload[0..4]),
            },
            MessageType::RestartReady => MixedMessage::RestartReady,
            _ => return Err(ProtocolError::UnknownTag(tag)),
        };

        Ok(message)
    }

    /// Payload bytes (tag excluded) in the layout [`MixedMessage::parse`] reads
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            MixedMessage::Ready { ready } => vec![*ready as u8],
            MixedMessage::SyncCheck { frame, hash } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&frame.to_le_bytes());
                payload.extend_from_slice(&hash.to_le_bytes());
                payload
            }
            MixedMessage::DesyncNotify { frame } => frame.to_le_bytes().to_vec(),
            MixedMessage::LoadComplete
            | MixedMessage::MatchStart
            | MixedMessage::StartCountdown
            | MixedMessage::RestartReady => Vec::new(),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_classification() {
        assert_eq!(classify(1), MessageClass::Infrastructure);
        assert_eq!(classify(6), MessageClass::Infrastructure);
        assert_eq!(classify(16), MessageClass::Mixed);
        assert_eq!(classify(22), MessageClass::Mixed);
        assert_eq!(classify(0), MessageClass::Passthrough);
        assert_eq!(classify(7), MessageClass::Passthrough);
        assert_eq!(classify(FIRST_GAME_TAG), MessageClass::Passthrough);
        assert_eq!(classify(255), MessageClass::Passthrough);
    }

    #[test]
    fn test_every_known_tag_resolves() {
        for tag in 0..=u8::MAX {
            if let Some(message_type) = MessageType::from_tag(tag) {
                assert_eq!(message_type.tag(), tag);
                assert_ne!(message_type.class(), MessageClass::Passthrough);
            }
        }
    }

    #[test]
    fn test_peer_list_encoding() {
        let message = MeshMessage::PeerList {
            coordinator_slot: 0,
            peers: vec![
                PeerEntry {
                    slot: 0,
                    identity: PeerId::from_u128(1),
                    display_name: "host".to_string(),
                    address: None,
                    port: 7777,
                    nat_token: String::new(),
                },
                PeerEntry {
                    slot: 1,
                    identity: PeerId::from_u128(2),
                    display_name: "guest".to_string(),
                    address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
                    port: 40000,
                    nat_token: "m:2".to_string(),
                },
            ],
        };

        let data = message.encode().unwrap();
        assert_eq!(data[0], MessageType::PeerList.tag());
        assert_eq!(MeshMessage::decode(&data).unwrap(), message);
    }

    #[test]
    fn test_slot_messages_are_two_bytes() {
        let data = MeshMessage::CoordinatorAnnounce { slot: 3 }.encode().unwrap();
        assert_eq!(data, vec![MessageType::CoordinatorAnnounce.tag(), 3]);
    }

    #[test]
    fn test_decode_rejects_short_packets() {
        assert!(matches!(MeshMessage::decode(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(
            MeshMessage::decode(&[MessageType::MeshReady.tag()]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            MeshMessage::decode(&[MessageType::ClientJoin.tag(), 1, 2]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_out_of_range_slot() {
        assert!(matches!(
            MeshMessage::decode(&[MessageType::MeshReady.tag(), 8]),
            Err(ProtocolError::InvalidSlot(8))
        ));
    }

    #[test]
    fn test_decode_rejects_non_infrastructure_tags() {
        assert!(matches!(
            MeshMessage::decode(&[MessageType::Ready.tag(), 1]),
            Err(ProtocolError::UnknownTag(16))
        ));
        assert!(matches!(
            MeshMessage::decode(&[200, 1, 2, 3]),
            Err(ProtocolError::UnknownTag(200))
        ));
    }

    #[test]
    fn test_mixed_parse() {
        let sync = MixedMessage::SyncCheck {
            frame: 600,
            hash: 0xdead_beef_0bad_f00d,
        };
        let payload = sync.encode_payload();
        assert_eq!(payload.len(), 12);
        assert_eq!(
            MixedMessage::parse(MessageType::SyncCheck.tag(), &payload).unwrap(),
            sync
        );

        assert_eq!(
            MixedMessage::parse(MessageType::Ready.tag(), &[0, 9, 9]).unwrap(),
            MixedMessage::Ready { ready: false }
        );
        assert_eq!(
            MixedMessage::parse(MessageType::MatchStart.tag(), &[]).unwrap(),
            MixedMessage::MatchStart
        );
    }

    #[test]
    fn test_mixed_parse_truncated() {
        assert!(matches!(
            MixedMessage::parse(MessageType::Ready.tag(), &[]),
            Err(ProtocolError::Truncated {
                needed: 1,
                got: 0,
                ..
            })
        ));
        assert!(matches!(
            MixedMessage::parse(MessageType::SyncCheck.tag(), &[0; 11]),
            Err(ProtocolError::Truncated { needed: 12, .. })
        ));
        assert!(MixedMessage::parse(MessageType::PeerAck.tag(), &[0]).is_err());
    }

    #[test]
    fn test_frame() {
        assert_eq!(frame(40, &[1, 2]), vec![40, 1, 2]);
        assert_eq!(frame(40, &[]), vec![40]);
    }
}
