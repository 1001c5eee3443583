//! Unconnected datagrams exchanged with the rendezvous server
//!
//! Peers announce themselves under a token and ask to be introduced to
//! another token. The server answers registrations with a confirmation and
//! punch requests with an introduction sent to both parties.
//!
//! Layout: `[tag][bincode body]`, except the confirmation which is the fixed
//! two bytes `[1][success]`.

use crate::protocol::ProtocolError;
use crate::PeerId;
use std::net::SocketAddr;

pub const REGISTER_TAG: u8 = 1;
pub const PUNCH_REQUEST_TAG: u8 = 2;
pub const INTRODUCTION_TAG: u8 = 3;

/// Builds the token a peer registers under: `"{match_id}:{identity}"`
pub fn make_token(match_id: &str, identity: PeerId) -> String {
    format!("{}:{}", match_id, identity)
}

/// Datagrams a peer sends to the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousRequest {
    Register {
        token: String,
    },
    PunchRequest {
        local_token: String,
        target_token: String,
    },
}

impl RendezvousRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (tag, body) = match self {
            RendezvousRequest::Register { token } => (REGISTER_TAG, bincode::serialize(token)?),
            RendezvousRequest::PunchRequest {
                local_token,
                target_token,
            } => (
                PUNCH_REQUEST_TAG,
                bincode::serialize(&(local_token, target_token))?,
            ),
        };

        Ok(crate::protocol::frame(tag, &body))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = data.split_first().ok_or(ProtocolError::Empty)?;
        match tag {
            REGISTER_TAG => Ok(RendezvousRequest::Register {
                token: bincode::deserialize(body)?,
            }),
            PUNCH_REQUEST_TAG => {
                let (local_token, target_token): (String, String) = bincode::deserialize(body)?;
                Ok(RendezvousRequest::PunchRequest {
                    local_token,
                    target_token,
                })
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Datagrams the rendezvous server sends to peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousResponse {
    RegisterAck {
        success: bool,
    },
    /// `token` names the other party, `endpoint` is where it was seen from
    Introduction {
        token: String,
        endpoint: SocketAddr,
    },
}

impl RendezvousResponse {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            RendezvousResponse::RegisterAck { success } => Ok(vec![REGISTER_TAG, *success as u8]),
            RendezvousResponse::Introduction { token, endpoint } => Ok(crate::protocol::frame(
                INTRODUCTION_TAG,
                &bincode::serialize(&(token, endpoint))?,
            )),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = data.split_first().ok_or(ProtocolError::Empty)?;
        match tag {
            REGISTER_TAG => {
                let success = *body.first().ok_or(ProtocolError::Truncated {
                    tag,
                    needed: 1,
                    got: 0,
                })?;
                Ok(RendezvousResponse::RegisterAck {
                    success: success != 0,
                })
            }
            INTRODUCTION_TAG => {
                let (token, endpoint): (String, SocketAddr) = bincode::deserialize(body)?;
                Ok(RendezvousResponse::Introduction { token, endpoint })
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}
