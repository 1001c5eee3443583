use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("mesh networking is already running")]
    AlreadyRunning,
    #[error("the empty peer identity cannot join a mesh")]
    InvalidIdentity,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
