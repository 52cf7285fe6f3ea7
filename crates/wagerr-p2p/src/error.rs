//! Error types for the wire protocol.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad network magic: {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("checksum mismatch for '{0}'")]
    BadChecksum(String),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("message too large: {size} bytes")]
    Oversized { size: usize },
    #[error("peer closed connection")]
    Disconnected,
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("handshake: {0}")]
    Handshake(String),
}
