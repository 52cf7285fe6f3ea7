//! Raw peer-to-peer wire protocol for the Wagerr daemon.
//!
//! The daemon speaks the Bitcoin-derived wire format: a 24-byte envelope
//! (network magic, zero-padded command, payload length, double-SHA256
//! checksum) followed by a little-endian payload. This crate implements the
//! subset of messages the harness injects or observes: the version
//! handshake, the BIP157 compact-filter triad, and InstantSend lock
//! injection. Everything else decodes to [`Message::Unknown`] and is
//! skipped.

pub mod connection;
pub mod error;
pub mod message;

pub use connection::PeerConnection;
pub use error::P2pError;
pub use message::{
    CFCheckptMessage, CFHeadersMessage, CFilterMessage, Hash256, IsLockMessage, Message, OutPoint,
    VersionMessage, fold_filter_headers, islock_request_id, sha256d,
};

/// Network magic for the regtest chain.
pub const REGTEST_MAGIC: [u8; 4] = [0xfc, 0xc1, 0xb7, 0xdc];

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: i32 = 70926;

/// Service bit signalling BIP157 compact-filter serving.
pub const NODE_COMPACT_FILTERS: u64 = 1 << 6;

/// The basic (BIP158) filter type.
pub const FILTER_TYPE_BASIC: u8 = 0;
