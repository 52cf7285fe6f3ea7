//! Typed JSON-RPC client for the Wagerr daemon.
//!
//! Wraps the daemon's JSON-RPC 2.0 interface in named methods returning
//! typed result records. Responses are validated at this boundary; callers
//! never see loose JSON maps except for genuinely map-shaped responses
//! (spork tables, quorum lists keyed by LLMQ name).

pub mod client;
pub mod error;
pub mod types;

pub use client::RpcClient;
pub use error::RpcError;
