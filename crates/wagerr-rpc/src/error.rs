//! Error types for the RPC client.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("malformed response for {method}: {detail}")]
    Decode { method: String, detail: String },
}

impl RpcError {
    /// True when the server rejected the call (as opposed to the call never
    /// reaching a live server). Pollers treat transport errors during node
    /// startup as "not ready yet" rather than failures.
    pub fn is_server_error(&self) -> bool {
        matches!(self, RpcError::Server { .. })
    }
}
