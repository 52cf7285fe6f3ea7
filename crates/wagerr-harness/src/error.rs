//! Failure taxonomy for the harness.
//!
//! Fatal-versus-transient is decided here once: process and protocol faults
//! are never retried, convergence timeouts carry the last observed state,
//! and an ungraceful shutdown is only an error when a caller explicitly
//! asks for a graceful one.

use std::time::Duration;

use thiserror::Error;
use wagerr_p2p::P2pError;
use wagerr_rpc::RpcError;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("node {index}: failed to launch {binary}: {reason}")]
    ProcessStart {
        index: usize,
        binary: String,
        reason: String,
    },
    #[error("node {index}: rpc not ready within {timeout:?}")]
    RpcTimeout { index: usize, timeout: Duration },
    #[error("'{what}' did not converge within {timeout:?} (last: {last})")]
    ConvergenceTimeout {
        what: String,
        timeout: Duration,
        last: String,
    },
    #[error("chain tips diverged: {tips:?}")]
    ChainDivergence { tips: Vec<(usize, String)> },
    #[error("protocol fault during {context}: {detail}")]
    ProtocolFault { context: String, detail: String },
    #[error("node {index}: mocktime would move backwards: {current} -> {requested}")]
    ClockRegression {
        index: usize,
        current: i64,
        requested: i64,
    },
    #[error("node {index}: did not stop within {timeout:?} and was killed")]
    UngracefulShutdown { index: usize, timeout: Duration },
    #[error("setup: {0}")]
    Setup(String),
    #[error("check failed: {0}")]
    Check(String),
    #[error("skipped: {0}")]
    Skipped(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    P2p(#[from] P2pError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Scenario assertion: fail the test with [`HarnessError::Check`] when
/// `condition` is false.
pub fn check(condition: bool, message: impl Into<String>) -> Result<(), HarnessError> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Check(message.into()))
    }
}
