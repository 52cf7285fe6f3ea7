//! Peer-connection graph management.
//!
//! All edges are driven through the daemons' own `addnode`/`disconnectnode`
//! RPCs and verified against `getpeerinfo`, so connect and disconnect are
//! idempotent: reconnecting an existing edge or tearing down a missing one
//! is a no-op.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::HarnessError;
use crate::node::NodeHandle;
use crate::poll::{Probe, Timeouts, poll_until};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Establish an outbound connection `from -> to` and wait for the peer
/// entry to complete its version handshake.
pub async fn connect_nodes(
    timeouts: &Timeouts,
    from: &Arc<NodeHandle>,
    to: &Arc<NodeHandle>,
) -> Result<(), HarnessError> {
    let target = to.p2p_addr();
    let peers = from.rpc().get_peer_info().await?;
    if peers.iter().any(|p| p.addr == target) {
        debug!(from = from.index, to = to.index, "already connected");
        return Ok(());
    }
    from.rpc().add_node_onetry(&target).await?;

    let budget = timeouts.budget(CONNECT_TIMEOUT, Duration::from_millis(100));
    let from = Arc::clone(from);
    let what = format!("connection {} -> {}", from.index, to.index);
    poll_until(&what, budget, move || {
        let from = Arc::clone(&from);
        let target = target.clone();
        Box::pin(async move {
            let peers = from.rpc().get_peer_info().await?;
            let ready = peers
                .iter()
                .any(|p| p.addr == target && p.subver.as_deref().is_some_and(|s| !s.is_empty()));
            if ready {
                Ok(Probe::Converged)
            } else {
                Ok(Probe::Pending(format!("{} peers, none verack'd", peers.len())))
            }
        })
    })
    .await
}

/// Connect both directions.
pub async fn connect_nodes_bi(
    timeouts: &Timeouts,
    a: &Arc<NodeHandle>,
    b: &Arc<NodeHandle>,
) -> Result<(), HarnessError> {
    connect_nodes(timeouts, a, b).await?;
    connect_nodes(timeouts, b, a).await
}

/// Tear down `from`'s outbound connection to `to`, waiting for the peer
/// entry to disappear. Safe when not connected.
pub async fn disconnect_nodes(
    timeouts: &Timeouts,
    from: &Arc<NodeHandle>,
    to: &Arc<NodeHandle>,
) -> Result<(), HarnessError> {
    let target = to.p2p_addr();
    let peers = from.rpc().get_peer_info().await?;
    let matching: Vec<_> = peers.into_iter().filter(|p| p.addr == target).collect();
    if matching.is_empty() {
        debug!(from = from.index, to = to.index, "not connected");
        return Ok(());
    }
    for peer in &matching {
        match from.rpc().disconnect_node(&peer.addr).await {
            Ok(()) => {}
            // The peer may drop on its own between listing and the call.
            Err(e) if e.is_server_error() => debug!(addr = %peer.addr, error = %e, "disconnect raced"),
            Err(e) => return Err(e.into()),
        }
    }

    let budget = timeouts.budget(CONNECT_TIMEOUT, Duration::from_millis(100));
    let from = Arc::clone(from);
    let what = format!("disconnection {} -> {}", from.index, to.index);
    poll_until(&what, budget, move || {
        let from = Arc::clone(&from);
        let target = target.clone();
        Box::pin(async move {
            let peers = from.rpc().get_peer_info().await?;
            if peers.iter().any(|p| p.addr == target) {
                Ok(Probe::Pending("peer entry still present".into()))
            } else {
                Ok(Probe::Converged)
            }
        })
    })
    .await
}

/// Remove every cross-group edge, in both directions, leaving each group
/// internally connected.
pub async fn split_groups(
    timeouts: &Timeouts,
    left: &[Arc<NodeHandle>],
    right: &[Arc<NodeHandle>],
) -> Result<(), HarnessError> {
    for a in left {
        for b in right {
            disconnect_nodes(timeouts, a, b).await?;
            disconnect_nodes(timeouts, b, a).await?;
        }
    }
    Ok(())
}
