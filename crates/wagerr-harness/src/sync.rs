//! Cross-node convergence checks: chain tips, mempools, and the
//! propagation waits built on top of them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use wagerr_rpc::RpcError;

use crate::error::HarnessError;
use crate::node::NodeHandle;
use crate::poll::{NudgeFuture, Probe, Timeouts, poll_until, poll_until_nudged};

/// Default budget for block/mempool propagation.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

fn transient(e: RpcError, node: usize) -> Result<Probe, HarnessError> {
    // A node mid-restart answers with transport errors; that is "not yet",
    // not a failure.
    Ok(Probe::Pending(format!("node {node}: {e}")))
}

/// Poll until every node reports the same best-block hash. On timeout the
/// divergent tips are re-collected into [`HarnessError::ChainDivergence`].
pub async fn sync_blocks(
    timeouts: &Timeouts,
    nodes: &[Arc<NodeHandle>],
    timeout: Duration,
) -> Result<(), HarnessError> {
    if nodes.len() < 2 {
        return Ok(());
    }
    let budget = timeouts.budget(timeout, Duration::from_millis(200));
    let set = nodes.to_vec();
    let result = poll_until("chain tips equal", budget, move || {
        let set = set.clone();
        Box::pin(async move {
            let mut tips = Vec::with_capacity(set.len());
            for node in &set {
                match node.rpc().get_best_block_hash().await {
                    Ok(hash) => tips.push(hash),
                    Err(e) => return transient(e, node.index),
                }
            }
            if tips.windows(2).all(|w| w[0] == w[1]) {
                Ok(Probe::Converged)
            } else {
                Ok(Probe::Pending(format!("tips {tips:?}")))
            }
        })
    })
    .await;

    match result {
        Err(HarnessError::ConvergenceTimeout { .. }) => {
            let mut tips = Vec::with_capacity(nodes.len());
            for node in nodes {
                let tip = node
                    .rpc()
                    .get_best_block_hash()
                    .await
                    .unwrap_or_else(|e| format!("<{e}>"));
                tips.push((node.index, tip));
            }
            Err(HarnessError::ChainDivergence { tips })
        }
        other => other,
    }
}

/// Poll until every node's mempool holds the same txid set (order
/// independent).
pub async fn sync_mempools(
    timeouts: &Timeouts,
    nodes: &[Arc<NodeHandle>],
    timeout: Duration,
) -> Result<(), HarnessError> {
    sync_mempools_nudged(timeouts, nodes, timeout, || Box::pin(async { Ok(()) })).await
}

/// [`sync_mempools`] with a nudge per failed attempt. Under mocktime the
/// daemons' trickle relay timers stall, so the usual nudge bumps the clock.
pub async fn sync_mempools_nudged<'a>(
    timeouts: &Timeouts,
    nodes: &[Arc<NodeHandle>],
    timeout: Duration,
    nudge: impl FnMut() -> NudgeFuture<'a>,
) -> Result<(), HarnessError> {
    if nodes.len() < 2 {
        return Ok(());
    }
    let budget = timeouts.budget(timeout, Duration::from_millis(100));
    let set = nodes.to_vec();
    poll_until_nudged(
        "mempools equal",
        budget,
        move || {
            let set = set.clone();
            Box::pin(async move {
                let mut pools: Vec<BTreeSet<String>> = Vec::with_capacity(set.len());
                for node in &set {
                    match node.rpc().get_raw_mempool().await {
                        Ok(txids) => pools.push(txids.into_iter().collect()),
                        Err(e) => return transient(e, node.index),
                    }
                }
                if pools.windows(2).all(|w| w[0] == w[1]) {
                    Ok(Probe::Converged)
                } else {
                    let sizes: Vec<usize> = pools.iter().map(BTreeSet::len).collect();
                    Ok(Probe::Pending(format!("mempool sizes {sizes:?}")))
                }
            })
        },
        nudge,
    )
    .await
}

/// Wait until `node` knows `txid`.
pub async fn wait_for_tx(
    timeouts: &Timeouts,
    node: &Arc<NodeHandle>,
    txid: &str,
    timeout: Duration,
) -> Result<(), HarnessError> {
    let budget = timeouts.budget(timeout, Duration::from_millis(500));
    let node = Arc::clone(node);
    let txid = txid.to_string();
    poll_until("transaction known", budget, move || {
        let node = Arc::clone(&node);
        let txid = txid.clone();
        Box::pin(async move {
            match node.rpc().get_raw_transaction(&txid).await {
                Ok(_) => Ok(Probe::Converged),
                Err(e) => transient(e, node.index),
            }
        })
    })
    .await
}

/// Wait until `node` reports an InstantSend lock for `txid`.
pub async fn wait_for_instantlock(
    timeouts: &Timeouts,
    node: &Arc<NodeHandle>,
    txid: &str,
    timeout: Duration,
) -> Result<(), HarnessError> {
    let budget = timeouts.budget(timeout, Duration::from_millis(500));
    let node = Arc::clone(node);
    let txid = txid.to_string();
    poll_until("instantsend lock", budget, move || {
        let node = Arc::clone(&node);
        let txid = txid.clone();
        Box::pin(async move {
            match node.rpc().get_raw_transaction_verbose(&txid).await {
                Ok(tx) if tx.instantlock => Ok(Probe::Converged),
                Ok(_) => Ok(Probe::Pending("transaction known but not locked".into())),
                Err(e) => transient(e, node.index),
            }
        })
    })
    .await
}

/// Wait until `node` sees `block_hash` confirmed and chain-locked.
pub async fn wait_for_chainlocked_block(
    timeouts: &Timeouts,
    node: &Arc<NodeHandle>,
    block_hash: &str,
    timeout: Duration,
) -> Result<(), HarnessError> {
    let budget = timeouts.budget(timeout, Duration::from_millis(100));
    let node = Arc::clone(node);
    let block_hash = block_hash.to_string();
    poll_until("chainlocked block", budget, move || {
        let node = Arc::clone(&node);
        let block_hash = block_hash.clone();
        Box::pin(async move {
            match node.rpc().get_block(&block_hash).await {
                Ok(block) if block.confirmations > 0 && block.chainlock => Ok(Probe::Converged),
                Ok(block) => Ok(Probe::Pending(format!(
                    "confirmations={} chainlock={}",
                    block.confirmations, block.chainlock
                ))),
                Err(e) => transient(e, node.index),
            }
        })
    })
    .await
}

/// Wait until `node`'s best chain lock covers `block_hash`.
pub async fn wait_for_best_chainlock(
    timeouts: &Timeouts,
    node: &Arc<NodeHandle>,
    block_hash: &str,
    timeout: Duration,
) -> Result<(), HarnessError> {
    let budget = timeouts.budget(timeout, Duration::from_millis(100));
    let node = Arc::clone(node);
    let block_hash = block_hash.to_string();
    poll_until("best chainlock", budget, move || {
        let node = Arc::clone(&node);
        let block_hash = block_hash.clone();
        Box::pin(async move {
            match node.rpc().get_best_chain_lock().await {
                Ok(lock) if lock.blockhash == block_hash => Ok(Probe::Converged),
                Ok(lock) => Ok(Probe::Pending(format!(
                    "best chainlock at height {}",
                    lock.height
                ))),
                Err(e) => transient(e, node.index),
            }
        })
    })
    .await
}

pub async fn wait_for_chainlocked_block_all_nodes(
    timeouts: &Timeouts,
    nodes: &[Arc<NodeHandle>],
    block_hash: &str,
    timeout: Duration,
) -> Result<(), HarnessError> {
    for node in nodes {
        wait_for_chainlocked_block(timeouts, node, block_hash, timeout).await?;
    }
    Ok(())
}

/// Wait until every node reports the same spork table as the first one.
pub async fn wait_for_sporks_same(
    timeouts: &Timeouts,
    nodes: &[Arc<NodeHandle>],
    timeout: Duration,
) -> Result<(), HarnessError> {
    if nodes.len() < 2 {
        return Ok(());
    }
    let budget = timeouts.budget(timeout, Duration::from_millis(500));
    let set = nodes.to_vec();
    poll_until("sporks equal", budget, move || {
        let set = set.clone();
        Box::pin(async move {
            let reference = match set[0].rpc().spork_show().await {
                Ok(map) => map,
                Err(e) => return transient(e, set[0].index),
            };
            for node in &set[1..] {
                match node.rpc().spork_show().await {
                    Ok(map) if map == reference => {}
                    Ok(_) => {
                        return Ok(Probe::Pending(format!("node {} differs", node.index)));
                    }
                    Err(e) => return transient(e, node.index),
                }
            }
            Ok(Probe::Converged)
        })
    })
    .await
}

/// Wait until `node` has at least `count` peers that completed the
/// masternode auth handshake.
pub async fn wait_for_mnauth(
    timeouts: &Timeouts,
    node: &Arc<NodeHandle>,
    count: usize,
    timeout: Duration,
) -> Result<(), HarnessError> {
    let budget = timeouts.budget(timeout, Duration::from_millis(500));
    let node = Arc::clone(node);
    poll_until("mnauth peers", budget, move || {
        let node = Arc::clone(&node);
        Box::pin(async move {
            let peers = node.rpc().get_peer_info().await?;
            let verified = peers
                .iter()
                .filter(|p| p.verified_proregtx_hash.as_deref().is_some_and(|h| !h.is_empty()))
                .count();
            if verified >= count {
                Ok(Probe::Converged)
            } else {
                Ok(Probe::Pending(format!("{verified}/{count} verified peers")))
            }
        })
    })
    .await
}

/// Fast-forward the masternode sync state machine by driving `mnsync next`
/// until the daemon reports itself synced.
pub async fn force_finish_mnsync(
    timeouts: &Timeouts,
    node: &Arc<NodeHandle>,
) -> Result<(), HarnessError> {
    let budget = timeouts.budget(Duration::from_secs(30), Duration::from_millis(100));
    let probe_node = Arc::clone(node);
    let nudge_node = Arc::clone(node);
    poll_until_nudged(
        "masternode sync finished",
        budget,
        move || {
            let node = Arc::clone(&probe_node);
            Box::pin(async move {
                match node.rpc().mnsync_status().await {
                    Ok(status) if status.is_synced => Ok(Probe::Converged),
                    Ok(status) => Ok(Probe::Pending(format!(
                        "sync asset {}",
                        status.asset_name.unwrap_or_default()
                    ))),
                    Err(e) => transient(e, node.index),
                }
            })
        },
        move || {
            let node = Arc::clone(&nudge_node);
            Box::pin(async move {
                // Skipping stages is best-effort; the probe decides.
                let _ = node.rpc().mnsync_next().await;
                Ok(())
            })
        },
    )
    .await
}
