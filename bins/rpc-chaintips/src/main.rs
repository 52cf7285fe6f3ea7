//! `getchaintips` across a network split and rejoin.
//!
//! Four nodes split into halves that extend competing chains of different
//! lengths. Each half must report its own active tip; after the rejoin all
//! nodes converge on the longer chain, and the shorter one reappears as a
//! valid fork whose branch length equals the height it diverged by.

use async_trait::async_trait;
use tracing::info;
use wagerr_harness::{HarnessError, TestCase, TestContext, TestParams, check, run_test};

const SHORT_BRANCH: u64 = 10;
const LONG_BRANCH: u64 = 20;

struct ChainTipsTest;

#[async_trait]
impl TestCase for ChainTipsTest {
    fn params(&self) -> TestParams {
        TestParams {
            num_nodes: 4,
            extra_args: vec![vec!["-debug".into()]; 4],
            ..TestParams::default()
        }
    }

    async fn run(&self, ctx: &mut TestContext) -> Result<(), HarnessError> {
        let tips = ctx.node(0).rpc().get_chain_tips().await?;
        check(tips.len() == 1, "expected exactly one tip before the split")?;
        check(tips[0].branchlen == 0, "the single tip must have no branch")?;
        check(tips[0].status == "active", "the single tip must be active")?;
        let base_height = tips[0].height;

        info!("splitting the network and extending competing chains");
        ctx.split_network(&[0, 1], &[2, 3]).await?;
        ctx.generate(0, SHORT_BRANCH as u32).await?;
        ctx.sync_blocks_of(&ctx.nodes_subset(&[0, 1])).await?;
        ctx.generate(2, LONG_BRANCH as u32).await?;
        ctx.sync_blocks_of(&ctx.nodes_subset(&[2, 3])).await?;

        let short_tips = ctx.node(1).rpc().get_chain_tips().await?;
        let short_active = short_tips
            .iter()
            .find(|t| t.status == "active")
            .ok_or_else(|| HarnessError::Check("node 1 has no active tip".into()))?;
        check(
            short_active.height == base_height + SHORT_BRANCH,
            "short half is at the wrong height",
        )?;

        let long_tips = ctx.node(3).rpc().get_chain_tips().await?;
        let long_active = long_tips
            .iter()
            .find(|t| t.status == "active")
            .ok_or_else(|| HarnessError::Check("node 3 has no active tip".into()))?;
        check(
            long_active.height == base_height + LONG_BRANCH,
            "long half is at the wrong height",
        )?;
        let long_hash = long_active.hash.clone();

        info!("rejoining the halves");
        ctx.join_network(1, 2).await?;

        // Everyone converges on the chain with more work.
        for index in 0..4 {
            let best = ctx.node(index).rpc().get_best_block_hash().await?;
            check(
                best == long_hash,
                format!("node {index} did not reorg to the longer chain"),
            )?;
        }

        // The short chain survives as a fork entry on the nodes that
        // validated it.
        let tips = ctx.node(1).rpc().get_chain_tips().await?;
        check(
            tips.iter()
                .any(|t| t.status == "active" && t.height == base_height + LONG_BRANCH),
            "node 1 active tip is not the long chain",
        )?;
        let fork = tips
            .iter()
            .find(|t| t.status == "valid-fork")
            .ok_or_else(|| HarnessError::Check("short chain not reported as a valid fork".into()))?;
        check(
            fork.height == base_height + SHORT_BRANCH,
            "fork tip has the wrong height",
        )?;
        check(
            fork.branchlen == SHORT_BRANCH,
            "fork branch length must equal the divergence height",
        )?;

        // The reorg must leave every node with the same UTXO-set summary.
        let reference = ctx.node(0).rpc().get_tx_out_set_info().await?;
        check(
            reference.height == base_height + LONG_BRANCH,
            "UTXO set summary lags behind the active tip",
        )?;
        for index in 1..4 {
            let summary = ctx.node(index).rpc().get_tx_out_set_info().await?;
            check(
                summary.bestblock == reference.bestblock
                    && summary.txouts == reference.txouts
                    && summary.total_amount == reference.total_amount,
                format!("node {index} UTXO set summary diverges after the reorg"),
            )?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run_test(ChainTipsTest).await);
}
