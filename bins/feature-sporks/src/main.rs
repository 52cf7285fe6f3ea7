//! Spork propagation and persistence.
//!
//! Three nodes on wall-clock time, with only the first two connected at
//! startup. Flipping the InstantSend spork on the key-holding node must
//! propagate to its peer, survive a restart of both, and reach the
//! late-joining third node once a mined block kicks off masternode sync.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use wagerr_harness::masternode::{SPORK_DISABLE_SENTINEL, SPORK_INSTANTSEND, SPORK_KEY};
use wagerr_harness::{HarnessError, Probe, TestCase, TestContext, TestParams, check, poll_until, run_test};

struct SporkTest;

async fn spork_active(ctx: &TestContext, node: usize) -> Result<bool, HarnessError> {
    let table = ctx.node(node).rpc().spork_active().await?;
    table.get(SPORK_INSTANTSEND).copied().ok_or_else(|| {
        HarnessError::Check(format!("{SPORK_INSTANTSEND} missing from the spork table"))
    })
}

async fn set_spork(ctx: &TestContext, node: usize, active: bool) -> Result<(), HarnessError> {
    let value = if active { 0 } else { SPORK_DISABLE_SENTINEL };
    ctx.node(node)
        .rpc()
        .spork_update(SPORK_INSTANTSEND, value)
        .await?;
    Ok(())
}

async fn wait_for_spork(ctx: &TestContext, node: usize, want: bool) -> Result<(), HarnessError> {
    let handle = ctx.node(node);
    let budget = ctx
        .timeouts
        .budget(Duration::from_secs(60), Duration::from_millis(200));
    poll_until("spork propagation", budget, move || {
        let handle = handle.clone();
        Box::pin(async move {
            match handle.rpc().spork_active().await {
                Ok(table) if table.get(SPORK_INSTANTSEND) == Some(&want) => Ok(Probe::Converged),
                Ok(table) => Ok(Probe::Pending(format!(
                    "spork is {:?}",
                    table.get(SPORK_INSTANTSEND)
                ))),
                Err(e) => Ok(Probe::Pending(e.to_string())),
            }
        })
    })
    .await
}

#[async_trait]
impl TestCase for SporkTest {
    fn params(&self) -> TestParams {
        TestParams {
            num_nodes: 3,
            setup_clean_chain: true,
            extra_args: vec![vec![format!("-sporkkey={SPORK_KEY}")]],
            ..TestParams::default()
        }
    }

    async fn setup_network(&self, ctx: &mut TestContext) -> Result<(), HarnessError> {
        // Wall clock: spork timestamps should behave as they do in production.
        ctx.disable_mocktime();
        ctx.add_nodes(ctx.params.num_nodes)?;
        ctx.start_all_nodes().await?;
        // Only the first two nodes start out connected.
        ctx.connect(0, 1).await?;
        Ok(())
    }

    async fn run(&self, ctx: &mut TestContext) -> Result<(), HarnessError> {
        let default_state = spork_active(ctx, 0).await?;
        check(
            spork_active(ctx, 1).await? == default_state,
            "node 1 disagrees on the default spork state",
        )?;
        check(
            spork_active(ctx, 2).await? == default_state,
            "node 2 disagrees on the default spork state",
        )?;

        info!("flipping the spork and waiting for the connected peer");
        let new_state = !default_state;
        set_spork(ctx, 0, new_state).await?;
        wait_for_spork(ctx, 1, new_state).await?;

        info!("restarting both nodes to check persistence");
        ctx.stop_node(0).await?;
        ctx.stop_node(1).await?;
        ctx.start_node(0, &[]).await?;
        ctx.start_node(1, &[]).await?;
        check(
            spork_active(ctx, 0).await? == new_state,
            "spork value did not persist on node 0",
        )?;
        check(
            spork_active(ctx, 1).await? == new_state,
            "spork value did not persist on node 1",
        )?;

        // A mined block kicks off masternode sync, which also starts spork
        // relay towards the freshly connected node.
        ctx.generate(1, 1).await?;
        info!("connecting the late joiner");
        ctx.connect(1, 2).await?;
        wait_for_spork(ctx, 2, new_state).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run_test(SporkTest).await);
}
