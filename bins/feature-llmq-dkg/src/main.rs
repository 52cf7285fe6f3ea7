//! LLMQ distributed key generation end to end.
//!
//! Brings up a controller, one relay node, and three masternodes, then:
//! runs a full DKG ceremony and checks the resulting quorum's membership
//! and anchor hash; repeats the ceremony on a fresh anchor and checks the
//! quorums differ; verifies key-share distribution; builds an InstantSend
//! lock through the quorum and injects it over raw P2P; and finally spends
//! a masternode's collateral and checks it never reappears.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use wagerr_harness::quorum::{LLMQ_NAME, LLMQ_TYPE_TEST};
use wagerr_harness::{
    CeremonyExpectations, HarnessError, TestCase, TestContext, TestParams, check, run_test,
};
use wagerr_p2p::{Message, PeerConnection};

struct LlmqDkgTest;

#[async_trait]
impl TestCase for LlmqDkgTest {
    fn params(&self) -> TestParams {
        TestParams {
            num_nodes: 5,
            mn_count: 3,
            fast_dip3_enforcement: true,
            ..TestParams::default()
        }
    }

    async fn run(&self, ctx: &mut TestContext) -> Result<(), HarnessError> {
        let node0 = ctx.node(0);
        let llmq_size = ctx.params.llmq_size;

        info!("mining the first quorum");
        let q1 = ctx.mine_quorum(CeremonyExpectations::default()).await?;
        let info = node0.rpc().quorum_info(LLMQ_TYPE_TEST, &q1, false).await?;
        check(info.quorum_hash == q1, "quorum hash must equal the anchor block hash")?;
        check(
            info.members.len() == llmq_size,
            format!("expected {llmq_size} members, got {}", info.members.len()),
        )?;
        check(info.mined_block.is_some(), "commitment block missing from quorum info")?;

        let members = ctx.get_quorum_masternodes(&q1).await?;
        check(
            members.len() == llmq_size,
            "every member must resolve to a registered masternode",
        )?;

        info!("waiting for key-share distribution");
        ctx.wait_for_quorum_data(&members, &q1, true, true, false).await?;
        check(
            ctx.quorum_data_ok(&members[0], &q1, true, true).await,
            "member 0 lost its key shares after the distribution wait",
        )?;

        info!("mining a second quorum on a fresh anchor");
        let q2 = ctx.mine_quorum(CeremonyExpectations::default()).await?;
        check(
            q2 != q1,
            "ceremonies on disjoint anchors must produce distinct quorum hashes",
        )?;
        let listed = node0.rpc().quorum_list_recent(2).await?;
        let recent = listed.get(LLMQ_NAME).cloned().unwrap_or_default();
        check(recent.contains(&q1), "first quorum missing from the list")?;
        check(recent.contains(&q2), "newest quorum missing from the list")?;

        // Quorum peers authenticate each other with their proTxHashes.
        ctx.wait_for_mnauth(ctx.masternodes[0].node_index, 1).await?;

        info!("waiting for a chainlock on a fresh block");
        ctx.bump_mocktime(1, None).await?;
        let locked_hash = ctx
            .generate(0, 1)
            .await?
            .pop()
            .ok_or_else(|| HarnessError::Check("generate returned no block".into()))?;
        ctx.sync_blocks_all().await?;
        ctx.wait_for_chainlocked_block_all_nodes(&locked_hash).await?;
        ctx.wait_for_best_chainlock(0, &locked_hash).await?;

        info!("building and injecting an InstantSend lock");
        let destination = node0.rpc().get_new_address().await?;
        let mut outputs = BTreeMap::new();
        outputs.insert(destination, 1.0);
        let raw = node0.rpc().create_raw_transaction(&[], &outputs).await?;
        let funded = node0.rpc().fund_raw_transaction(&raw).await?;
        let signed = node0.rpc().sign_raw_transaction_with_wallet(&funded.hex).await?;
        check(signed.complete, "wallet could not fully sign the test transaction")?;

        let islock = ctx.create_islock(&signed.hex).await?;
        let txid = node0.rpc().send_raw_transaction(&signed.hex).await?;
        check(
            node0.rpc().get_mempool_info().await?.size >= 1,
            "sent transaction missing from the mempool",
        )?;
        ctx.wait_for_tx(1, &txid).await?;

        let relay = ctx.node(1);
        let timeout = ctx.timeouts.scaled(Duration::from_secs(30));
        let mut peer = PeerConnection::connect(&relay.p2p_addr(), timeout).await?;
        peer.send(&Message::IsLock(islock)).await?;
        ctx.wait_for_instantlock(1, &txid).await?;

        info!("spending a collateral to unregister a masternode");
        let removed = ctx.masternodes[1].identity.pro_tx_hash.clone();
        ctx.remove_masternode(1).await?;
        let list = node0.rpc().masternode_list_status().await?;
        check(
            !list.contains_key(&removed),
            "a removed proTxHash must never reappear in the registry",
        )?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run_test(LlmqDkgTest).await);
}
