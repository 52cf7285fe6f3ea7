//! BIP157/158 compact-filter serving over raw P2P.
//!
//! Node 0 indexes and serves filters (`-blockfilterindex -peerblockfilters`);
//! node 1 only indexes. Checks service-bit signalling, checkpoint and
//! header retrieval on both the active and a staled chain, the fold of
//! filter hashes into the checkpoint header, filter contents, and that
//! non-serving peers and malformed requests cause disconnection.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use wagerr_harness::{HarnessError, TestCase, TestContext, TestParams, check, run_test};
use wagerr_p2p::{
    FILTER_TYPE_BASIC, Hash256, Message, NODE_COMPACT_FILTERS, PeerConnection,
    fold_filter_headers, sha256d,
};

const P2P_TIMEOUT: Duration = Duration::from_secs(30);

struct CompactFiltersTest;

fn parse_services(hex_str: &str) -> Result<u64, HarnessError> {
    u64::from_str_radix(hex_str, 16)
        .map_err(|_| HarnessError::Check(format!("unparsable localservices: {hex_str}")))
}

#[async_trait]
impl TestCase for CompactFiltersTest {
    fn params(&self) -> TestParams {
        TestParams {
            num_nodes: 2,
            extra_args: vec![
                vec!["-blockfilterindex".into(), "-peerblockfilters".into()],
                vec!["-blockfilterindex".into()],
            ],
            ..TestParams::default()
        }
    }

    async fn run(&self, ctx: &mut TestContext) -> Result<(), HarnessError> {
        let node0 = ctx.node(0);
        let node1 = ctx.node(1);
        let timeout = ctx.timeouts.scaled(P2P_TIMEOUT);

        ctx.generate(0, 200).await?;
        ctx.sync_blocks_all().await?;

        info!("staling one block on node 0");
        ctx.disconnect(0, 1).await?;
        ctx.disconnect(1, 0).await?;
        let stale_hash = ctx
            .generate(0, 1)
            .await?
            .pop()
            .ok_or_else(|| HarnessError::Check("generate returned no block".into()))?;
        ctx.generate(1, 2).await?;
        ctx.join_network(0, 1).await?;

        let chain_info = node0.rpc().get_blockchain_info().await?;
        let tip_hash = chain_info.bestblockhash;
        let tip_height = chain_info.blocks;
        check(tip_hash != stale_hash, "node 0 did not reorg away from the stale block")?;

        info!("checking NODE_COMPACT_FILTERS signalling");
        let mut peer0 = PeerConnection::connect(&node0.p2p_addr(), timeout).await?;
        check(
            peer0.remote_services() & NODE_COMPACT_FILTERS != 0,
            "node 0 must signal NODE_COMPACT_FILTERS",
        )?;
        let mut peer1 = PeerConnection::connect(&node1.p2p_addr(), timeout).await?;
        check(
            peer1.remote_services() & NODE_COMPACT_FILTERS == 0,
            "node 1 must not signal NODE_COMPACT_FILTERS",
        )?;

        let local0 = parse_services(&node0.rpc().get_network_info().await?.localservices)?;
        check(local0 & NODE_COMPACT_FILTERS != 0, "node 0 localservices disagrees")?;
        let local1 = parse_services(&node1.rpc().get_network_info().await?.localservices)?;
        check(local1 & NODE_COMPACT_FILTERS == 0, "node 1 localservices disagrees")?;

        info!("fetching cfcheckpt on the active chain");
        let stop = Hash256::from_rpc_hex(&tip_hash)?;
        peer0
            .send(&Message::GetCFCheckpt {
                filter_type: FILTER_TYPE_BASIC,
                stop_hash: stop,
            })
            .await?;
        let msg = peer0
            .wait_for("cfcheckpt", timeout, |m| matches!(m, Message::CFCheckpt(_)))
            .await?;
        if let Message::CFCheckpt(checkpt) = msg {
            check(checkpt.filter_type == FILTER_TYPE_BASIC, "wrong filter type")?;
            check(checkpt.stop_hash == stop, "cfcheckpt stop hash mismatch")?;
        }

        info!("folding cfheaders into the checkpoint header");
        let tip_filter = node0.rpc().get_block_filter(&tip_hash, "basic").await?;
        peer0
            .send(&Message::GetCFHeaders {
                filter_type: FILTER_TYPE_BASIC,
                start_height: 1,
                stop_hash: stop,
            })
            .await?;
        let msg = peer0
            .wait_for("cfheaders", timeout, |m| matches!(m, Message::CFHeaders(_)))
            .await?;
        let Message::CFHeaders(headers) = msg else {
            return Err(HarnessError::Check("expected a cfheaders response".into()));
        };
        check(
            headers.hashes.len() as u64 == tip_height,
            "expected one filter hash per block from height 1 to the tip",
        )?;
        let folded = fold_filter_headers(headers.prev_header, &headers.hashes);
        check(
            folded == Hash256::from_rpc_hex(&tip_filter.header)?,
            "chained filter hashes must equal the checkpoint header",
        )?;

        info!("checking cfilter contents for the first ten blocks");
        let stop10 = node0.rpc().get_block_hash(10).await?;
        peer0
            .send(&Message::GetCFilters {
                filter_type: FILTER_TYPE_BASIC,
                start_height: 1,
                stop_hash: Hash256::from_rpc_hex(&stop10)?,
            })
            .await?;
        let filters = peer0.collect_cfilters(10, timeout).await?;
        for (i, filter) in filters.iter().enumerate() {
            let block_hash = node0.rpc().get_block_hash(i as u64 + 1).await?;
            check(filter.filter_type == FILTER_TYPE_BASIC, "wrong filter type")?;
            check(
                filter.block_hash == Hash256::from_rpc_hex(&block_hash)?,
                format!("cfilter {i} is for the wrong block"),
            )?;
            let computed = Hash256(sha256d(&filter.filter));
            check(
                computed == headers.hashes[i],
                format!("cfilter {i} hash disagrees with cfheaders"),
            )?;
        }

        info!("checking filters on the stale chain");
        let stale_stop = Hash256::from_rpc_hex(&stale_hash)?;
        let stale_height = node0.rpc().get_block_header(&stale_hash).await?.height;
        let stale_filter = node0.rpc().get_block_filter(&stale_hash, "basic").await?;
        peer0
            .send(&Message::GetCFCheckpt {
                filter_type: FILTER_TYPE_BASIC,
                stop_hash: stale_stop,
            })
            .await?;
        let msg = peer0
            .wait_for("stale cfcheckpt", timeout, |m| matches!(m, Message::CFCheckpt(_)))
            .await?;
        if let Message::CFCheckpt(checkpt) = msg {
            check(checkpt.stop_hash == stale_stop, "stale cfcheckpt stop hash mismatch")?;
        }
        peer0
            .send(&Message::GetCFHeaders {
                filter_type: FILTER_TYPE_BASIC,
                start_height: 1,
                stop_hash: stale_stop,
            })
            .await?;
        let msg = peer0
            .wait_for("stale cfheaders", timeout, |m| matches!(m, Message::CFHeaders(_)))
            .await?;
        let Message::CFHeaders(stale_headers) = msg else {
            return Err(HarnessError::Check("expected a cfheaders response".into()));
        };
        check(
            stale_headers.hashes.len() as u64 == stale_height,
            "stale chain must serve one filter hash per block",
        )?;
        let stale_folded = fold_filter_headers(stale_headers.prev_header, &stale_headers.hashes);
        check(
            stale_folded == Hash256::from_rpc_hex(&stale_filter.header)?,
            "stale chain cfheaders must fold to its checkpoint header",
        )?;

        info!("requests without NODE_COMPACT_FILTERS get the peer disconnected");
        peer1
            .send(&Message::GetCFCheckpt {
                filter_type: FILTER_TYPE_BASIC,
                stop_hash: stop,
            })
            .await?;
        peer1.wait_for_disconnect(timeout).await?;

        info!("invalid requests get the peer disconnected");
        let mut bad_type = PeerConnection::connect(&node0.p2p_addr(), timeout).await?;
        bad_type
            .send(&Message::GetCFCheckpt {
                filter_type: 255,
                stop_hash: stop,
            })
            .await?;
        bad_type.wait_for_disconnect(timeout).await?;

        let mut bad_hash = PeerConnection::connect(&node0.p2p_addr(), timeout).await?;
        bad_hash
            .send(&Message::GetCFCheckpt {
                filter_type: FILTER_TYPE_BASIC,
                stop_hash: Hash256([0x42; 32]),
            })
            .await?;
        bad_hash.wait_for_disconnect(timeout).await?;

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run_test(CompactFiltersTest).await);
}
