//! The per-run orchestration context.
//!
//! `TestContext` owns everything a scenario touches: options, the timeout
//! multiplier, the simulated clock, node handles, masternode records, and
//! the token session. All state that the original daemon tooling kept in
//! module globals lives here instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::MockClock;
use crate::config::{
    self, CACHE_BLOCK_SPACING, CACHE_CHAIN_HEIGHT, GENESIS_TIME, HarnessOptions, MAX_NODES,
};
use crate::error::HarnessError;
use crate::masternode::{DIP8_ACTIVATION_HEIGHT, Masternode, MasternodeIdentity, SPORK_KEY, TokenSession};
use crate::node::{NodeHandle, STOP_TIMEOUT};
use crate::poll::{NudgeFuture, Timeouts};
use crate::sync::{self, SYNC_TIMEOUT};
use crate::topology;

/// Per-scenario parameters, set once before the run starts.
#[derive(Debug, Clone)]
pub struct TestParams {
    pub num_nodes: usize,
    /// Number of masternodes among `num_nodes`. Nonzero forces a clean
    /// chain and the full masternode bring-up in `setup_network`.
    pub mn_count: usize,
    /// Start from empty datadirs instead of the cached premine.
    pub setup_clean_chain: bool,
    /// Per-node daemon arguments; shorter vectors are padded with empties.
    pub extra_args: Vec<Vec<String>>,
    /// Enforce DIP3 from low heights instead of mining to the mainnet-like
    /// activation height.
    pub fast_dip3_enforcement: bool,
    pub llmq_size: usize,
    pub llmq_threshold: usize,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            mn_count: 0,
            setup_clean_chain: false,
            extra_args: Vec::new(),
            fast_dip3_enforcement: false,
            llmq_size: 3,
            llmq_threshold: 2,
        }
    }
}

pub struct TestContext {
    pub options: HarnessOptions,
    pub params: TestParams,
    pub timeouts: Timeouts,
    pub clock: Arc<MockClock>,
    pub nodes: Vec<Arc<NodeHandle>>,
    /// Registered identities, in index order, before their nodes exist.
    pub masternode_identities: Vec<MasternodeIdentity>,
    /// Identities with their runtime nodes attached.
    pub masternodes: Vec<Masternode>,
    pub tokens: Option<TokenSession>,
    root: PathBuf,
    node_extra_args: Vec<Vec<String>>,
}

impl TestContext {
    pub fn new(options: HarnessOptions, params: TestParams) -> Result<Self, HarnessError> {
        if params.num_nodes == 0 || params.num_nodes > MAX_NODES {
            return Err(HarnessError::Setup(format!(
                "num_nodes must be in 1..={MAX_NODES}, got {}",
                params.num_nodes
            )));
        }
        let mut params = params;
        if params.mn_count > 0 {
            if params.mn_count + 1 > params.num_nodes {
                return Err(HarnessError::Setup(
                    "masternode runs need a controller node besides the masternodes".into(),
                ));
            }
            // Masternode chains are built from scratch every time.
            params.setup_clean_chain = true;
        }

        let root = match &options.tmpdir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => tempfile::Builder::new()
                .prefix("wagerr_func_")
                .tempdir()?
                .into_path(),
        };

        let mut node_extra_args = params.extra_args.clone();
        node_extra_args.resize(params.num_nodes, Vec::new());
        if params.mn_count > 0 {
            node_extra_args[0].push(format!("-sporkkey={SPORK_KEY}"));
            for args in &mut node_extra_args {
                if params.fast_dip3_enforcement {
                    args.push("-dip3params=30:50".into());
                }
                args.push(format!("-dip8params={DIP8_ACTIVATION_HEIGHT}"));
                if (params.llmq_size, params.llmq_threshold) != (3, 2) {
                    args.push(format!(
                        "-llmqtestparams={}:{}",
                        params.llmq_size, params.llmq_threshold
                    ));
                }
            }
        }

        Ok(Self {
            timeouts: Timeouts::new(options.timeout_scale),
            clock: Arc::new(MockClock::new(0)),
            nodes: Vec::new(),
            masternode_identities: Vec::new(),
            masternodes: Vec::new(),
            tokens: None,
            root,
            node_extra_args,
            options,
            params,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node(&self, index: usize) -> Arc<NodeHandle> {
        Arc::clone(&self.nodes[index])
    }

    pub fn nodes_subset(&self, indices: &[usize]) -> Vec<Arc<NodeHandle>> {
        indices.iter().map(|&i| self.node(i)).collect()
    }

    // ── Node lifecycle ────────────────────────────────────────────────────

    /// Instantiate `count` more node handles (datadir + conf + RPC client).
    pub fn add_nodes(&mut self, count: usize) -> Result<(), HarnessError> {
        for _ in 0..count {
            let index = self.nodes.len();
            config::initialize_datadir(&self.root, index, self.options.port_seed)?;
            let node = NodeHandle::new(
                index,
                &self.root,
                self.options.daemon_binary(),
                self.options.port_seed,
                self.options.daemon_args.clone(),
                self.node_extra_args.get(index).cloned().unwrap_or_default(),
                self.clock.current(),
                self.timeouts,
            );
            self.nodes.push(Arc::new(node));
        }
        Ok(())
    }

    pub async fn start_node(&self, index: usize, call_args: &[String]) -> Result<(), HarnessError> {
        let node = self.node(index);
        node.start(call_args)?;
        node.wait_for_rpc_ready().await
    }

    /// Start every node; if one fails, all already-started siblings are
    /// stopped before the error propagates.
    pub async fn start_all_nodes(&self) -> Result<(), HarnessError> {
        for node in &self.nodes {
            let ready = match node.start(&[]) {
                Ok(()) => node.wait_for_rpc_ready().await,
                Err(e) => Err(e),
            };
            if let Err(e) = ready {
                let _ = self.stop_nodes().await;
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn stop_node(&self, index: usize) -> Result<(), HarnessError> {
        self.node(index).stop(STOP_TIMEOUT).await.map(|_| ())
    }

    /// Ask every node to stop, then wait them out one by one.
    pub async fn stop_nodes(&self) -> Result<(), HarnessError> {
        for node in &self.nodes {
            node.begin_stop().await;
        }
        for node in &self.nodes {
            node.finish_stop(STOP_TIMEOUT).await?;
        }
        Ok(())
    }

    pub async fn restart_node(&self, index: usize, call_args: &[String]) -> Result<(), HarnessError> {
        self.node(index).restart(call_args).await
    }

    // ── Chain bootstrap ───────────────────────────────────────────────────

    pub async fn setup_chain(&mut self) -> Result<(), HarnessError> {
        info!("initializing test directory {}", self.root.display());
        if self.params.setup_clean_chain {
            for i in 0..self.params.num_nodes {
                config::initialize_datadir(&self.root, i, self.options.port_seed)?;
            }
            self.clock.reset(GENESIS_TIME);
        } else {
            self.initialize_chain_from_cache().await?;
            // The conventional cache timestamp, one spacing past the premine tip.
            self.clock
                .reset(GENESIS_TIME + (CACHE_CHAIN_HEIGHT as i64 + 1) * CACHE_BLOCK_SPACING);
        }
        Ok(())
    }

    async fn initialize_chain_from_cache(&mut self) -> Result<(), HarnessError> {
        let cachedir = self.options.cachedir.clone();
        let cache_ready = (0..MAX_NODES).all(|i| {
            config::chain_dir(&config::node_datadir(&cachedir, i))
                .join("blocks")
                .is_dir()
        });
        if !cache_ready {
            self.create_cache().await?;
        }
        for i in 0..self.params.num_nodes {
            config::copy_datadir_across(&cachedir, &self.root, i, self.options.port_seed)?;
        }
        Ok(())
    }

    /// Mine the shared premine cache: a 200-block chain with deterministic
    /// timestamps, built once and copied into every later run.
    async fn create_cache(&self) -> Result<(), HarnessError> {
        info!(
            "creating datadir cache ({} blocks) under {}",
            CACHE_CHAIN_HEIGHT,
            self.options.cachedir.display()
        );
        let cachedir = &self.options.cachedir;
        for i in 0..MAX_NODES {
            let dir = config::node_datadir(cachedir, i);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }

        let seed = self.options.port_seed;
        let mut cache_nodes = Vec::with_capacity(MAX_NODES);
        for i in 0..MAX_NODES {
            config::initialize_datadir(cachedir, i, seed)?;
            let extra = if i > 0 {
                vec![format!("-connect=127.0.0.1:{}", config::p2p_port(0, seed))]
            } else {
                Vec::new()
            };
            cache_nodes.push(Arc::new(NodeHandle::new(
                i,
                cachedir,
                self.options.daemon_binary(),
                seed,
                self.options.daemon_args.clone(),
                extra,
                GENESIS_TIME,
                self.timeouts,
            )));
        }

        let result = self.mine_cache_chain(&cache_nodes).await;
        for node in &cache_nodes {
            node.begin_stop().await;
        }
        for node in &cache_nodes {
            let _ = node.finish_stop(STOP_TIMEOUT).await;
        }
        result?;

        for i in 0..MAX_NODES {
            config::prune_cache_datadir(cachedir, i)?;
        }
        Ok(())
    }

    async fn mine_cache_chain(&self, cache_nodes: &[Arc<NodeHandle>]) -> Result<(), HarnessError> {
        for node in cache_nodes {
            node.start(&[])?;
        }
        for node in cache_nodes {
            node.wait_for_rpc_ready().await?;
        }

        // Four nodes take turns mining 25-block batches, twice over, with
        // the clock stepped per block so the chain is byte-for-byte
        // reproducible. Each miner restarts after its block to flush state.
        let mut block_time = GENESIS_TIME;
        for _round in 0..2 {
            for peer in 0..4 {
                for _ in 0..25 {
                    for node in cache_nodes {
                        node.set_mocktime(block_time).await?;
                    }
                    cache_nodes[peer].rpc().generate(1).await?;
                    cache_nodes[peer].stop(STOP_TIMEOUT).await?;
                    cache_nodes[peer].start(&[])?;
                    cache_nodes[peer].wait_for_rpc_ready().await?;
                    block_time += 62;
                }
                sync::sync_blocks(&self.timeouts, cache_nodes, SYNC_TIMEOUT).await?;
            }
        }
        Ok(())
    }

    // ── Network setup ─────────────────────────────────────────────────────

    /// Default bring-up: chain topology for plain runs, the full masternode
    /// network when `mn_count > 0`.
    pub async fn setup_network(&mut self) -> Result<(), HarnessError> {
        if self.params.mn_count > 0 {
            self.setup_masternode_network().await
        } else {
            self.setup_chain_topology().await
        }
    }

    /// Connect the nodes as a chain (0-1-2-…) so a split down the middle
    /// yields two internally connected halves.
    pub async fn setup_chain_topology(&mut self) -> Result<(), HarnessError> {
        self.add_nodes(self.params.num_nodes)?;
        self.start_all_nodes().await?;
        for i in 0..self.nodes.len().saturating_sub(1) {
            self.connect_bi(i, i + 1).await?;
        }
        self.sync_all().await
    }

    /// Add, start, and fully connect one extra non-masternode node.
    pub async fn create_simple_node(&mut self) -> Result<usize, HarnessError> {
        let index = self.nodes.len();
        self.add_nodes(1)?;
        self.start_node(index, &[]).await?;
        for i in 0..index {
            topology::connect_nodes(&self.timeouts, &self.nodes[i], &self.nodes[index]).await?;
        }
        Ok(index)
    }

    // ── Simulated clock ───────────────────────────────────────────────────

    /// Advance the run clock and push the new value to `targets` (default:
    /// every node) in the same call, so no node observes a partial update.
    pub async fn bump_mocktime(
        &self,
        delta: i64,
        targets: Option<&[Arc<NodeHandle>]>,
    ) -> Result<(), HarnessError> {
        let new_time = self.clock.advance(delta);
        let nodes = targets.unwrap_or(&self.nodes);
        for node in nodes {
            node.set_mocktime(new_time).await?;
        }
        Ok(())
    }

    /// Switch the run to wall-clock time. Only meaningful before nodes
    /// start; running daemons keep whatever mocktime they last saw.
    pub fn disable_mocktime(&self) {
        self.clock.disable();
        for node in &self.nodes {
            node.clear_mocktime();
        }
    }

    /// A nudge closure that bumps the clock for `targets` by `delta` per
    /// failed poll attempt.
    pub(crate) fn mocktime_nudge(
        &self,
        delta: i64,
        targets: &[Arc<NodeHandle>],
    ) -> impl FnMut() -> NudgeFuture<'static> + use<> {
        let clock = Arc::clone(&self.clock);
        let targets = targets.to_vec();
        move || -> NudgeFuture<'static> {
            let clock = Arc::clone(&clock);
            let targets = targets.clone();
            Box::pin(async move {
                let new_time = clock.advance(delta);
                for node in &targets {
                    node.set_mocktime(new_time).await?;
                }
                Ok(())
            })
        }
    }

    // ── Mining and synchronization ────────────────────────────────────────

    pub async fn generate(&self, node: usize, blocks: u32) -> Result<Vec<String>, HarnessError> {
        Ok(self.nodes[node].rpc().generate(blocks).await?)
    }

    pub async fn sync_blocks_of(&self, nodes: &[Arc<NodeHandle>]) -> Result<(), HarnessError> {
        sync::sync_blocks(&self.timeouts, nodes, SYNC_TIMEOUT).await
    }

    pub async fn sync_mempools_of(&self, nodes: &[Arc<NodeHandle>]) -> Result<(), HarnessError> {
        if self.clock.is_enabled() {
            // Relay timers stall under mocktime; nudge them along.
            let nudge = self.mocktime_nudge(3, nodes);
            sync::sync_mempools_nudged(&self.timeouts, nodes, SYNC_TIMEOUT, nudge).await
        } else {
            sync::sync_mempools(&self.timeouts, nodes, SYNC_TIMEOUT).await
        }
    }

    pub async fn sync_blocks_all(&self) -> Result<(), HarnessError> {
        self.sync_blocks_of(&self.nodes).await
    }

    pub async fn sync_mempools_all(&self) -> Result<(), HarnessError> {
        self.sync_mempools_of(&self.nodes).await
    }

    pub async fn sync_all(&self) -> Result<(), HarnessError> {
        self.sync_blocks_all().await?;
        self.sync_mempools_all().await
    }

    pub async fn sync_all_of(&self, nodes: &[Arc<NodeHandle>]) -> Result<(), HarnessError> {
        self.sync_blocks_of(nodes).await?;
        self.sync_mempools_of(nodes).await
    }

    // ── Topology ──────────────────────────────────────────────────────────

    pub async fn connect(&self, from: usize, to: usize) -> Result<(), HarnessError> {
        topology::connect_nodes(&self.timeouts, &self.nodes[from], &self.nodes[to]).await
    }

    pub async fn connect_bi(&self, a: usize, b: usize) -> Result<(), HarnessError> {
        topology::connect_nodes_bi(&self.timeouts, &self.nodes[a], &self.nodes[b]).await
    }

    pub async fn disconnect(&self, from: usize, to: usize) -> Result<(), HarnessError> {
        topology::disconnect_nodes(&self.timeouts, &self.nodes[from], &self.nodes[to]).await
    }

    /// Partition the network into the two given groups and let each half
    /// settle internally.
    pub async fn split_network(&self, left: &[usize], right: &[usize]) -> Result<(), HarnessError> {
        let left_nodes = self.nodes_subset(left);
        let right_nodes = self.nodes_subset(right);
        topology::split_groups(&self.timeouts, &left_nodes, &right_nodes).await?;
        self.sync_all_of(&left_nodes).await?;
        self.sync_all_of(&right_nodes).await
    }

    /// Restore a bridging edge between previously split halves and wait for
    /// global convergence.
    pub async fn join_network(&self, a: usize, b: usize) -> Result<(), HarnessError> {
        self.connect_bi(a, b).await?;
        self.sync_all().await
    }

    // ── Propagation waits ─────────────────────────────────────────────────

    pub async fn wait_for_sporks_same(&self) -> Result<(), HarnessError> {
        sync::wait_for_sporks_same(&self.timeouts, &self.nodes, Duration::from_secs(30)).await
    }

    pub async fn wait_for_tx(&self, node: usize, txid: &str) -> Result<(), HarnessError> {
        sync::wait_for_tx(&self.timeouts, &self.nodes[node], txid, Duration::from_secs(15)).await
    }

    pub async fn wait_for_instantlock(&self, node: usize, txid: &str) -> Result<(), HarnessError> {
        sync::wait_for_instantlock(&self.timeouts, &self.nodes[node], txid, Duration::from_secs(15))
            .await
    }

    pub async fn wait_for_mnauth(&self, node: usize, count: usize) -> Result<(), HarnessError> {
        sync::wait_for_mnauth(&self.timeouts, &self.nodes[node], count, Duration::from_secs(10))
            .await
    }

    pub async fn wait_for_chainlocked_block_all_nodes(
        &self,
        block_hash: &str,
    ) -> Result<(), HarnessError> {
        sync::wait_for_chainlocked_block_all_nodes(
            &self.timeouts,
            &self.nodes,
            block_hash,
            Duration::from_secs(15),
        )
        .await
    }

    pub async fn wait_for_best_chainlock(
        &self,
        node: usize,
        block_hash: &str,
    ) -> Result<(), HarnessError> {
        sync::wait_for_best_chainlock(
            &self.timeouts,
            &self.nodes[node],
            block_hash,
            Duration::from_secs(15),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options(root: &Path) -> HarnessOptions {
        HarnessOptions {
            daemon: Some(PathBuf::from("wagerrd")),
            nocleanup: false,
            noshutdown: false,
            tmpdir: Some(root.join("run")),
            cachedir: root.join("cache"),
            log_level: "info".into(),
            port_seed: 1,
            timeout_scale: 1,
            daemon_args: Vec::new(),
        }
    }

    #[test]
    fn rejects_zero_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let params = TestParams {
            num_nodes: 0,
            ..TestParams::default()
        };
        assert!(matches!(
            TestContext::new(test_options(tmp.path()), params),
            Err(HarnessError::Setup(_))
        ));
    }

    #[test]
    fn masternode_run_needs_a_controller() {
        let tmp = tempfile::tempdir().unwrap();
        let params = TestParams {
            num_nodes: 3,
            mn_count: 3,
            ..TestParams::default()
        };
        assert!(matches!(
            TestContext::new(test_options(tmp.path()), params),
            Err(HarnessError::Setup(_))
        ));
    }

    #[test]
    fn masternode_run_forces_clean_chain_and_spork_key() {
        let tmp = tempfile::tempdir().unwrap();
        let params = TestParams {
            num_nodes: 5,
            mn_count: 3,
            setup_clean_chain: false,
            fast_dip3_enforcement: true,
            ..TestParams::default()
        };
        let ctx = TestContext::new(test_options(tmp.path()), params).unwrap();
        assert!(ctx.params.setup_clean_chain);
        assert!(
            ctx.node_extra_args[0]
                .iter()
                .any(|a| a.starts_with("-sporkkey="))
        );
        assert!(
            !ctx.node_extra_args[1]
                .iter()
                .any(|a| a.starts_with("-sporkkey="))
        );
        for args in &ctx.node_extra_args {
            assert!(args.contains(&"-dip3params=30:50".to_string()));
            assert!(args.contains(&format!("-dip8params={DIP8_ACTIVATION_HEIGHT}")));
        }
    }

    #[test]
    fn non_default_llmq_params_become_daemon_args() {
        let tmp = tempfile::tempdir().unwrap();
        let params = TestParams {
            num_nodes: 7,
            mn_count: 5,
            llmq_size: 5,
            llmq_threshold: 3,
            ..TestParams::default()
        };
        let ctx = TestContext::new(test_options(tmp.path()), params).unwrap();
        for args in &ctx.node_extra_args {
            assert!(args.contains(&"-llmqtestparams=5:3".to_string()));
        }
    }

    #[test]
    fn extra_args_are_padded_per_node() {
        let tmp = tempfile::tempdir().unwrap();
        let params = TestParams {
            num_nodes: 3,
            extra_args: vec![vec!["-debug".into()]],
            ..TestParams::default()
        };
        let ctx = TestContext::new(test_options(tmp.path()), params).unwrap();
        assert_eq!(ctx.node_extra_args.len(), 3);
        assert_eq!(ctx.node_extra_args[0], vec!["-debug".to_string()]);
        assert!(ctx.node_extra_args[2].is_empty());
    }
}
