//! LLMQ distributed-key-generation ceremony orchestration.
//!
//! The ceremony is a 6-phase state machine observable only through each
//! participant's `quorum dkgstatus` self-report. Block height is the clock
//! that drives phase transitions inside the daemons, so between phases the
//! controller mines a fixed number of blocks and everyone resynchronizes.
//!
//! Fault policy: a peer reporting a different quorum hash or a phase behind
//! expectation is a lagging transient and gets retried; a peer reporting a
//! phase beyond expectation, a phase regression, or more participants than
//! expected is a protocol fault and aborts the ceremony immediately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;
use wagerr_p2p::{Hash256, IsLockMessage, OutPoint, islock_request_id};
use wagerr_rpc::types::{DkgSession, RecoveredSig};

use crate::context::TestContext;
use crate::error::HarnessError;
use crate::masternode::{Masternode, SPORK_ALL_CONNECTED, SPORK_POSE};
use crate::node::NodeHandle;
use crate::poll::{Probe, poll_until, poll_until_nudged};
use crate::sync;

/// LLMQ name under which regtest test quorums report.
pub const LLMQ_NAME: &str = "llmq_test";
/// Numeric LLMQ type of the regtest test quorum.
pub const LLMQ_TYPE_TEST: u32 = 100;
/// DKG sessions start at every multiple of this height.
pub const DKG_INTERVAL: u64 = 30;

/// Blocks mined after each phase's polling converges.
const PHASE_BLOCKS: u32 = 3;
/// Extra depth mined after the commitment so the quorum may sign.
const SIGNING_ELIGIBILITY_BLOCKS: u32 = 12;
/// A masternode probe older than this is considered failed by the DKG
/// (probes retry after 50 minutes and fail after 60).
const PROBE_FRESHNESS_SECS: i64 = 55 * 60;

/// Quorum-data recovery timers mirrored from the daemon.
const QUORUM_DATA_REQUEST_TIMEOUT_SECS: i64 = 10;
const QUORUM_DATA_REQUEST_EXPIRATION_SECS: i64 = 300;

/// The six DKG phases, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DkgPhase {
    Init = 1,
    Contribute = 2,
    Complain = 3,
    Justify = 4,
    Commit = 5,
    Finalize = 6,
}

impl DkgPhase {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(DkgPhase::Init),
            2 => Some(DkgPhase::Contribute),
            3 => Some(DkgPhase::Complain),
            4 => Some(DkgPhase::Justify),
            5 => Some(DkgPhase::Commit),
            6 => Some(DkgPhase::Finalize),
            _ => None,
        }
    }
}

/// Which received-message counter gates a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCounter {
    Contributions,
    Complaints,
    Justifications,
    PrematureCommitments,
}

fn counter_value(session: &DkgSession, counter: PhaseCounter) -> u64 {
    match counter {
        PhaseCounter::Contributions => session.received_contributions,
        PhaseCounter::Complaints => session.received_complaints,
        PhaseCounter::Justifications => session.received_justifications,
        PhaseCounter::PrematureCommitments => session.received_premature_commitments,
    }
    .unwrap_or(0)
}

/// Caller overrides for one ceremony; `None` falls back to values derived
/// from the LLMQ size and active sporks.
#[derive(Debug, Clone, Default)]
pub struct CeremonyExpectations {
    pub connections: Option<usize>,
    pub members: Option<usize>,
    pub contributions: Option<u64>,
    pub complaints: u64,
    pub justifications: u64,
    pub commitments: Option<u64>,
}

fn resolve_connections(
    override_value: Option<usize>,
    llmq_size: usize,
    spork21_active: bool,
) -> usize {
    override_value.unwrap_or(if spork21_active { llmq_size - 1 } else { 2 })
}

/// One ceremony's tracking state, keyed by the anchor block hash. Enforces
/// the per-peer phase invariants across the whole polling window.
#[derive(Debug)]
pub struct CeremonySession {
    pub quorum_hash: String,
    pub expected_members: usize,
    observed_phase: BTreeMap<usize, u8>,
}

impl CeremonySession {
    pub fn new(quorum_hash: String, expected_members: usize) -> Self {
        Self {
            quorum_hash,
            expected_members,
            observed_phase: BTreeMap::new(),
        }
    }

    /// Record `node`'s reported phase while waiting for `expected`.
    /// Regression and running ahead are both protocol faults, never
    /// timing transients.
    pub fn observe(
        &mut self,
        node: usize,
        phase: u8,
        expected: DkgPhase,
    ) -> Result<(), HarnessError> {
        if let Some(&previous) = self.observed_phase.get(&node) {
            if phase < previous {
                return Err(HarnessError::ProtocolFault {
                    context: format!("dkg phase {}", expected.number()),
                    detail: format!("node {node} regressed from phase {previous} to {phase}"),
                });
            }
        }
        if phase > expected.number() {
            return Err(HarnessError::ProtocolFault {
                context: format!("dkg phase {}", expected.number()),
                detail: format!("node {node} reports phase {phase}, ahead of expectation"),
            });
        }
        self.observed_phase.insert(node, phase);
        Ok(())
    }
}

impl TestContext {
    /// Poll every participant until it reports the session at `phase` with
    /// the expected quorum hash and, when given, the expected aggregate
    /// message count.
    pub async fn wait_for_quorum_phase(
        &self,
        session: &Arc<Mutex<CeremonySession>>,
        phase: DkgPhase,
        counter: Option<(PhaseCounter, u64)>,
        mns: &[Masternode],
    ) -> Result<(), HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(30), Duration::from_millis(100));
        let session = Arc::clone(session);
        let mns = mns.to_vec();
        let what = format!("dkg phase {} ({phase:?})", phase.number());
        poll_until(&what, budget, move || {
            let session = Arc::clone(&session);
            let mns = mns.clone();
            Box::pin(async move {
                let (expected_hash, expected_members) = {
                    let s = session.lock();
                    (s.quorum_hash.clone(), s.expected_members)
                };
                let mut reporting = 0usize;
                for mn in &mns {
                    let status = match mn.node.rpc().quorum_dkg_status().await {
                        Ok(status) => status,
                        Err(e) => return Ok(Probe::Pending(format!("node {}: {e}", mn.node_index))),
                    };
                    let Some(dkg) = status.session.get(LLMQ_NAME) else {
                        continue;
                    };
                    reporting += 1;
                    if dkg.quorum_hash != expected_hash {
                        // Probably still on the previous session; let it catch up.
                        return Ok(Probe::Pending(format!(
                            "node {} on quorum {}",
                            mn.node_index, dkg.quorum_hash
                        )));
                    }
                    let Some(reported) = dkg.phase else {
                        return Ok(Probe::Pending(format!(
                            "node {} has no phase yet",
                            mn.node_index
                        )));
                    };
                    session.lock().observe(mn.node_index, reported, phase)?;
                    if reported != phase.number() {
                        return Ok(Probe::Pending(format!(
                            "node {} at phase {reported}",
                            mn.node_index
                        )));
                    }
                    if let Some((which, want)) = counter {
                        let got = counter_value(dkg, which);
                        if got < want {
                            return Ok(Probe::Pending(format!(
                                "node {} {which:?} {got}/{want}",
                                mn.node_index
                            )));
                        }
                    }
                }
                if reporting > expected_members {
                    return Err(HarnessError::ProtocolFault {
                        context: format!("dkg phase {}", phase.number()),
                        detail: format!(
                            "{reporting} peers report the session, expected {expected_members}"
                        ),
                    });
                }
                if reporting < expected_members {
                    return Ok(Probe::Pending(format!(
                        "{reporting}/{expected_members} peers report the session"
                    )));
                }
                Ok(Probe::Converged)
            })
        })
        .await
    }

    /// Connectivity precondition: every session participant sees the
    /// expected number of live intra-quorum connections. Nudged by clock
    /// bumps because connection retry timers only advance with mocktime.
    pub async fn wait_for_quorum_connections(
        &self,
        expected: usize,
        nodes: &[Arc<NodeHandle>],
    ) -> Result<(), HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(60), Duration::from_secs(1));
        let set = nodes.to_vec();
        let nudge = self.mocktime_nudge(1, nodes);
        poll_until_nudged(
            "quorum connections",
            budget,
            move || {
                let set = set.clone();
                Box::pin(async move {
                    let mut seen = 0usize;
                    for node in &set {
                        let status = match node.rpc().quorum_dkg_status().await {
                            Ok(status) => status,
                            Err(e) => {
                                return Ok(Probe::Pending(format!("node {}: {e}", node.index)));
                            }
                        };
                        if !status.session.contains_key(LLMQ_NAME) {
                            continue;
                        }
                        seen += 1;
                        let connected = status
                            .quorum_connections
                            .as_ref()
                            .and_then(|m| m.get(LLMQ_NAME))
                            .map(|conns| conns.iter().filter(|c| c.connected).count());
                        match connected {
                            Some(count) if count >= expected => {}
                            Some(count) => {
                                return Ok(Probe::Pending(format!(
                                    "node {} has {count}/{expected} connections",
                                    node.index
                                )));
                            }
                            None => {
                                return Ok(Probe::Pending(format!(
                                    "node {} reports no connection table",
                                    node.index
                                )));
                            }
                        }
                    }
                    if seen == 0 {
                        return Ok(Probe::Pending("no dkg session visible yet".into()));
                    }
                    Ok(Probe::Converged)
                })
            },
            nudge,
        )
        .await
    }

    /// Proof-of-service precondition: every expected-online masternode has
    /// a sufficiently fresh probe result for each of its inbound quorum
    /// connections.
    pub async fn wait_for_masternode_probes(
        &self,
        mns: &[Masternode],
    ) -> Result<(), HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(30), Duration::from_secs(1));
        let set = mns.to_vec();
        let nodes: Vec<Arc<NodeHandle>> = mns.iter().map(|m| Arc::clone(&m.node)).collect();
        let nudge = self.mocktime_nudge(1, &nodes);
        poll_until_nudged(
            "masternode probes",
            budget,
            move || {
                let set = set.clone();
                Box::pin(async move {
                    for mn in &set {
                        let status = match mn.node.rpc().quorum_dkg_status().await {
                            Ok(status) => status,
                            Err(e) => {
                                return Ok(Probe::Pending(format!("node {}: {e}", mn.node_index)));
                            }
                        };
                        if !status.session.contains_key(LLMQ_NAME) {
                            continue;
                        }
                        let Some(connections) = status
                            .quorum_connections
                            .as_ref()
                            .and_then(|m| m.get(LLMQ_NAME))
                        else {
                            return Ok(Probe::Pending(format!(
                                "node {} reports no connection table",
                                mn.node_index
                            )));
                        };
                        for connection in connections {
                            if connection.pro_tx_hash == mn.identity.pro_tx_hash
                                || connection.outbound
                            {
                                continue;
                            }
                            let peer = mn.node.rpc().protx_info(&connection.pro_tx_hash).await?;
                            let meta = &peer.meta_info;
                            let expected_online = set
                                .iter()
                                .any(|m| m.identity.pro_tx_hash == connection.pro_tx_hash);
                            let stale = if expected_online {
                                meta.last_outbound_success_elapsed > PROBE_FRESHNESS_SECS
                            } else {
                                meta.last_outbound_attempt_elapsed > PROBE_FRESHNESS_SECS
                                    && meta.last_outbound_success_elapsed > PROBE_FRESHNESS_SECS
                            };
                            if stale {
                                return Ok(Probe::Pending(format!(
                                    "node {} probe of {} is stale",
                                    mn.node_index, connection.pro_tx_hash
                                )));
                            }
                        }
                    }
                    Ok(Probe::Converged)
                })
            },
            nudge,
        )
        .await
    }

    /// Wait until every node holds a minable final commitment for `q`.
    pub async fn wait_for_quorum_commitment(
        &self,
        quorum_hash: &str,
        nodes: &[Arc<NodeHandle>],
    ) -> Result<(), HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(15), Duration::from_millis(100));
        let set = nodes.to_vec();
        let quorum_hash = quorum_hash.to_string();
        poll_until("minable commitment", budget, move || {
            let set = set.clone();
            let quorum_hash = quorum_hash.clone();
            Box::pin(async move {
                for node in &set {
                    let status = match node.rpc().quorum_dkg_status().await {
                        Ok(status) => status,
                        Err(e) => return Ok(Probe::Pending(format!("node {}: {e}", node.index))),
                    };
                    let commitment = status
                        .minable_commitments
                        .as_ref()
                        .and_then(|m| m.get(LLMQ_NAME));
                    match commitment {
                        Some(c) if c.quorum_hash == quorum_hash => {}
                        Some(c) => {
                            return Ok(Probe::Pending(format!(
                                "node {} commitment is for {}",
                                node.index, c.quorum_hash
                            )));
                        }
                        None => {
                            return Ok(Probe::Pending(format!(
                                "node {} has no minable commitment",
                                node.index
                            )));
                        }
                    }
                }
                Ok(Probe::Converged)
            })
        })
        .await
    }

    /// Wait until `q` appears in every participant's quorum list, nudging
    /// with a mined block, a clock bump, and a resync per attempt.
    pub async fn wait_for_quorum_list(
        &self,
        quorum_hash: &str,
        nodes: &[Arc<NodeHandle>],
    ) -> Result<(), HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(30), Duration::from_millis(500));
        let set = nodes.to_vec();
        let quorum_hash = quorum_hash.to_string();
        let clock = Arc::clone(&self.clock);
        let controller = self.node(0);
        let nudge_nodes = nodes.to_vec();
        let timeouts = self.timeouts;
        poll_until_nudged(
            "quorum list",
            budget,
            move || {
                let set = set.clone();
                let quorum_hash = quorum_hash.clone();
                Box::pin(async move {
                    for node in &set {
                        let list = match node.rpc().quorum_list().await {
                            Ok(list) => list,
                            Err(e) => {
                                return Ok(Probe::Pending(format!("node {}: {e}", node.index)));
                            }
                        };
                        let listed = list
                            .get(LLMQ_NAME)
                            .is_some_and(|hashes| hashes.iter().any(|h| h == &quorum_hash));
                        if !listed {
                            return Ok(Probe::Pending(format!(
                                "node {} does not list the quorum yet",
                                node.index
                            )));
                        }
                    }
                    Ok(Probe::Converged)
                })
            },
            move || {
                let clock = Arc::clone(&clock);
                let controller = Arc::clone(&controller);
                let nudge_nodes = nudge_nodes.clone();
                Box::pin(async move {
                    let t = clock.advance(1);
                    for node in &nudge_nodes {
                        node.set_mocktime(t).await?;
                    }
                    controller.rpc().generate(1).await?;
                    sync::sync_blocks(&timeouts, &nudge_nodes, sync::SYNC_TIMEOUT).await
                })
            },
        )
        .await
    }

    /// Drive one full DKG ceremony and return the new quorum's hash.
    ///
    /// Only one ceremony may run at a time against a node set; the phases
    /// share a single [`CeremonySession`] so cross-phase regressions are
    /// caught too.
    pub async fn mine_quorum(
        &self,
        expectations: CeremonyExpectations,
    ) -> Result<String, HarnessError> {
        let node0 = self.node(0);
        let rpc0 = node0.rpc();
        let llmq_size = self.params.llmq_size;

        let sporks = rpc0.spork_show().await?;
        let spork21_active = sporks.get(SPORK_ALL_CONNECTED).copied().unwrap_or(i64::MAX) <= 1;
        let spork23_active = sporks.get(SPORK_POSE).copied().unwrap_or(i64::MAX) <= 1;

        let expected_connections =
            resolve_connections(expectations.connections, llmq_size, spork21_active);
        let expected_members = expectations.members.unwrap_or(llmq_size);
        let expected_contributions = expectations.contributions.unwrap_or(llmq_size as u64);
        let expected_commitments = expectations.commitments.unwrap_or(llmq_size as u64);

        info!(
            expected_members,
            expected_connections,
            expected_contributions,
            expected_complaints = expectations.complaints,
            expected_justifications = expectations.justifications,
            expected_commitments,
            "mining quorum"
        );

        let mns = self.masternodes.clone();
        let mut participants: Vec<Arc<NodeHandle>> = vec![Arc::clone(&node0)];
        participants.extend(mns.iter().map(|m| Arc::clone(&m.node)));

        // Move to the next DKG epoch boundary; its block hash keys the session.
        let height = rpc0.get_block_count().await?;
        let skip = DKG_INTERVAL - (height % DKG_INTERVAL);
        self.bump_mocktime(1, Some(&participants)).await?;
        self.generate(0, skip as u32).await?;
        self.sync_blocks_of(&participants).await?;
        let quorum_hash = rpc0.get_best_block_hash().await?;

        let session = Arc::new(Mutex::new(CeremonySession::new(
            quorum_hash.clone(),
            expected_members,
        )));

        info!("waiting for phase 1 (init)");
        self.wait_for_quorum_phase(&session, DkgPhase::Init, None, &mns).await?;
        self.wait_for_quorum_connections(expected_connections, &participants).await?;
        if spork23_active {
            self.wait_for_masternode_probes(&mns).await?;
        }
        self.advance_ceremony(&participants).await?;

        info!("waiting for phase 2 (contribute)");
        self.wait_for_quorum_phase(
            &session,
            DkgPhase::Contribute,
            Some((PhaseCounter::Contributions, expected_contributions)),
            &mns,
        )
        .await?;
        self.advance_ceremony(&participants).await?;

        info!("waiting for phase 3 (complain)");
        self.wait_for_quorum_phase(
            &session,
            DkgPhase::Complain,
            Some((PhaseCounter::Complaints, expectations.complaints)),
            &mns,
        )
        .await?;
        self.advance_ceremony(&participants).await?;

        info!("waiting for phase 4 (justify)");
        self.wait_for_quorum_phase(
            &session,
            DkgPhase::Justify,
            Some((PhaseCounter::Justifications, expectations.justifications)),
            &mns,
        )
        .await?;
        self.advance_ceremony(&participants).await?;

        info!("waiting for phase 5 (commit)");
        self.wait_for_quorum_phase(
            &session,
            DkgPhase::Commit,
            Some((PhaseCounter::PrematureCommitments, expected_commitments)),
            &mns,
        )
        .await?;
        self.advance_ceremony(&participants).await?;

        info!("waiting for phase 6 (finalize)");
        self.wait_for_quorum_phase(&session, DkgPhase::Finalize, None, &mns).await?;

        info!("waiting for the final commitment");
        self.wait_for_quorum_commitment(&quorum_hash, &participants).await?;

        info!("mining the final commitment");
        self.bump_mocktime(1, Some(&participants)).await?;
        self.generate(0, 1).await?;
        self.sync_blocks_of(&participants).await?;

        info!("waiting for the quorum to appear in the list");
        self.wait_for_quorum_list(&quorum_hash, &participants).await?;
        let newest = rpc0
            .quorum_list_recent(1)
            .await?
            .get(LLMQ_NAME)
            .and_then(|hashes| hashes.first().cloned())
            .unwrap_or_default();
        if newest != quorum_hash {
            return Err(HarnessError::ProtocolFault {
                context: "quorum list".into(),
                detail: format!("newest quorum is {newest}, expected {quorum_hash}"),
            });
        }
        let quorum_info = rpc0.quorum_info(LLMQ_TYPE_TEST, &quorum_hash, false).await?;

        // Give the quorum enough depth to become eligible for signing.
        self.generate(0, SIGNING_ELIGIBILITY_BLOCKS).await?;
        self.sync_blocks_of(&participants).await?;

        info!(
            height = quorum_info.height,
            quorum = %quorum_hash,
            mined_block = quorum_info.mined_block.as_deref().unwrap_or(""),
            "new quorum"
        );
        Ok(quorum_hash)
    }

    /// The between-phases step: bump the clock, mine a few blocks, resync.
    async fn advance_ceremony(&self, participants: &[Arc<NodeHandle>]) -> Result<(), HarnessError> {
        self.bump_mocktime(1, Some(participants)).await?;
        self.generate(0, PHASE_BLOCKS).await?;
        self.sync_blocks_of(participants).await
    }

    /// Masternodes that are members of quorum `q`, resolved against the
    /// run's registry.
    pub async fn get_quorum_masternodes(
        &self,
        quorum_hash: &str,
    ) -> Result<Vec<Masternode>, HarnessError> {
        let info = self
            .node(0)
            .rpc()
            .quorum_info(LLMQ_TYPE_TEST, quorum_hash, false)
            .await?;
        let mut members = Vec::with_capacity(info.members.len());
        for member in &info.members {
            let Some(mn) = self.get_mninfo(&member.pro_tx_hash) else {
                return Err(HarnessError::ProtocolFault {
                    context: "quorum membership".into(),
                    detail: format!("member {} is not a registered masternode", member.pro_tx_hash),
                });
            };
            members.push(mn);
        }
        Ok(members)
    }

    pub fn get_mninfo(&self, pro_tx_hash: &str) -> Option<Masternode> {
        self.masternodes
            .iter()
            .find(|m| m.identity.pro_tx_hash == pro_tx_hash)
            .cloned()
    }

    /// Fetch a recovered threshold signature, polling while the signing
    /// session completes. Recovered sigs are not relayed to regular nodes,
    /// so `node` should be a quorum member.
    pub async fn get_recovered_sig(
        &self,
        node: &Arc<NodeHandle>,
        request_id: &str,
        msg_hash: &str,
    ) -> Result<RecoveredSig, HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(10), Duration::from_millis(100));
        let slot: Arc<Mutex<Option<RecoveredSig>>> = Arc::new(Mutex::new(None));
        let probe_slot = Arc::clone(&slot);
        let node = Arc::clone(node);
        let request_id = request_id.to_string();
        let msg_hash = msg_hash.to_string();
        poll_until("recovered signature", budget, move || {
            let slot = Arc::clone(&probe_slot);
            let node = Arc::clone(&node);
            let request_id = request_id.clone();
            let msg_hash = msg_hash.clone();
            Box::pin(async move {
                match node
                    .rpc()
                    .quorum_get_recovered_sig(LLMQ_TYPE_TEST, &request_id, &msg_hash)
                    .await
                {
                    Ok(sig) => {
                        *slot.lock() = Some(sig);
                        Ok(Probe::Converged)
                    }
                    Err(e) => Ok(Probe::Pending(e.to_string())),
                }
            })
        })
        .await?;
        let sig = slot.lock().take();
        sig.ok_or_else(|| HarnessError::Setup("recovered signature slot empty".into()))
    }

    /// Build an InstantSend lock for a signed raw transaction by driving a
    /// signing session across the quorum members.
    pub async fn create_islock(&self, tx_hex: &str) -> Result<IsLockMessage, HarnessError> {
        let node0 = self.node(0);
        let decoded = node0.rpc().decode_raw_transaction(tx_hex).await?;
        let mut inputs = Vec::with_capacity(decoded.vin.len());
        for vin in &decoded.vin {
            let (Some(txid), Some(vout)) = (&vin.txid, vin.vout) else {
                return Err(HarnessError::Setup(
                    "cannot lock a transaction with coinbase inputs".into(),
                ));
            };
            inputs.push(OutPoint {
                txid: Hash256::from_rpc_hex(txid)?,
                vout,
            });
        }
        let request_id = islock_request_id(&inputs).to_rpc_hex();

        // Every member contributes a share; remember one that accepted the
        // request so we can ask it for the recovered signature.
        let mut signer: Option<&Masternode> = None;
        for mn in &self.masternodes {
            let accepted = mn
                .node
                .rpc()
                .quorum_sign(LLMQ_TYPE_TEST, &request_id, &decoded.txid)
                .await
                .unwrap_or(false);
            if accepted && signer.is_none() {
                signer = Some(mn);
            }
        }
        let signer = signer.ok_or_else(|| HarnessError::ProtocolFault {
            context: "islock signing".into(),
            detail: "no quorum member accepted the signing request".into(),
        })?;

        let recovered = self
            .get_recovered_sig(&signer.node, &request_id, &decoded.txid)
            .await?;
        let sig_bytes = hex::decode(&recovered.sig)
            .map_err(|_| HarnessError::Setup("recovered signature is not hex".into()))?;
        let signature: [u8; 96] = sig_bytes
            .try_into()
            .map_err(|_| HarnessError::Setup("recovered signature is not 96 bytes".into()))?;

        Ok(IsLockMessage {
            inputs,
            txid: Hash256::from_rpc_hex(&decoded.txid)?,
            signature,
        })
    }

    /// Check one member's view of the quorum's key-share distribution.
    pub async fn quorum_data_ok(
        &self,
        mn: &Masternode,
        quorum_hash: &str,
        test_secret: bool,
        expect_secret: bool,
    ) -> bool {
        let Ok(info) = mn
            .node
            .rpc()
            .quorum_info(LLMQ_TYPE_TEST, quorum_hash, true)
            .await
        else {
            return false;
        };
        if test_secret && expect_secret != info.secret_key_share.is_some() {
            return false;
        }
        if info.members.is_empty() {
            return false;
        }
        let valid = info.members.iter().filter(|m| m.valid).count();
        let with_pubkey = info
            .members
            .iter()
            .filter(|m| m.pub_key_share.is_some())
            .count();
        valid == with_pubkey
    }

    /// Wait until every given member holds the quorum's verification vector
    /// and key shares. With `recover`, the nudge alternates the short
    /// request-retry timer and the long request-expiration timer so the
    /// daemon's quorum-data recovery thread actually re-asks.
    pub async fn wait_for_quorum_data(
        &self,
        mns: &[Masternode],
        quorum_hash: &str,
        test_secret: bool,
        expect_secret: bool,
        recover: bool,
    ) -> Result<(), HarnessError> {
        let budget = self.timeouts.budget(Duration::from_secs(60), Duration::from_millis(500));
        let set = mns.to_vec();
        let quorum_hash_probe = quorum_hash.to_string();
        let this_nodes = self.nodes.clone();
        let clock = Arc::clone(&self.clock);
        let controller = self.node(0);
        let session_mns = set.clone();
        // Cannot borrow self inside the boxed probes; rebuild the check from
        // the pieces it needs.
        poll_until_nudged(
            "quorum data distribution",
            budget,
            move || {
                let set = session_mns.clone();
                let quorum_hash = quorum_hash_probe.clone();
                Box::pin(async move {
                    let mut ready = 0usize;
                    for mn in &set {
                        let ok = {
                            let Ok(info) = mn
                                .node
                                .rpc()
                                .quorum_info(LLMQ_TYPE_TEST, &quorum_hash, true)
                                .await
                            else {
                                continue;
                            };
                            if test_secret && expect_secret != info.secret_key_share.is_some() {
                                false
                            } else if info.members.is_empty() {
                                false
                            } else {
                                let valid = info.members.iter().filter(|m| m.valid).count();
                                let with_pubkey = info
                                    .members
                                    .iter()
                                    .filter(|m| m.pub_key_share.is_some())
                                    .count();
                                valid == with_pubkey
                            }
                        };
                        if ok {
                            ready += 1;
                        }
                    }
                    if ready == set.len() {
                        Ok(Probe::Converged)
                    } else {
                        Ok(Probe::Pending(format!("{ready}/{} members ready", set.len())))
                    }
                })
            },
            move || {
                let clock = Arc::clone(&clock);
                let nodes = this_nodes.clone();
                let controller = Arc::clone(&controller);
                Box::pin(async move {
                    if !recover {
                        return Ok(());
                    }
                    // Alternate the two recovery timers.
                    if clock.current() % 2 == 1 {
                        let t = clock.advance(QUORUM_DATA_REQUEST_EXPIRATION_SECS + 1);
                        for node in &nodes {
                            node.set_mocktime(t).await?;
                        }
                        controller.rpc().generate(1).await?;
                    } else {
                        let t = clock.advance(QUORUM_DATA_REQUEST_TIMEOUT_SECS + 1);
                        for node in &nodes {
                            node.set_mocktime(t).await?;
                        }
                    }
                    Ok(())
                })
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_numbers_round_trip_in_order() {
        let phases = [
            DkgPhase::Init,
            DkgPhase::Contribute,
            DkgPhase::Complain,
            DkgPhase::Justify,
            DkgPhase::Commit,
            DkgPhase::Finalize,
        ];
        for (i, phase) in phases.iter().enumerate() {
            assert_eq!(phase.number() as usize, i + 1);
            assert_eq!(DkgPhase::from_number(phase.number()), Some(*phase));
        }
        assert!(DkgPhase::from_number(0).is_none());
        assert!(DkgPhase::from_number(7).is_none());
        assert!(phases.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn session_accepts_monotone_progress() {
        let mut session = CeremonySession::new("q".into(), 3);
        session.observe(1, 1, DkgPhase::Init).unwrap();
        session.observe(1, 1, DkgPhase::Init).unwrap();
        session.observe(1, 2, DkgPhase::Contribute).unwrap();
        session.observe(2, 2, DkgPhase::Contribute).unwrap();
    }

    #[test]
    fn session_rejects_phase_regression() {
        let mut session = CeremonySession::new("q".into(), 3);
        session.observe(1, 3, DkgPhase::Complain).unwrap();
        let err = session.observe(1, 2, DkgPhase::Complain).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolFault { .. }));
    }

    #[test]
    fn session_rejects_running_ahead() {
        let mut session = CeremonySession::new("q".into(), 3);
        let err = session.observe(1, 4, DkgPhase::Complain).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolFault { .. }));
    }

    #[test]
    fn counter_selection_reads_the_right_field() {
        let session: DkgSession = serde_json::from_str(
            r#"{
                "quorumHash": "q",
                "phase": 2,
                "receivedContributions": 3,
                "receivedComplaints": 1
            }"#,
        )
        .unwrap();
        assert_eq!(counter_value(&session, PhaseCounter::Contributions), 3);
        assert_eq!(counter_value(&session, PhaseCounter::Complaints), 1);
        assert_eq!(counter_value(&session, PhaseCounter::Justifications), 0);
        assert_eq!(
            counter_value(&session, PhaseCounter::PrematureCommitments),
            0
        );
    }

    #[test]
    fn connection_expectations_follow_spork21() {
        assert_eq!(resolve_connections(None, 3, true), 2);
        assert_eq!(resolve_connections(None, 3, false), 2);
        assert_eq!(resolve_connections(None, 5, true), 4);
        assert_eq!(resolve_connections(None, 5, false), 2);
        assert_eq!(resolve_connections(Some(7), 3, true), 7);
    }
}
