//! Result records for the daemon's RPC responses.
//!
//! Fields the daemon omits depending on state or flags are `Option` (or
//! defaulted collections) so that a missing field surfaces at the call site
//! instead of deep inside orchestration logic.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A block as returned by `getblock`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    /// Block hash as hex.
    pub hash: String,
    /// Depth below the active tip; negative for blocks off the active chain.
    pub confirmations: i64,
    /// Block height.
    pub height: u64,
    /// Block timestamp (Unix seconds).
    pub time: Option<i64>,
    /// Median time past of the block.
    pub mediantime: Option<i64>,
    pub previousblockhash: Option<String>,
    pub nextblockhash: Option<String>,
    /// Transaction ids in the block.
    #[serde(default)]
    pub tx: Vec<String>,
    /// Whether a quorum has chain-locked this block.
    #[serde(default)]
    pub chainlock: bool,
}

/// A block header as returned by `getblockheader`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeaderInfo {
    pub hash: String,
    pub height: u64,
    pub time: Option<i64>,
    pub mediantime: Option<i64>,
    pub previousblockhash: Option<String>,
}

/// One entry of the `getchaintips` response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub hash: String,
    /// Length of the branch connecting this tip to the active chain.
    pub branchlen: u64,
    /// One of "active", "valid-fork", "valid-headers", "headers-only", "invalid".
    pub status: String,
    pub forkpoint: Option<String>,
}

/// `getblockchaininfo` response (subset consumed by the harness).
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    pub bestblockhash: String,
    pub mediantime: Option<i64>,
    pub initialblockdownload: Option<bool>,
    pub pruned: Option<bool>,
}

/// `gettxoutsetinfo` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TxOutSetInfo {
    pub height: u64,
    pub bestblock: String,
    pub transactions: u64,
    pub txouts: u64,
    pub total_amount: f64,
}

/// `getnetworkinfo` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub subversion: Option<String>,
    /// Advertised local service bits as a hex string.
    pub localservices: String,
    pub connections: Option<u64>,
}

/// One entry of the `getpeerinfo` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerInfo {
    pub id: Option<i64>,
    pub addr: String,
    pub subver: Option<String>,
    pub inbound: Option<bool>,
    /// proTxHash of the peer once the masternode auth handshake completed.
    #[serde(default)]
    pub verified_proregtx_hash: Option<String>,
}

/// `getmempoolinfo` response.
#[derive(Debug, Clone, Deserialize)]
pub struct MempoolInfo {
    pub size: u64,
    pub bytes: Option<u64>,
}

/// A transaction output in a verbose transaction response.
#[derive(Debug, Clone, Deserialize)]
pub struct VoutInfo {
    pub value: f64,
    pub n: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// A transaction input; coinbase inputs carry neither txid nor vout.
#[derive(Debug, Clone, Deserialize)]
pub struct VinInfo {
    pub txid: Option<String>,
    pub vout: Option<u32>,
}

/// `getrawtransaction … true` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct RawTransactionInfo {
    pub txid: String,
    pub hex: Option<String>,
    pub confirmations: Option<i64>,
    /// Whether an InstantSend lock covers this transaction.
    #[serde(default)]
    pub instantlock: bool,
    #[serde(default)]
    pub chainlock: bool,
    #[serde(default)]
    pub vin: Vec<VinInfo>,
    #[serde(default)]
    pub vout: Vec<VoutInfo>,
}

/// `decoderawtransaction` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct DecodedTransaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<VinInfo>,
    #[serde(default)]
    pub vout: Vec<VoutInfo>,
}

/// `fundrawtransaction` response.
#[derive(Debug, Clone, Deserialize)]
pub struct FundRawTransactionResult {
    pub hex: String,
    pub fee: f64,
    pub changepos: i64,
}

/// `signrawtransactionwithwallet` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SignRawTransactionResult {
    pub hex: String,
    pub complete: bool,
}

/// One entry of the `listunspent` response.
#[derive(Debug, Clone, Deserialize)]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub address: Option<String>,
    pub amount: f64,
    pub confirmations: Option<i64>,
    pub spendable: Option<bool>,
}

/// A BLS key pair from `bls generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlsKeyPair {
    pub public: String,
    pub secret: String,
}

/// `quorum dkgstatus` response. All three sections are keyed by LLMQ name
/// (e.g. "llmq_test"); `session` is empty on nodes not participating in a
/// DKG, and the connection/commitment sections are absent until the daemon
/// populates them.
#[derive(Debug, Clone, Deserialize)]
pub struct DkgStatus {
    #[serde(default)]
    pub session: BTreeMap<String, DkgSession>,
    #[serde(rename = "quorumConnections")]
    pub quorum_connections: Option<BTreeMap<String, Vec<QuorumConnection>>>,
    #[serde(rename = "minableCommitments")]
    pub minable_commitments: Option<BTreeMap<String, MinableCommitment>>,
}

/// A node's view of its own DKG session.
#[derive(Debug, Clone, Deserialize)]
pub struct DkgSession {
    #[serde(rename = "quorumHash")]
    pub quorum_hash: String,
    #[serde(rename = "quorumHeight")]
    pub quorum_height: Option<u64>,
    /// Current DKG phase number, absent before the session initializes.
    pub phase: Option<u8>,
    #[serde(rename = "receivedContributions")]
    pub received_contributions: Option<u64>,
    #[serde(rename = "receivedComplaints")]
    pub received_complaints: Option<u64>,
    #[serde(rename = "receivedJustifications")]
    pub received_justifications: Option<u64>,
    #[serde(rename = "receivedPrematureCommitments")]
    pub received_premature_commitments: Option<u64>,
}

/// One intra-quorum connection slot reported by `quorum dkgstatus`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuorumConnection {
    #[serde(rename = "proTxHash")]
    pub pro_tx_hash: String,
    pub address: Option<String>,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub outbound: bool,
}

/// A final commitment the node considers ready to mine.
#[derive(Debug, Clone, Deserialize)]
pub struct MinableCommitment {
    #[serde(rename = "quorumHash")]
    pub quorum_hash: String,
}

/// `quorum info` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct QuorumInfo {
    pub height: u64,
    #[serde(rename = "quorumHash")]
    pub quorum_hash: String,
    #[serde(rename = "minedBlock")]
    pub mined_block: Option<String>,
    #[serde(default)]
    pub members: Vec<QuorumMember>,
    #[serde(rename = "quorumPublicKey")]
    pub quorum_public_key: Option<String>,
    /// Present only on members queried with `includeSkShare`.
    #[serde(rename = "secretKeyShare")]
    pub secret_key_share: Option<String>,
}

/// One quorum member entry of `quorum info`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuorumMember {
    #[serde(rename = "proTxHash")]
    pub pro_tx_hash: String,
    pub valid: bool,
    #[serde(rename = "pubKeyShare")]
    pub pub_key_share: Option<String>,
}

/// A recovered threshold signature from `quorum getrecsig`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveredSig {
    pub sig: String,
    pub id: Option<String>,
    #[serde(rename = "msgHash")]
    pub msg_hash: Option<String>,
}

/// `protx info` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct ProTxInfo {
    #[serde(rename = "proTxHash")]
    pub pro_tx_hash: String,
    #[serde(rename = "collateralHash")]
    pub collateral_hash: Option<String>,
    #[serde(rename = "collateralIndex")]
    pub collateral_index: Option<u32>,
    #[serde(rename = "metaInfo")]
    pub meta_info: ProTxMetaInfo,
}

/// Probe bookkeeping for a masternode, from `protx info`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProTxMetaInfo {
    #[serde(rename = "lastOutboundAttemptElapsed")]
    pub last_outbound_attempt_elapsed: i64,
    #[serde(rename = "lastOutboundSuccessElapsed")]
    pub last_outbound_success_elapsed: i64,
}

/// `mnsync status` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct MnSyncStatus {
    #[serde(rename = "AssetID")]
    pub asset_id: Option<i64>,
    #[serde(rename = "AssetName")]
    pub asset_name: Option<String>,
    #[serde(rename = "IsSynced")]
    pub is_synced: bool,
}

/// `getbestchainlock` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BestChainLock {
    pub blockhash: String,
    pub height: u64,
    pub known_block: Option<bool>,
}

/// `getblockfilter` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockFilterResult {
    /// Hex-encoded serialized filter bytes.
    pub filter: String,
    /// Hex-encoded chained filter header for this block.
    pub header: String,
}

/// `configuremanagementtoken` response (subset).
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementTokenResult {
    #[serde(rename = "groupID")]
    pub group_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dkg_status_sparse_response() {
        // A node outside any DKG session returns an empty session map and
        // omits the connection/commitment sections entirely.
        let status: DkgStatus = serde_json::from_str(r#"{"session": {}}"#).unwrap();
        assert!(status.session.is_empty());
        assert!(status.quorum_connections.is_none());
        assert!(status.minable_commitments.is_none());
    }

    #[test]
    fn dkg_status_full_response() {
        let raw = r#"{
            "session": {
                "llmq_test": {
                    "quorumHash": "aa",
                    "quorumHeight": 120,
                    "phase": 2,
                    "receivedContributions": 3
                }
            },
            "quorumConnections": {
                "llmq_test": [
                    {"proTxHash": "ab", "connected": true, "outbound": false},
                    {"proTxHash": "cd", "connected": false, "outbound": true}
                ]
            },
            "minableCommitments": {
                "llmq_test": {"quorumHash": "aa"}
            }
        }"#;
        let status: DkgStatus = serde_json::from_str(raw).unwrap();
        let session = &status.session["llmq_test"];
        assert_eq!(session.phase, Some(2));
        assert_eq!(session.received_contributions, Some(3));
        assert_eq!(session.received_complaints, None);
        let conns = &status.quorum_connections.unwrap()["llmq_test"];
        assert_eq!(conns.iter().filter(|c| c.connected).count(), 1);
    }

    #[test]
    fn chain_tip_fields() {
        let raw = r#"[
            {"height": 240, "hash": "0f", "branchlen": 0, "status": "active"},
            {"height": 237, "hash": "0e", "branchlen": 27, "status": "valid-fork", "forkpoint": "0a"}
        ]"#;
        let tips: Vec<ChainTip> = serde_json::from_str(raw).unwrap();
        assert_eq!(tips.len(), 2);
        assert_eq!(tips[0].status, "active");
        assert_eq!(tips[1].branchlen, 27);
        assert_eq!(tips[1].forkpoint.as_deref(), Some("0a"));
    }

    #[test]
    fn raw_transaction_defaults() {
        // instantlock/chainlock are omitted by older daemons; default false.
        let raw = r#"{"txid": "ff", "vout": [{"value": 25000.0, "n": 0}]}"#;
        let tx: RawTransactionInfo = serde_json::from_str(raw).unwrap();
        assert!(!tx.instantlock);
        assert_eq!(tx.vout[0].value, 25000.0);
        assert!(tx.vout[0].addresses.is_empty());
    }

    #[test]
    fn mnsync_status_pascal_case() {
        let raw = r#"{"AssetID": 999, "AssetName": "MASTERNODE_SYNC_FINISHED", "IsSynced": true}"#;
        let status: MnSyncStatus = serde_json::from_str(raw).unwrap();
        assert!(status.is_synced);
        assert_eq!(status.asset_id, Some(999));
    }
}
