//! JSON-RPC 2.0 client over HTTP.
//!
//! One client per node; the daemon authenticates with HTTP basic auth
//! (`rpcuser`/`rpcpassword` from its config file). Every typed wrapper goes
//! through [`RpcClient::call`], which unwraps the JSON-RPC envelope and
//! surfaces server errors with their code.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::trace;

use crate::error::RpcError;
use crate::types::*;

/// Per-request HTTP timeout. Generous on purpose: retry budgets live in the
/// caller's polling layer, not here.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    endpoint: String,
    user: String,
    password: String,
}

impl RpcClient {
    pub fn new(endpoint: &str, user: &str, password: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
        }
    }

    /// Issue a raw JSON-RPC call and deserialize the `result` field.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });
        trace!(method, %params, "rpc request");
        let resp: Value = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.get("error") {
            if !err.is_null() {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                return Err(RpcError::Server { code, message });
            }
        }
        let result = resp.get("result").cloned().unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| RpcError::Decode {
            method: method.to_string(),
            detail: e.to_string(),
        })
    }

    // ── Chain queries ─────────────────────────────────────────────────────

    pub async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    pub async fn get_best_block_hash(&self) -> Result<String, RpcError> {
        self.call("getbestblockhash", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    pub async fn get_block(&self, hash: &str) -> Result<BlockInfo, RpcError> {
        self.call("getblock", json!([hash])).await
    }

    pub async fn get_block_header(&self, hash: &str) -> Result<BlockHeaderInfo, RpcError> {
        self.call("getblockheader", json!([hash])).await
    }

    pub async fn get_chain_tips(&self) -> Result<Vec<ChainTip>, RpcError> {
        self.call("getchaintips", json!([])).await
    }

    pub async fn get_best_chain_lock(&self) -> Result<BestChainLock, RpcError> {
        self.call("getbestchainlock", json!([])).await
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub async fn get_tx_out_set_info(&self) -> Result<TxOutSetInfo, RpcError> {
        self.call("gettxoutsetinfo", json!([])).await
    }

    pub async fn get_block_filter(
        &self,
        block_hash: &str,
        filter_type: &str,
    ) -> Result<BlockFilterResult, RpcError> {
        self.call("getblockfilter", json!([block_hash, filter_type]))
            .await
    }

    // ── Mempool and transactions ──────────────────────────────────────────

    pub async fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.call("getrawmempool", json!([])).await
    }

    pub async fn get_mempool_info(&self) -> Result<MempoolInfo, RpcError> {
        self.call("getmempoolinfo", json!([])).await
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> Result<String, RpcError> {
        self.call("getrawtransaction", json!([txid])).await
    }

    pub async fn get_raw_transaction_verbose(
        &self,
        txid: &str,
    ) -> Result<RawTransactionInfo, RpcError> {
        self.call("getrawtransaction", json!([txid, true])).await
    }

    pub async fn decode_raw_transaction(&self, hex: &str) -> Result<DecodedTransaction, RpcError> {
        self.call("decoderawtransaction", json!([hex])).await
    }

    pub async fn create_raw_transaction(
        &self,
        inputs: &[(String, u32)],
        outputs: &BTreeMap<String, f64>,
    ) -> Result<String, RpcError> {
        let ins: Vec<Value> = inputs
            .iter()
            .map(|(txid, vout)| json!({"txid": txid, "vout": vout}))
            .collect();
        self.call("createrawtransaction", json!([ins, outputs]))
            .await
    }

    pub async fn fund_raw_transaction(
        &self,
        hex: &str,
    ) -> Result<FundRawTransactionResult, RpcError> {
        self.call("fundrawtransaction", json!([hex])).await
    }

    pub async fn sign_raw_transaction_with_wallet(
        &self,
        hex: &str,
    ) -> Result<SignRawTransactionResult, RpcError> {
        self.call("signrawtransactionwithwallet", json!([hex])).await
    }

    pub async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError> {
        self.call("sendrawtransaction", json!([hex])).await
    }

    // ── Wallet ────────────────────────────────────────────────────────────

    pub async fn get_new_address(&self) -> Result<String, RpcError> {
        self.call("getnewaddress", json!([])).await
    }

    pub async fn get_balance(&self) -> Result<f64, RpcError> {
        self.call("getbalance", json!([])).await
    }

    pub async fn send_to_address(&self, address: &str, amount: f64) -> Result<String, RpcError> {
        self.call("sendtoaddress", json!([address, amount])).await
    }

    pub async fn list_unspent(&self) -> Result<Vec<UnspentOutput>, RpcError> {
        self.call("listunspent", json!([])).await
    }

    /// Lock (`unlock = false`) or unlock (`unlock = true`) outpoints against
    /// accidental selection by wallet coin selection.
    pub async fn lock_unspent(
        &self,
        unlock: bool,
        outpoints: &[(String, u32)],
    ) -> Result<bool, RpcError> {
        let outs: Vec<Value> = outpoints
            .iter()
            .map(|(txid, vout)| json!({"txid": txid, "vout": vout}))
            .collect();
        self.call("lockunspent", json!([unlock, outs])).await
    }

    pub async fn import_priv_key(&self, wif: &str) -> Result<(), RpcError> {
        self.call("importprivkey", json!([wif])).await
    }

    // ── Network control ───────────────────────────────────────────────────

    pub async fn add_node_onetry(&self, addr: &str) -> Result<(), RpcError> {
        self.call("addnode", json!([addr, "onetry"])).await
    }

    pub async fn disconnect_node(&self, addr: &str) -> Result<(), RpcError> {
        self.call("disconnectnode", json!([addr])).await
    }

    pub async fn get_peer_info(&self) -> Result<Vec<PeerInfo>, RpcError> {
        self.call("getpeerinfo", json!([])).await
    }

    pub async fn get_network_info(&self) -> Result<NetworkInfo, RpcError> {
        self.call("getnetworkinfo", json!([])).await
    }

    // ── Test control ──────────────────────────────────────────────────────

    pub async fn set_mocktime(&self, timestamp: i64) -> Result<(), RpcError> {
        self.call("setmocktime", json!([timestamp])).await
    }

    pub async fn generate(&self, blocks: u32) -> Result<Vec<String>, RpcError> {
        self.call("generate", json!([blocks])).await
    }

    pub async fn stop(&self) -> Result<String, RpcError> {
        self.call("stop", json!([])).await
    }

    // ── Masternodes ───────────────────────────────────────────────────────

    pub async fn bls_generate(&self) -> Result<BlsKeyPair, RpcError> {
        self.call("bls", json!(["generate"])).await
    }

    /// `protx register_fund`: the collateral is funded in-place from the
    /// wallet. Returns the proTxHash when `submit`, the raw tx hex otherwise.
    #[allow(clippy::too_many_arguments)]
    pub async fn protx_register_fund(
        &self,
        collateral_address: &str,
        ip_and_port: &str,
        owner_address: &str,
        operator_pubkey: &str,
        voting_address: &str,
        operator_reward: u32,
        payout_address: &str,
        fee_source_address: &str,
        submit: bool,
    ) -> Result<String, RpcError> {
        self.call(
            "protx",
            json!([
                "register_fund",
                collateral_address,
                ip_and_port,
                owner_address,
                operator_pubkey,
                voting_address,
                operator_reward,
                payout_address,
                fee_source_address,
                submit
            ]),
        )
        .await
    }

    /// `protx register`: references an existing confirmed collateral output.
    #[allow(clippy::too_many_arguments)]
    pub async fn protx_register(
        &self,
        collateral_txid: &str,
        collateral_vout: u32,
        ip_and_port: &str,
        owner_address: &str,
        operator_pubkey: &str,
        voting_address: &str,
        operator_reward: u32,
        payout_address: &str,
        fee_source_address: &str,
        submit: bool,
    ) -> Result<String, RpcError> {
        self.call(
            "protx",
            json!([
                "register",
                collateral_txid,
                collateral_vout,
                ip_and_port,
                owner_address,
                operator_pubkey,
                voting_address,
                operator_reward,
                payout_address,
                fee_source_address,
                submit
            ]),
        )
        .await
    }

    pub async fn protx_update_service(
        &self,
        pro_tx_hash: &str,
        ip_and_port: &str,
        operator_secret: &str,
        operator_payout_address: &str,
        fee_source_address: &str,
    ) -> Result<String, RpcError> {
        self.call(
            "protx",
            json!([
                "update_service",
                pro_tx_hash,
                ip_and_port,
                operator_secret,
                operator_payout_address,
                fee_source_address
            ]),
        )
        .await
    }

    pub async fn protx_info(&self, pro_tx_hash: &str) -> Result<ProTxInfo, RpcError> {
        self.call("protx", json!(["info", pro_tx_hash])).await
    }

    /// `masternodelist status`: proTxHash → status string ("ENABLED", …).
    pub async fn masternode_list_status(&self) -> Result<BTreeMap<String, String>, RpcError> {
        self.call("masternodelist", json!(["status"])).await
    }

    pub async fn mnsync_status(&self) -> Result<MnSyncStatus, RpcError> {
        self.call("mnsync", json!(["status"])).await
    }

    pub async fn mnsync_next(&self) -> Result<String, RpcError> {
        self.call("mnsync", json!(["next"])).await
    }

    // ── Quorums ───────────────────────────────────────────────────────────

    pub async fn quorum_dkg_status(&self) -> Result<DkgStatus, RpcError> {
        self.call("quorum", json!(["dkgstatus"])).await
    }

    /// `quorum list`: LLMQ name → quorum hashes, newest first.
    pub async fn quorum_list(&self) -> Result<BTreeMap<String, Vec<String>>, RpcError> {
        self.call("quorum", json!(["list"])).await
    }

    /// `quorum list <count>`: restrict to the most recent `count` quorums.
    pub async fn quorum_list_recent(
        &self,
        count: u32,
    ) -> Result<BTreeMap<String, Vec<String>>, RpcError> {
        self.call("quorum", json!(["list", count])).await
    }

    pub async fn quorum_info(
        &self,
        llmq_type: u32,
        quorum_hash: &str,
        include_secret_share: bool,
    ) -> Result<QuorumInfo, RpcError> {
        self.call(
            "quorum",
            json!(["info", llmq_type, quorum_hash, include_secret_share]),
        )
        .await
    }

    /// Ask this member to contribute a signature share for `(id, msg_hash)`.
    pub async fn quorum_sign(
        &self,
        llmq_type: u32,
        request_id: &str,
        msg_hash: &str,
    ) -> Result<bool, RpcError> {
        self.call("quorum", json!(["sign", llmq_type, request_id, msg_hash]))
            .await
    }

    pub async fn quorum_get_recovered_sig(
        &self,
        llmq_type: u32,
        request_id: &str,
        msg_hash: &str,
    ) -> Result<RecoveredSig, RpcError> {
        self.call(
            "quorum",
            json!(["getrecsig", llmq_type, request_id, msg_hash]),
        )
        .await
    }

    // ── Sporks ────────────────────────────────────────────────────────────

    /// Spork name → activation value (height or disable sentinel).
    pub async fn spork_show(&self) -> Result<BTreeMap<String, i64>, RpcError> {
        self.call("spork", json!(["show"])).await
    }

    /// Legacy setter form: `spork <name> <value>`. Only works on the node
    /// holding the spork key.
    pub async fn spork_set(&self, name: &str, value: i64) -> Result<String, RpcError> {
        self.call("spork", json!([name, value])).await
    }

    /// Spork name → whether it is currently active.
    pub async fn spork_active(&self) -> Result<BTreeMap<String, bool>, RpcError> {
        self.call("spork", json!(["active"])).await
    }

    /// Sign and broadcast a new spork value. Only works on the node holding
    /// the spork key.
    pub async fn spork_update(&self, name: &str, value: i64) -> Result<String, RpcError> {
        self.call("sporkupdate", json!([name, value])).await
    }

    // ── Tokens ────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn configure_management_token(
        &self,
        ticker: &str,
        name: &str,
        decimals: &str,
        url: &str,
        document_hash: &str,
        bls_pubkey: &str,
        sticky_melt: bool,
        confirm: bool,
    ) -> Result<ManagementTokenResult, RpcError> {
        self.call(
            "configuremanagementtoken",
            json!([
                ticker,
                name,
                decimals,
                url,
                document_hash,
                bls_pubkey,
                sticky_melt.to_string(),
                confirm.to_string()
            ]),
        )
        .await
    }

    pub async fn mint_token(
        &self,
        group_id: &str,
        address: &str,
        amount: u64,
    ) -> Result<String, RpcError> {
        self.call("minttoken", json!([group_id, address, amount.to_string()]))
            .await
    }

    pub async fn send_token(
        &self,
        group_id: &str,
        address: &str,
        amount: u64,
    ) -> Result<String, RpcError> {
        self.call("sendtoken", json!([group_id, address, amount]))
            .await
    }

    pub async fn get_subgroup_id(
        &self,
        group_id: &str,
        subgroup: &str,
    ) -> Result<String, RpcError> {
        self.call("getsubgroupid", json!([group_id, subgroup])).await
    }
}
