use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use gxc_core::{hash_from_hex, hash_to_hex, Block, BlockHeader, BlockKind, Transaction};
use gxc_crypto::PROTOCOL_VERSION;
use gxc_ledger::{LedgerCore, LedgerError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_PARSE: i64 = -32700;
pub const ERR_INTERNAL: i64 = -32603;
pub const ERR_INVALID_PARAMETER: i64 = -8;
pub const ERR_VERIFY_REJECTED: i64 = -25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub addr: String,
    pub version: u32,
    pub connected_at: u64,
}

/// Connected-peer registry, populated by the embedding node process.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<Vec<PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: PeerInfo) {
        self.peers.write().push(peer);
    }

    pub fn remove(&self, id: &str) {
        self.peers.write().retain(|p| p.id != id);
    }

    pub fn list(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }

    pub fn count(&self) -> usize {
        self.peers.read().len()
    }
}

#[derive(Clone)]
pub struct RpcState {
    pub ledger: Arc<LedgerCore>,
    pub peers: Arc<PeerRegistry>,
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMETER, message)
    }
}

impl From<LedgerError> for RpcError {
    fn from(err: LedgerError) -> Self {
        RpcError::new(ERR_VERIFY_REJECTED, err.to_string())
    }
}

pub async fn serve(state: RpcState, bind: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    info!("JSON-RPC listening on {bind}");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/", post(rpc_entry))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn rpc_entry(State(state): State<RpcState>, body: String) -> Json<Value> {
    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => return Json(error_envelope(Value::Null, ERR_PARSE, "parse error")),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return Json(error_envelope(id, ERR_INVALID_REQUEST, "missing method"));
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    match dispatch(&state, method, &params) {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(err) => {
            warn!(method, code = err.code, msg = %err.message, "rpc error");
            Json(error_envelope(id, err.code, &err.message))
        }
    }
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn param(params: &Value, index: usize, name: &str) -> Option<Value> {
    match params {
        Value::Array(items) => items.get(index).cloned(),
        Value::Object(map) => map.get(name).cloned(),
        _ => None,
    }
}

fn string_param(params: &Value, index: usize, name: &str) -> Result<String, RpcError> {
    param(params, index, name)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| RpcError::invalid_param(format!("missing parameter: {name}")))
}

fn hash_param(params: &Value, index: usize, name: &str) -> Result<gxc_core::Hash32, RpcError> {
    let raw = string_param(params, index, name)?;
    hash_from_hex(&raw).map_err(|_| RpcError::invalid_param(format!("bad hash: {name}")))
}

/// Core JSON-RPC method table.
fn dispatch(state: &RpcState, method: &str, params: &Value) -> Result<Value, RpcError> {
    let ledger = &state.ledger;
    match method {
        "getblockchaininfo" => {
            let info = ledger.chain_info();
            Ok(json!({
                "chain": info.chain,
                "blocks": info.blocks,
                "bestblockhash": info.best_block_hash,
                "difficulty": info.difficulty,
                "chainwork": info.chain_work,
                "totalissued": info.total_issued,
                "totalburned": info.total_burned,
                "lockedstake": info.locked_stake,
                "mempool": info.mempool_size,
                "protocolversion": PROTOCOL_VERSION,
            }))
        }
        "getblockcount" => Ok(json!(ledger.height())),
        "getbestblockhash" => Ok(json!(hash_to_hex(&ledger.tip_hash()))),
        "getblockhash" => {
            let height = param(params, 0, "height")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| RpcError::invalid_param("missing parameter: height"))?;
            let block = ledger
                .block_by_height(height as u32)
                .ok_or_else(|| RpcError::invalid_param("block height out of range"))?;
            Ok(json!(hash_to_hex(&block.hash)))
        }
        "getblock" => {
            let selector = param(params, 0, "hash")
                .ok_or_else(|| RpcError::invalid_param("missing parameter: hash"))?;
            let verbosity = param(params, 1, "verbosity").and_then(|v| v.as_u64()).unwrap_or(1);
            let block = match &selector {
                Value::Number(n) => n.as_u64().and_then(|h| ledger.block_by_height(h as u32)),
                Value::String(s) => hash_from_hex(s)
                    .ok()
                    .and_then(|h| ledger.block_by_hash(&h))
                    .or_else(|| s.parse::<u32>().ok().and_then(|h| ledger.block_by_height(h))),
                _ => None,
            }
            .ok_or_else(|| RpcError::invalid_param("block not found"))?;
            if verbosity == 0 {
                let bytes = serde_json::to_vec(&block).map_err(|e| RpcError::new(ERR_INTERNAL, e.to_string()))?;
                Ok(json!(hex::encode(bytes)))
            } else {
                Ok(block_to_json(&block))
            }
        }
        "getrawtransaction" | "gettransaction" => {
            let hash = hash_param(params, 0, "txid")?;
            let tx = ledger
                .transaction(&hash)
                .ok_or_else(|| RpcError::invalid_param("transaction not found"))?;
            let mut out = tx_to_json(&tx);
            if let Some(height) = ledger.transaction_height(&hash) {
                out["blockheight"] = json!(height);
                out["confirmations"] = json!(ledger.height().saturating_sub(height) + 1);
            }
            out["taint"] = json!(ledger.taint_score(&hash));
            Ok(out)
        }
        "sendrawtransaction" => {
            let raw = param(params, 0, "hexstring")
                .ok_or_else(|| RpcError::invalid_param("missing parameter: hexstring"))?;
            let tx = parse_transaction(&raw)?;
            let hash = ledger.submit_transaction(tx)?;
            Ok(json!(hash_to_hex(&hash)))
        }
        "listtransactions" => {
            let address = string_param(params, 0, "address")?;
            let count = param(params, 1, "count").and_then(|v| v.as_u64()).unwrap_or(10);
            let hashes = ledger.transaction_chain(&address, count as usize);
            Ok(json!(hashes.iter().map(hash_to_hex).collect::<Vec<_>>()))
        }
        "getbalance" => {
            let address = string_param(params, 0, "address")?;
            Ok(json!(ledger.balance(&address)))
        }
        "listunspent" => {
            let address = string_param(params, 0, "address")?;
            let utxos: Vec<Value> = ledger
                .utxos_of(&address)
                .into_iter()
                .map(|(key, entry)| {
                    json!({
                        "txid": hash_to_hex(&key.tx_hash),
                        "vout": key.index,
                        "address": entry.output.address,
                        "amount": entry.output.amount,
                        "height": entry.height,
                        "coinbase": entry.coinbase,
                    })
                })
                .collect();
            Ok(json!(utxos))
        }
        "getmininginfo" => {
            let info = ledger.chain_info();
            Ok(json!({
                "blocks": info.blocks,
                "difficulty": info.difficulty,
                "mempoolsize": info.mempool_size,
                "chain": info.chain,
            }))
        }
        "getblocktemplate" => {
            let miner = string_param(params, 0, "miner").unwrap_or_default();
            let template = ledger.block_template(&miner);
            serde_json::to_value(&template).map_err(|e| RpcError::new(ERR_INTERNAL, e.to_string()))
        }
        "submitblock" => {
            let raw = param(params, 0, "block")
                .ok_or_else(|| RpcError::invalid_param("missing parameter: block"))?;
            let block = parse_submitted_block(state, &raw)?;
            let hash = ledger.submit_block(block)?;
            Ok(json!(hash_to_hex(&hash)))
        }
        "getvalidators" => {
            let validators: Vec<Value> = ledger
                .validators()
                .into_iter()
                .map(|v| {
                    json!({
                        "address": v.address,
                        "stake": v.amount,
                        "durationdays": v.duration_days,
                        "weightedstake": v.weighted_stake(),
                        "active": v.active,
                    })
                })
                .collect();
            Ok(json!(validators))
        }
        "getvalidatorinfo" => {
            let address = string_param(params, 0, "address")?;
            let record = ledger
                .validator(&address)
                .ok_or_else(|| RpcError::invalid_param("validator not found"))?;
            Ok(json!({
                "address": record.address,
                "stake": record.amount,
                "stakedatheight": record.staked_at_height,
                "durationdays": record.duration_days,
                "weightedstake": record.weighted_stake(),
                "active": record.active,
                "eligible": record.is_eligible(),
            }))
        }
        "getstakinginfo" => {
            let info = ledger.staking_info();
            serde_json::to_value(&info).map_err(|e| RpcError::new(ERR_INTERNAL, e.to_string()))
        }
        "tracetransaction" => {
            let hash = hash_param(params, 0, "txid")?;
            let paths: Vec<Value> = ledger
                .trace_taint(&hash, 10)
                .into_iter()
                .map(|p| {
                    json!({
                        "transactions": p.transactions.iter().map(hash_to_hex).collect::<Vec<_>>(),
                        "addresses": p.addresses,
                        "taintscores": p.taint_scores,
                        "finaltaint": p.final_taint,
                        "hops": p.hops,
                    })
                })
                .collect();
            Ok(json!({
                "taint": ledger.taint_score(&hash),
                "paths": paths,
            }))
        }
        "verifytransactionlineage" => {
            let hash = hash_param(params, 0, "txid")?;
            Ok(json!(ledger.verify_lineage(&hash)))
        }
        "gettransactionchain" => {
            let address = string_param(params, 0, "address")?;
            let depth = param(params, 1, "depth").and_then(|v| v.as_u64()).unwrap_or(20);
            let lineage = ledger.transaction_chain(&address, depth as usize);
            Ok(json!(lineage.iter().map(hash_to_hex).collect::<Vec<_>>()))
        }
        "getpeerinfo" => {
            serde_json::to_value(state.peers.list()).map_err(|e| RpcError::new(ERR_INTERNAL, e.to_string()))
        }
        "getconnectioncount" => Ok(json!(state.peers.count())),
        _ => Err(RpcError::new(ERR_METHOD_NOT_FOUND, format!("unknown method: {method}"))),
    }
}

fn tx_to_json(tx: &Transaction) -> Value {
    let mut value = serde_json::to_value(tx).unwrap_or(Value::Null);
    value["txid"] = json!(hash_to_hex(&tx.hash));
    value
}

fn block_to_json(block: &Block) -> Value {
    json!({
        "hash": hash_to_hex(&block.hash),
        "height": block.header.height,
        "previousblockhash": hash_to_hex(&block.header.prev_hash),
        "merkleroot": hash_to_hex(&block.header.merkle_root),
        "time": block.header.timestamp,
        "nonce": block.header.nonce,
        "difficulty": block.header.difficulty,
        "kind": block.header.kind,
        "miner": block.header.miner,
        "reward": block.header.reward,
        "tx": block.transactions.iter().map(|t| hash_to_hex(&t.hash)).collect::<Vec<_>>(),
    })
}

/// Accepts a transaction as a JSON object, a JSON-encoded string, or the
/// hex of its JSON bytes.
fn parse_transaction(raw: &Value) -> Result<Transaction, RpcError> {
    let value = match raw {
        Value::String(s) => {
            if let Ok(bytes) = hex::decode(s) {
                serde_json::from_slice(&bytes)
                    .map_err(|_| RpcError::invalid_param("undecodable transaction"))?
            } else {
                serde_json::from_str(s).map_err(|_| RpcError::invalid_param("undecodable transaction"))?
            }
        }
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|_| RpcError::invalid_param("malformed transaction"))
}

/// `submitblock` tolerates the legacy field aliases and a JSON-stringified
/// payload; a missing coinbase is synthesized from the current template and
/// the merkle root is recomputed server-side.
fn parse_submitted_block(state: &RpcState, raw: &Value) -> Result<Block, RpcError> {
    let value: Value = match raw {
        Value::String(s) => {
            serde_json::from_str(s).map_err(|_| RpcError::invalid_param("undecodable block"))?
        }
        other => other.clone(),
    };
    // Canonical shape first.
    if let Ok(block) = serde_json::from_value::<Block>(value.clone()) {
        return Ok(block);
    }
    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::invalid_param("block must be an object"))?;

    let pick = |names: &[&str]| -> Option<Value> {
        names.iter().find_map(|n| obj.get(*n).cloned())
    };
    let height = pick(&["height", "blockNumber"])
        .and_then(|v| v.as_u64())
        .ok_or_else(|| RpcError::invalid_param("missing height"))? as u32;
    let prev_hash = pick(&["previousblockhash", "prevHash"])
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| hash_from_hex(&s).ok())
        .ok_or_else(|| RpcError::invalid_param("missing previous hash"))?;
    let nonce = pick(&["nonce"]).and_then(|v| v.as_u64()).unwrap_or(0);
    let miner = pick(&["miner", "miner_address"])
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| RpcError::invalid_param("missing miner"))?;
    let timestamp = pick(&["timestamp", "time", "curtime"])
        .and_then(|v| v.as_u64())
        .unwrap_or_else(gxc_core::now_ts);
    let difficulty = pick(&["difficulty"])
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| state.ledger.difficulty());
    let submitted_merkle = pick(&["merkleRoot", "merkleroot"])
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| hash_from_hex(&s).ok());

    let mut transactions: Vec<Transaction> = match pick(&["transactions"]) {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| parse_transaction(&item))
            .collect::<Result<_, _>>()?,
        _ => Vec::new(),
    };
    if transactions.first().map(|tx| !tx.is_coinbase()).unwrap_or(true) {
        let template = state.ledger.block_template(&miner);
        transactions.insert(0, template.coinbase);
    }

    let header = BlockHeader {
        height,
        prev_hash,
        merkle_root: gxc_core::ZERO_HASH,
        timestamp,
        nonce,
        difficulty,
        kind: BlockKind::PowSha256,
        miner,
        reward: transactions[0].total_output(),
        validator_signature: None,
        mix_hash: None,
    };
    let block = Block::new(header, transactions);
    if let Some(expected) = submitted_merkle {
        if expected != block.header.merkle_root {
            return Err(RpcError::invalid_param("merkle root mismatch"));
        }
    }
    if let Some(hash) = pick(&["hash", "blockHash"])
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| hash_from_hex(&s).ok())
    {
        if hash != block.hash {
            return Err(RpcError::invalid_param("block hash mismatch"));
        }
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gxc_crypto::generate_keypair;
    use gxc_ledger::core::mine_sha256;
    use gxc_ledger::LedgerConfig;

    fn state() -> RpcState {
        let admin = generate_keypair();
        RpcState {
            ledger: Arc::new(LedgerCore::new(LedgerConfig::testnet(admin.public_key))),
            peers: Arc::new(PeerRegistry::new()),
        }
    }

    #[test]
    fn basic_queries() {
        let state = state();
        let count = dispatch(&state, "getblockcount", &Value::Null).unwrap();
        assert_eq!(count, json!(0));
        let info = dispatch(&state, "getblockchaininfo", &Value::Null).unwrap();
        assert_eq!(info["chain"], json!("test"));
        assert_eq!(info["protocolversion"], json!(70015));
        let best = dispatch(&state, "getbestblockhash", &Value::Null).unwrap();
        assert_eq!(best.as_str().unwrap().len(), 64);
    }

    #[test]
    fn unknown_method_and_bad_params() {
        let state = state();
        let err = dispatch(&state, "nosuchmethod", &Value::Null).unwrap_err();
        assert_eq!(err.code, ERR_METHOD_NOT_FOUND);
        let err = dispatch(&state, "getbalance", &json!([])).unwrap_err();
        assert_eq!(err.code, ERR_INVALID_PARAMETER);
        let err = dispatch(&state, "getblockhash", &json!([99])).unwrap_err();
        assert_eq!(err.code, ERR_INVALID_PARAMETER);
    }

    #[test]
    fn template_mine_submit_cycle() {
        let state = state();
        let miner = "tGXC0123456789abcdef0123456789abcdef01";
        let template = dispatch(&state, "getblocktemplate", &json!([miner])).unwrap();
        assert_eq!(template["height"], json!(1));

        let mut block = state
            .ledger
            .propose_block(miner, BlockKind::PowSha256);
        mine_sha256(&mut block);
        let submitted = dispatch(&state, "submitblock", &json!([serde_json::to_value(&block).unwrap()])).unwrap();
        assert_eq!(submitted, json!(hash_to_hex(&block.hash)));
        assert_eq!(dispatch(&state, "getblockcount", &Value::Null).unwrap(), json!(1));

        let by_height = dispatch(&state, "getblock", &json!([1])).unwrap();
        assert_eq!(by_height["height"], json!(1));
        let balance = dispatch(&state, "getbalance", &json!([miner])).unwrap();
        assert_eq!(balance, json!(50.0));
    }

    #[test]
    fn rejected_submissions_use_verify_code() {
        let state = state();
        let miner = "tGXC0123456789abcdef0123456789abcdef01";
        let mut block = state.ledger.propose_block(miner, BlockKind::PowSha256);
        // Break linkage: wrong previous hash.
        block.header.prev_hash = [9u8; 32];
        mine_sha256(&mut block);
        let err = dispatch(&state, "submitblock", &json!([serde_json::to_value(&block).unwrap()]))
            .unwrap_err();
        assert_eq!(err.code, ERR_VERIFY_REJECTED);
    }

    #[test]
    fn peer_registry_surfaces() {
        let state = state();
        state.peers.add(PeerInfo {
            id: "peer-1".into(),
            addr: "127.0.0.1:18333".into(),
            version: PROTOCOL_VERSION,
            connected_at: 0,
        });
        assert_eq!(dispatch(&state, "getconnectioncount", &Value::Null).unwrap(), json!(1));
        let peers = dispatch(&state, "getpeerinfo", &Value::Null).unwrap();
        assert_eq!(peers[0]["id"], json!("peer-1"));
    }
}
