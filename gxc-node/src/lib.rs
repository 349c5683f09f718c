use anyhow::{anyhow, Context, Result};
use gxc_config::GxcConfig;
use gxc_consensus::RetargetParams;
use gxc_core::BlockKind;
use gxc_ledger::core::{mine_ethash, mine_sha256};
use gxc_ledger::{LedgerConfig, LedgerCore};
use gxc_rpc::{PeerRegistry, RpcState};
use gxc_storage::{
    load_chain, save_block, JsonFileStore, KvStore, NS_FRAUD, NS_POOL, NS_REGISTRY, NS_REVERSED,
    NS_TAINT,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Everything a running node hangs off: configuration, the ledger core,
/// the persistent store and the peer registry. Built once at startup and
/// threaded explicitly; there are no globals.
pub struct NodeContext {
    pub config: GxcConfig,
    pub ledger: Arc<LedgerCore>,
    pub store: Arc<JsonFileStore>,
    pub peers: Arc<PeerRegistry>,
}

impl NodeContext {
    /// Open the data directory, rebuild chain state from persisted blocks
    /// and restore the fraud-engine snapshots.
    pub fn bootstrap(config: GxcConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        let store = Arc::new(
            JsonFileStore::open(data_dir).context("opening the data directory")?,
        );

        let ledger = Arc::new(LedgerCore::new(ledger_config(&config)?));
        let blocks = load_chain(store.as_ref())?;
        let reversals = match store.get(NS_REVERSED, "log")? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        if !blocks.is_empty() || !reversals.is_empty() {
            info!(blocks = blocks.len(), reversals = reversals.len(), "replaying persisted chain");
            ledger
                .restore(blocks, reversals)
                .map_err(|e| anyhow!("chain replay failed: {e}"))?;
        }
        if let Some(bytes) = store.get(NS_REGISTRY, "entries")? {
            ledger.import_registry(&String::from_utf8_lossy(&bytes));
        }
        if let Some(bytes) = store.get(NS_POOL, "state")? {
            ledger.import_pool_lines(&String::from_utf8_lossy(&bytes));
        }
        if let Some(bytes) = store.get(NS_TAINT, "snapshot")? {
            ledger.import_taint_snapshot(serde_json::from_slice(&bytes)?);
        }

        Ok(Self {
            config,
            ledger,
            store,
            peers: Arc::new(PeerRegistry::new()),
        })
    }

    /// Persist blocks beyond `from_height`, plus the registry, pool and
    /// taint snapshots.
    pub fn persist(&self, from_height: u32) -> Result<u32> {
        let tip = self.ledger.height();
        for height in (from_height + 1)..=tip {
            if let Some(block) = self.ledger.block_by_height(height) {
                save_block(self.store.as_ref(), &block)?;
            }
        }
        self.store
            .put(NS_REGISTRY, "entries", self.ledger.export_registry().as_bytes())?;
        self.store
            .put(NS_POOL, "state", self.ledger.export_pool_lines().as_bytes())?;
        self.store.put(
            NS_TAINT,
            "snapshot",
            serde_json::to_vec(&self.ledger.export_taint_snapshot())?.as_slice(),
        )?;
        self.store.put(
            NS_REVERSED,
            "log",
            serde_json::to_vec(&self.ledger.export_reversals())?.as_slice(),
        )?;
        self.store.put(
            NS_FRAUD,
            "stats",
            serde_json::to_vec(&self.ledger.fraud_stats())?.as_slice(),
        )?;
        Ok(tip)
    }

    pub fn rpc_state(&self) -> RpcState {
        RpcState {
            ledger: self.ledger.clone(),
            peers: self.peers.clone(),
        }
    }
}

fn ledger_config(config: &GxcConfig) -> Result<LedgerConfig> {
    let network = config.resolved_network();
    let admin_public_key = if config.policy.admin_public_key.is_empty() {
        Vec::new()
    } else {
        hex::decode(&config.policy.admin_public_key).context("admin_public_key must be hex")?
    };
    let mut policy = gxc_consensus::MonetaryPolicy::default();
    policy.pool_split = config.policy.pool_split;
    Ok(LedgerConfig {
        network,
        initial_difficulty: config.consensus.initial_difficulty,
        retarget: RetargetParams {
            interval: config.consensus.retarget_interval,
            block_time_target: config.consensus.block_time_target,
        },
        policy,
        admin_public_key,
        pool_address: config.policy.pool_address.clone(),
        validation_timeout: Duration::from_secs(config.consensus.validation_timeout_secs),
        max_block_txs: 2000,
    })
}

pub fn init_logging(level: &str) {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Run the node: RPC server, periodic persistence, and the internal CPU
/// miner when mining is enabled. Blocks until the RPC server exits.
pub async fn run_node(config_path: &Path) -> Result<()> {
    let config = GxcConfig::load(config_path)?;
    init_logging(&config.log_level);
    run_with_config(config).await
}

pub async fn run_with_config(config: GxcConfig) -> Result<()> {
    info!(network = %config.network.network, "starting gxc node");
    let ctx = Arc::new(NodeContext::bootstrap(config)?);

    if ctx.config.mining.enabled {
        spawn_miner(ctx.ledger.clone(), &ctx.config.mining);
    }

    // Periodic persistence.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut persisted = ctx.ledger.height();
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                match ctx.persist(persisted) {
                    Ok(tip) => persisted = tip,
                    Err(e) => error!("persistence failed: {e}"),
                }
            }
        });
    }

    let bind: SocketAddr = format!("{}:{}", ctx.config.network.rpc_bind, ctx.config.network.rpc_port)
        .parse()
        .context("bad rpc bind address")?;
    gxc_rpc::serve(ctx.rpc_state(), bind).await
}

/// Internal CPU miner over the template/submit interface, one blocking
/// task per configured thread.
pub fn spawn_miner(ledger: Arc<LedgerCore>, mining: &gxc_config::MiningConfig) {
    let kind = match mining.algorithm.as_str() {
        "ethash" => BlockKind::PowEthash,
        "sha256" => BlockKind::PowSha256,
        other => {
            warn!(algorithm = other, "algorithm not built in, mining sha256d");
            BlockKind::PowSha256
        }
    };
    let threads = mining.threads.max(1);
    for thread in 0..threads {
        let ledger = ledger.clone();
        let miner = mining.miner_address.clone();
        tokio::task::spawn_blocking(move || loop {
            let mut block = ledger.propose_block(&miner, kind);
            // Disjoint nonce ranges per thread.
            block.header.nonce = (thread as u64) << 40;
            match kind {
                BlockKind::PowEthash => mine_ethash(&mut block, ledger.ethash()),
                _ => mine_sha256(&mut block),
            }
            match ledger.submit_block(block) {
                Ok(hash) => info!(hash = %hex::encode(&hash[..8]), "mined block"),
                // Losing a race to another thread is routine.
                Err(e) => warn!("mined block rejected: {e}"),
            }
        });
    }
}
