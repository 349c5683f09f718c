use anyhow::Result;
use clap::{Parser, Subcommand};
use gxc_config::GxcConfig;
use gxc_crypto::Network;
use gxc_node::{init_logging, run_with_config};
use gxc_wallet::WalletStore;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "gxc", version, about = "GXC ledger-consensus node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        #[arg(long, default_value = "config/gxc.toml")]
        config: PathBuf,
        #[arg(long)]
        testnet: bool,
        #[arg(long)]
        regtest: bool,
    },
    /// Start the node
    Node {
        #[arg(long, default_value = "config/gxc.toml")]
        config: PathBuf,
        #[arg(long, conflicts_with = "regtest")]
        testnet: bool,
        #[arg(long)]
        regtest: bool,
        /// Keep running in the background (the process stays in the
        /// foreground; supervision is left to the host system)
        #[arg(long)]
        daemon: bool,
    },
    /// Start a mining node
    Miner {
        #[arg(long)]
        address: String,
        #[arg(long, default_value = "sha256", value_parser = ["sha256", "ethash", "gxhash"])]
        algorithm: String,
        #[arg(long, default_value_t = 1)]
        threads: u32,
        #[arg(long, default_value = "config/gxc.toml")]
        config: PathBuf,
    },
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
        #[arg(long)]
        testnet: bool,
    },
}

#[derive(Subcommand)]
enum WalletCmd {
    New {
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long)]
        password: String,
    },
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init {
            config,
            testnet,
            regtest,
        } => init_config(config, network_flag(testnet, regtest)),
        Commands::Node {
            config,
            testnet,
            regtest,
            daemon,
        } => {
            let mut cfg = load_or_default(&config, network_flag(testnet, regtest))?;
            if daemon {
                tracing::info!("daemon mode: running in the foreground under supervision");
            }
            override_network(&mut cfg, testnet, regtest);
            let rt = Runtime::new()?;
            rt.block_on(run_with_config(cfg))
        }
        Commands::Miner {
            address,
            algorithm,
            threads,
            config,
        } => {
            let mut cfg = load_or_default(&config, None)?;
            cfg.mining.enabled = true;
            cfg.mining.miner_address = address;
            cfg.mining.algorithm = algorithm;
            cfg.mining.threads = threads;
            let rt = Runtime::new()?;
            rt.block_on(run_with_config(cfg))
        }
        Commands::Wallet { cmd, testnet } => {
            let network = if testnet { Network::Testnet } else { Network::Mainnet };
            let store = WalletStore::new(wallet_dir()?, network)?;
            match cmd {
                WalletCmd::New { name, password } => {
                    let wallet = store.create(&name, &password)?;
                    println!("created wallet {} address {}", wallet.name, wallet.address);
                }
                WalletCmd::List => {
                    for wallet in store.list()? {
                        println!("{} -> {}", wallet.name, wallet.address);
                    }
                }
            }
            Ok(())
        }
    }
}

fn network_flag(testnet: bool, regtest: bool) -> Option<Network> {
    if regtest {
        Some(Network::Regtest)
    } else if testnet {
        Some(Network::Testnet)
    } else {
        None
    }
}

fn load_or_default(path: &PathBuf, network: Option<Network>) -> Result<GxcConfig> {
    let cfg = if path.exists() {
        GxcConfig::load(path)?
    } else {
        GxcConfig::for_network(network.unwrap_or(Network::Mainnet))
    };
    init_logging(&cfg.log_level);
    Ok(cfg)
}

fn override_network(cfg: &mut GxcConfig, testnet: bool, regtest: bool) {
    if let Some(network) = network_flag(testnet, regtest) {
        let preset = GxcConfig::for_network(network);
        cfg.network = preset.network;
        cfg.consensus = preset.consensus;
        cfg.policy.pool_address = preset.policy.pool_address;
    }
}

fn init_config(path: PathBuf, network: Option<Network>) -> Result<()> {
    if path.exists() {
        println!("config already exists at {}", path.display());
        return Ok(());
    }
    let cfg = GxcConfig::for_network(network.unwrap_or(Network::Mainnet));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&cfg)?)?;
    println!("wrote config to {}", path.display());
    Ok(())
}
