use anyhow::Result;
use gxc_crypto::Network;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// "main", "test" or "regtest".
    pub network: String,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub rpc_bind: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    pub initial_difficulty: f64,
    pub retarget_interval: u32,
    pub block_time_target: u64,
    pub validation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub enabled: bool,
    pub miner_address: String,
    /// "sha256", "ethash" or "gxhash".
    pub algorithm: String,
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Share of non-burned fees routed to the reversal fee pool.
    pub pool_split: f64,
    pub pool_address: String,
    /// Hex-encoded compressed key approving reversal proofs.
    pub admin_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GxcConfig {
    pub data_dir: String,
    pub log_level: String,
    pub network: NetworkConfig,
    pub consensus: ConsensusSection,
    pub mining: MiningConfig,
    pub policy: PolicyConfig,
}

impl GxcConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("GXC").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        Self::for_network(Network::Mainnet)
    }

    pub fn for_network(network: Network) -> Self {
        let name = match network {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        };
        Self {
            data_dir: format!(".gxc/{name}"),
            log_level: "info".into(),
            network: NetworkConfig {
                network: name.into(),
                p2p_port: network.p2p_port(),
                rpc_port: network.rpc_port(),
                rpc_bind: "127.0.0.1".into(),
                max_connections: 64,
            },
            consensus: ConsensusSection {
                initial_difficulty: match network {
                    Network::Mainnet => 4.0,
                    _ => 0.1,
                },
                retarget_interval: match network {
                    Network::Mainnet => 2016,
                    _ => 10,
                },
                block_time_target: match network {
                    Network::Mainnet => 600,
                    _ => 10,
                },
                validation_timeout_secs: 5,
            },
            mining: MiningConfig {
                enabled: false,
                miner_address: String::new(),
                algorithm: "sha256".into(),
                threads: 1,
            },
            policy: PolicyConfig {
                pool_split: 0.15,
                pool_address: match network {
                    Network::Mainnet => "GXC00000000000000000000000000000feepool".into(),
                    _ => "tGXC0000000000000000000000000000feepool".into(),
                },
                admin_public_key: String::new(),
            },
        }
    }

    pub fn resolved_network(&self) -> Network {
        match self.network.network.as_str() {
            "test" => Network::Testnet,
            "regtest" => Network::Regtest,
            _ => Network::Mainnet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_roundtrips_through_toml() {
        let cfg = GxcConfig::example();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gxc.toml");
        std::fs::write(&path, text).unwrap();
        let back = GxcConfig::load(&path).unwrap();
        assert_eq!(back.network.network, "main");
        assert_eq!(back.network.rpc_port, 8332);
        assert_eq!(back.resolved_network(), Network::Mainnet);
    }

    #[test]
    fn testnet_preset_ports() {
        let cfg = GxcConfig::for_network(Network::Testnet);
        assert_eq!(cfg.network.p2p_port, 18333);
        assert_eq!(cfg.network.rpc_port, 18332);
        assert_eq!(cfg.consensus.retarget_interval, 10);
        assert_eq!(cfg.resolved_network(), Network::Testnet);
    }
}
