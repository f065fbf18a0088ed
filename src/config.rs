use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

/// Protocol constants. Immutable after boot; every component receives a
/// shared reference and never mutates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConstants {
    /// Unix milliseconds of the chain epoch; all block timestamps count
    /// seconds from this instant.
    pub epoch_time_ms: u64,
    /// Seconds per forging slot.
    pub block_time: u64,
    pub active_delegates: u32,
    pub max_payload_length: usize,
    pub max_transactions_per_block: usize,
    pub max_shared_transactions: usize,
    /// Seconds without an accepted block before the chain counts as stale.
    pub block_receipt_timeout: u64,
    /// Seconds between pool expiry sweeps.
    pub expiry_interval: u64,
    /// Slots of tolerance when matching a received block to its slot.
    pub block_slot_window: u64,
    pub min_broadhash_consensus: f64,
    pub max_peers: usize,
    pub rewards: RewardSchedule,
    pub total_amount: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RewardSchedule {
    /// Height at which rewards start.
    pub offset: u64,
    /// Blocks between milestone steps.
    pub distance: u64,
    pub milestones: Vec<u64>,
}

impl Default for ChainConstants {
    fn default() -> Self {
        Self {
            epoch_time_ms: 1_464_109_200_000,
            block_time: 10,
            active_delegates: 101,
            max_payload_length: 1024 * 1024,
            max_transactions_per_block: 25,
            max_shared_transactions: 100,
            block_receipt_timeout: 20,
            expiry_interval: 30,
            block_slot_window: 5,
            min_broadhash_consensus: 51.0,
            max_peers: 100,
            rewards: RewardSchedule {
                offset: 2_160,
                distance: 3_000_000,
                milestones: vec![500_000_000, 400_000_000, 300_000_000, 200_000_000, 100_000_000],
            },
            total_amount: 10_000_000_000_000_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadingConfig {
    pub load_per_iteration: usize,
    /// When set, replay from genesis up to this round and exit.
    pub rebuild_up_to_round: Option<u64>,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            load_per_iteration: 1_000,
            rebuild_up_to_round: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncingConfig {
    pub active: bool,
}

impl Default for SyncingConfig {
    fn default() -> Self {
        Self { active: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastsConfig {
    /// Disabling turns off outbound batching and inbound relay handling.
    pub active: bool,
    pub broadcast_interval_ms: u64,
    pub release_limit: usize,
    pub broadcast_limit: usize,
    pub relay_lifetime: u32,
}

impl Default for BroadcastsConfig {
    fn default() -> Self {
        Self {
            active: true,
            broadcast_interval_ms: 5_000,
            release_limit: 25,
            broadcast_limit: 25,
            relay_lifetime: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForgingDelegate {
    pub public_key: String,
    /// Hex keystream ciphertext produced by `crypto::encrypt_secret`.
    pub encrypted_secret: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ForgingConfig {
    /// Forge even when broadhash consensus is poor.
    pub force: bool,
    pub delegates: Vec<ForgingDelegate>,
    pub default_password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionsConfig {
    pub max_transactions_per_queue: usize,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            max_transactions_per_queue: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: String,
    pub public_key: Option<String>,
    pub balance: u128,
    pub is_delegate: bool,
    pub username: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub api_listen: SocketAddr,
    pub module_alias: String,
    #[serde(default)]
    pub constants: ChainConstants,
    #[serde(default)]
    pub loading: LoadingConfig,
    #[serde(default)]
    pub syncing: SyncingConfig,
    #[serde(default)]
    pub broadcasts: BroadcastsConfig,
    #[serde(default)]
    pub forging: ForgingConfig,
    #[serde(default)]
    pub transactions: TransactionsConfig,
    #[serde(default)]
    pub genesis_accounts: Vec<GenesisAccount>,
}

impl ChainConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.constants.active_delegates == 0 {
            return Err(ChainError::Config("active_delegates must be positive".into()));
        }
        if self.constants.block_time == 0 {
            return Err(ChainError::Config("block_time must be positive".into()));
        }
        if self.constants.max_transactions_per_block == 0 {
            return Err(ChainError::Config(
                "max_transactions_per_block must be positive".into(),
            ));
        }
        if self.constants.rewards.milestones.is_empty() {
            return Err(ChainError::Config("reward milestones must not be empty".into()));
        }
        if self.forging.delegates.iter().any(|d| d.public_key.is_empty()) {
            return Err(ChainError::Config(
                "forging delegate entries require a public key".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            api_listen: "127.0.0.1:7080".parse().expect("valid socket addr"),
            module_alias: "chain".to_string(),
            constants: ChainConstants::default(),
            loading: LoadingConfig::default(),
            syncing: SyncingConfig::default(),
            broadcasts: BroadcastsConfig::default(),
            forging: ForgingConfig::default(),
            transactions: TransactionsConfig::default(),
            genesis_accounts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let config = ChainConfig::default();
        config.save(&path).expect("save config");
        let loaded = ChainConfig::load(&path).expect("load config");
        assert_eq!(loaded.constants.active_delegates, 101);
        assert_eq!(loaded.constants.max_transactions_per_block, 25);
        assert!(loaded.syncing.active);
    }

    #[test]
    fn validate_rejects_zero_block_time() {
        let mut config = ChainConfig::default();
        config.constants.block_time = 0;
        assert!(config.validate().is_err());
    }
}
