use crate::types::{
    Address,
    Amount,
    MAX_AMOUNT,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

pub const CONFIG_ROOT: &str = ".deployments";
const CONFIG_FILE: &str = "orchestrator.json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetworkEnv {
    Local,
    Testnet,
    Mainnet,
}

impl NetworkEnv {
    pub fn dir_name(self) -> &'static str {
        match self {
            NetworkEnv::Local => "local",
            NetworkEnv::Testnet => "testnet",
            NetworkEnv::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for NetworkEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkEnv::Local => "Local",
            NetworkEnv::Testnet => "Testnet",
            NetworkEnv::Mainnet => "Mainnet",
        };
        write!(f, "{name}")
    }
}

/// How much to approve when the allowance is short.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Approve the maximum amount once so later wagers skip the approval step.
    #[default]
    Unlimited,
    /// Approve exactly the wager; every bet above the allowance pays for an approval.
    Exact,
    /// Approve a multiple of the wager.
    Multiple(u32),
}

impl ApprovalPolicy {
    pub fn approval_amount(self, needed: Amount) -> Amount {
        match self {
            ApprovalPolicy::Unlimited => MAX_AMOUNT,
            ApprovalPolicy::Exact => needed,
            ApprovalPolicy::Multiple(factor) => {
                needed.saturating_mul(Amount::from(factor.max(1)))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub gateway_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chain_id: 31337,
            gateway_url: "http://localhost:8545/".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractAddresses {
    /// The wagering contract; also the spender of the wager token.
    pub game: Address,
    pub token: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WagerConfig {
    pub min_wager: Amount,
    pub max_wager: Amount,
    pub min_choice: u32,
    pub max_choice: u32,
    /// Native value sent with `placeBet` to cover the oracle fee.
    pub bet_fee: Amount,
    pub approval_policy: ApprovalPolicy,
}

impl Default for WagerConfig {
    fn default() -> Self {
        Self {
            min_wager: 1,
            max_wager: 10_000,
            min_choice: 1,
            max_choice: 100,
            bet_fee: 0,
            approval_policy: ApprovalPolicy::Unlimited,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub history_depth: usize,
    /// How long a timed-out bet or resolve may stay unseen on the ledger
    /// before the session gives up on it.
    pub unconfirmed_grace_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 5_000,
            idle_interval_ms: 30_000,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            history_depth: 10,
            unconfirmed_grace_ms: 300_000,
        }
    }
}

impl PollingConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn unconfirmed_grace(&self) -> Duration {
        Duration::from_millis(self.unconfirmed_grace_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stuck_threshold_ms: u64,
    pub cooldown_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_ms: 300_000,
            cooldown_ms: 5_000,
            check_interval_ms: 1_000,
        }
    }
}

impl RecoveryConfig {
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub gas_multiplier_percent: u64,
    pub fallback_gas_limit: u64,
    pub timeout_ms: u64,
    pub resolve_cooldown_ms: u64,
    pub auto_resolve: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            gas_multiplier_percent: 120,
            fallback_gas_limit: 500_000,
            timeout_ms: 120_000,
            resolve_cooldown_ms: 5_000,
            auto_resolve: true,
        }
    }
}

impl TransactionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resolve_cooldown(&self) -> Duration {
        Duration::from_millis(self.resolve_cooldown_ms)
    }
}

/// Everything the orchestrator treats as immutable for a session's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub network: NetworkConfig,
    pub contracts: ContractAddresses,
    pub wager: WagerConfig,
    pub polling: PollingConfig,
    pub recovery: RecoveryConfig,
    pub transactions: TransactionConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.contracts.game == Address::ZERO {
            return Err(eyre!("contracts.game must be set"));
        }
        if self.contracts.token == Address::ZERO {
            return Err(eyre!("contracts.token must be set"));
        }
        if self.wager.min_wager == 0 || self.wager.min_wager > self.wager.max_wager {
            return Err(eyre!(
                "wager bounds are invalid: min {} max {}",
                self.wager.min_wager,
                self.wager.max_wager
            ));
        }
        if self.wager.min_choice > self.wager.max_choice {
            return Err(eyre!(
                "choice bounds are invalid: min {} max {}",
                self.wager.min_choice,
                self.wager.max_choice
            ));
        }
        if self.polling.active_interval_ms == 0 || self.polling.idle_interval_ms == 0 {
            return Err(eyre!("polling intervals must be non-zero"));
        }
        if self.polling.max_attempts == 0 {
            return Err(eyre!("polling.max_attempts must be at least 1"));
        }
        if self.recovery.check_interval_ms == 0 {
            return Err(eyre!("recovery.check_interval_ms must be non-zero"));
        }
        if self.transactions.gas_multiplier_percent < 100 {
            return Err(eyre!(
                "transactions.gas_multiplier_percent must be at least 100, got {}",
                self.transactions.gas_multiplier_percent
            ));
        }
        if self.transactions.timeout_ms == 0 {
            return Err(eyre!("transactions.timeout_ms must be non-zero"));
        }
        if self.polling.unconfirmed_grace_ms < self.transactions.timeout_ms {
            return Err(eyre!(
                "polling.unconfirmed_grace_ms ({}) must not be shorter than transactions.timeout_ms ({})",
                self.polling.unconfirmed_grace_ms,
                self.transactions.timeout_ms
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store under `.deployments/<env>/orchestrator.json` relative to the working directory.
    pub fn new(env: NetworkEnv) -> Self {
        let path = Path::new(CONFIG_ROOT).join(env.dir_name()).join(CONFIG_FILE);
        Self { path }
    }

    /// Store at an explicit path; `~` is expanded.
    pub fn at(raw: &str) -> Self {
        let expanded = shellexpand::tilde(raw);
        Self {
            path: PathBuf::from(expanded.into_owned()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<OrchestratorConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).wrap_err_with(|| {
            format!("Failed to read orchestrator config {}", self.path.display())
        })?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let config: OrchestratorConfig = serde_json::from_slice(&data)
            .wrap_err_with(|| {
                format!("Failed to parse orchestrator config {}", self.path.display())
            })?;
        Ok(Some(config))
    }

    pub fn save(&self, config: &OrchestratorConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).wrap_err_with(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let json = serde_json::to_vec_pretty(config)
            .wrap_err("Failed to serialize orchestrator config")?;
        fs::write(&self.path, json).wrap_err("Failed to write orchestrator config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::str::FromStr;

    fn valid_config() -> OrchestratorConfig {
        OrchestratorConfig {
            contracts: ContractAddresses {
                game: Address::from_str("0x1000000000000000000000000000000000000001")
                    .unwrap(),
                token: Address::from_str("0x2000000000000000000000000000000000000002")
                    .unwrap(),
            },
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn load__partial_file_uses_defaults_for_missing_sections() {
        // given
        let dir = tempdir::TempDir::new("config").unwrap();
        let path = dir.path().join("orchestrator.json");
        fs::write(
            &path,
            r#"{
                "network": { "chain_id": 10 },
                "contracts": {
                    "game": "0x1000000000000000000000000000000000000001",
                    "token": "0x2000000000000000000000000000000000000002"
                },
                "recovery": { "cooldown_ms": 2500 }
            }"#,
        )
        .unwrap();
        let store = ConfigStore::at(path.to_str().unwrap());

        // when
        let config = store.load().unwrap().unwrap();

        // then
        assert_eq!(config.network.chain_id, 10);
        assert_eq!(config.network.gateway_url, NetworkConfig::default().gateway_url);
        assert_eq!(config.recovery.cooldown(), Duration::from_millis(2500));
        assert_eq!(config.polling, PollingConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn load__missing_file_is_none() {
        let dir = tempdir::TempDir::new("config").unwrap();
        let store = ConfigStore::at(dir.path().join("absent.json").to_str().unwrap());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save__round_trips_through_load() {
        // given
        let dir = tempdir::TempDir::new("config").unwrap();
        let store = ConfigStore::at(dir.path().join("nested/orchestrator.json").to_str().unwrap());
        let mut config = valid_config();
        config.wager.approval_policy = ApprovalPolicy::Multiple(4);

        // when
        store.save(&config).unwrap();

        // then
        assert_eq!(store.load().unwrap(), Some(config));
    }

    #[test]
    fn validate__rejects_inverted_wager_bounds() {
        let mut config = valid_config();
        config.wager.min_wager = 100;
        config.wager.max_wager = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate__rejects_gas_multiplier_below_one() {
        let mut config = valid_config();
        config.transactions.gas_multiplier_percent = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate__rejects_grace_shorter_than_transaction_timeout() {
        let mut config = valid_config();
        config.polling.unconfirmed_grace_ms = 1_000;
        config.transactions.timeout_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn approval_amount__follows_policy() {
        assert_eq!(ApprovalPolicy::Unlimited.approval_amount(50), MAX_AMOUNT);
        assert_eq!(ApprovalPolicy::Exact.approval_amount(50), 50);
        assert_eq!(ApprovalPolicy::Multiple(3).approval_amount(50), 150);
        assert_eq!(ApprovalPolicy::Multiple(0).approval_amount(50), 50);
    }
}
