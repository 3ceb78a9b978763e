use anyhow::{bail, Context, Result};
use kalypso_attestation::bridge_family;
use kalypso_crypto::keccak256;
use kalypso_market::{MarketplaceConfig, ProverRegistryConfig};
use kalypso_staking::{NativeStakingConfig, SymbioticConfig};
use kalypso_types::{Address, TokenAmount, WEIGHT_SCALE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub marketplace: MarketplaceSettings,
    pub staking: StakingSettings,
    pub native: NativeSettings,
    pub symbiotic: SymbioticSettings,
    pub attestation: AttestationSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub name: String,
    /// Seconds per simulated block.
    pub block_time_secs: u64,
    pub genesis_timestamp: u64,
}

/// Amounts are base units. Rates are scaled by 1e18.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceSettings {
    pub payment_token: String,
    pub treasury: String,
    pub market_creation_cost: u64,
    pub cost_per_input_byte: u64,
    pub staking_fee_share: u64,
    pub parallel_requests_upper_limit: u64,
    pub reduction_block_gap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingSettings {
    pub stake_token: String,
    pub stake_token_weight: u64,
    pub native_pool_weight: u64,
    pub symbiotic_pool_weight: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeSettings {
    pub withdrawal_duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbioticSettings {
    pub submission_cooldown: u64,
    pub base_transmitter_commission_rate: u64,
    pub bridge_family: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationSettings {
    pub max_age_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_output: Option<PathBuf>,
    #[serde(default)]
    pub module_filters: BTreeMap<String, String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: "kalypso-local".to_string(),
            block_time_secs: 12,
            genesis_timestamp: 1_700_000_000,
        }
    }
}

impl Default for MarketplaceSettings {
    fn default() -> Self {
        Self {
            payment_token: Address::repeat_byte(0xc0).to_hex(),
            treasury: Address::repeat_byte(0x7e).to_hex(),
            market_creation_cost: 1_000,
            cost_per_input_byte: 1,
            staking_fee_share: (WEIGHT_SCALE / 10) as u64,
            parallel_requests_upper_limit: 100,
            reduction_block_gap: 100,
        }
    }
}

impl Default for StakingSettings {
    fn default() -> Self {
        Self {
            stake_token: Address::repeat_byte(0xd0).to_hex(),
            stake_token_weight: WEIGHT_SCALE as u64,
            native_pool_weight: 1,
            symbiotic_pool_weight: 1,
        }
    }
}

impl Default for NativeSettings {
    fn default() -> Self {
        Self {
            withdrawal_duration: 2 * 60 * 60,
        }
    }
}

impl Default for SymbioticSettings {
    fn default() -> Self {
        Self {
            submission_cooldown: 3_600,
            base_transmitter_commission_rate: (WEIGHT_SCALE / 10) as u64,
            bridge_family: "symbiotic".to_string(),
        }
    }
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self { max_age_ms: 300_000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: BTreeMap::new(),
        }
    }
}

/// Deterministic account for a named system component.
pub fn system_address(label: &str) -> Address {
    Address::from_digest(keccak256(format!("kalypso/{}", label).as_bytes()).as_bytes())
}

fn parse_address(field: &str, value: &str) -> Result<Address> {
    let address = Address::from_hex(value).with_context(|| format!("{} is not a valid address: {}", field, value))?;
    if address.is_zero() {
        bail!("{} must not be the zero address", field);
    }
    Ok(address)
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("KALYPSO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("KALYPSO_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(cooldown) = env::var("KALYPSO_SUBMISSION_COOLDOWN") {
            if let Ok(secs) = cooldown.parse() {
                self.symbiotic.submission_cooldown = secs;
            }
        }
        if let Ok(duration) = env::var("KALYPSO_WITHDRAWAL_DURATION") {
            if let Ok(secs) = duration.parse() {
                self.native.withdrawal_duration = secs;
            }
        }
        if let Ok(limit) = env::var("KALYPSO_PARALLEL_REQUESTS_LIMIT") {
            if let Ok(limit) = limit.parse() {
                self.marketplace.parallel_requests_upper_limit = limit;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.payment_token()?;
        self.treasury()?;
        self.stake_token()?;

        let scale = WEIGHT_SCALE as u64;
        if self.marketplace.staking_fee_share > scale {
            bail!("marketplace.staking_fee_share exceeds 1e18");
        }
        if self.symbiotic.base_transmitter_commission_rate > scale {
            bail!("symbiotic.base_transmitter_commission_rate exceeds 1e18");
        }
        if self.marketplace.parallel_requests_upper_limit == 0 {
            bail!("marketplace.parallel_requests_upper_limit must be positive");
        }
        if self.staking.stake_token_weight == 0 {
            bail!("staking.stake_token_weight must be positive");
        }
        if self.staking.native_pool_weight == 0 && self.staking.symbiotic_pool_weight == 0 {
            bail!("at least one staking pool needs a non-zero weight");
        }
        if self.node.block_time_secs == 0 {
            bail!("node.block_time_secs must be positive");
        }
        if self.attestation.max_age_ms == 0 {
            bail!("attestation.max_age_ms must be positive");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            bail!("unknown logging.format {:?}", self.logging.format);
        }
        Ok(())
    }

    pub fn payment_token(&self) -> Result<Address> {
        parse_address("marketplace.payment_token", &self.marketplace.payment_token)
    }

    pub fn treasury(&self) -> Result<Address> {
        parse_address("marketplace.treasury", &self.marketplace.treasury)
    }

    pub fn stake_token(&self) -> Result<Address> {
        parse_address("staking.stake_token", &self.staking.stake_token)
    }

    pub fn marketplace_config(&self) -> Result<MarketplaceConfig> {
        Ok(MarketplaceConfig {
            address: system_address("marketplace"),
            payment_token: self.payment_token()?,
            treasury: self.treasury()?,
            market_creation_cost: TokenAmount::from_base_units(self.marketplace.market_creation_cost as u128),
            cost_per_input_byte: TokenAmount::from_base_units(self.marketplace.cost_per_input_byte as u128),
            staking_fee_share: self.marketplace.staking_fee_share as u128,
        })
    }

    pub fn prover_registry_config(&self) -> ProverRegistryConfig {
        ProverRegistryConfig {
            address: system_address("prover-registry"),
            parallel_requests_upper_limit: self.marketplace.parallel_requests_upper_limit,
            reduction_block_gap: self.marketplace.reduction_block_gap,
        }
    }

    pub fn native_config(&self) -> Result<NativeStakingConfig> {
        Ok(NativeStakingConfig {
            pool_address: system_address("native-staking"),
            payment_token: self.payment_token()?,
            withdrawal_duration: self.native.withdrawal_duration,
        })
    }

    pub fn symbiotic_config(&self) -> Result<SymbioticConfig> {
        Ok(SymbioticConfig {
            pool_address: system_address("symbiotic-staking"),
            payment_token: self.payment_token()?,
            submission_cooldown: self.symbiotic.submission_cooldown,
            base_transmitter_commission_rate: self.symbiotic.base_transmitter_commission_rate as u128,
            bridge_family: bridge_family(&self.symbiotic.bridge_family),
        })
    }
}
