// Copyright (c) 2024 Botho Foundation

//! Engine and genesis configuration, loaded from TOML.

use crate::{
    elastic::ElasticLimitParameters,
    error::ResourceLimitsError,
    stake::StakeParams,
    state::ResourceLimitsConfig,
    types::{AccountName, SymbolCode},
};
use anyhow::{Context, Result};
use bth_util_u64_ratio::U64Ratio;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fs, path::Path};

/// Token whose stake backs resource limits when no `[stake]` section is given.
pub const DEFAULT_SYSTEM_TOKEN: &str = "SYS";

/// Main configuration of the accounting engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Accounts that are never limited
    #[serde(default)]
    pub privileged: Vec<String>,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub ram: RamConfig,

    /// Stake-based limits; absent until the chain enables staking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stake: Option<StakeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Account CPU averaging window, in time slots (default 24h of 0.5s slots)
    #[serde(default = "default_account_window")]
    pub account_cpu_usage_average_window: u32,

    /// Account NET averaging window, in time slots
    #[serde(default = "default_account_window")]
    pub account_net_usage_average_window: u32,

    #[serde(default = "default_cpu_limit_parameters")]
    pub cpu: ElasticLimitParameters,

    #[serde(default = "default_net_limit_parameters")]
    pub net: ElasticLimitParameters,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            account_cpu_usage_average_window: default_account_window(),
            account_net_usage_average_window: default_account_window(),
            cpu: default_cpu_limit_parameters(),
            net: default_net_limit_parameters(),
        }
    }
}

fn default_account_window() -> u32 {
    172_800
}

/// 99/100: one percent per block while congested
const DEFAULT_CONTRACT_RATE: U64Ratio = match U64Ratio::new(99, 100) {
    Some(rate) => rate,
    None => panic!("zero denominator"),
};

/// 1000/999: about a tenth of a percent per block while idle
const DEFAULT_EXPAND_RATE: U64Ratio = match U64Ratio::new(1000, 999) {
    Some(rate) => rate,
    None => panic!("zero denominator"),
};

fn default_elastic_limit_parameters(max: u64) -> ElasticLimitParameters {
    ElasticLimitParameters {
        target: max / 10,
        max,
        periods: 120,
        max_multiplier: 1000,
        contract_rate: DEFAULT_CONTRACT_RATE,
        expand_rate: DEFAULT_EXPAND_RATE,
    }
}

/// 200ms of CPU per block
fn default_cpu_limit_parameters() -> ElasticLimitParameters {
    default_elastic_limit_parameters(200_000)
}

/// 1MiB of NET per block
fn default_net_limit_parameters() -> ElasticLimitParameters {
    default_elastic_limit_parameters(1024 * 1024)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamConfig {
    /// RAM shared among stakers, in bytes
    #[serde(default = "default_virtual_ram_limit")]
    pub virtual_limit: u64,
}

impl Default for RamConfig {
    fn default() -> Self {
        Self {
            virtual_limit: default_virtual_ram_limit(),
        }
    }
}

fn default_virtual_ram_limit() -> u64 {
    64 * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeConfig {
    /// Symbol of the staked token
    #[serde(default = "default_token")]
    pub token: String,

    /// Seconds between lazy refreshes of proxied stake
    #[serde(default = "default_frame_length")]
    pub frame_length: i64,

    /// Outbound grants allowed per proxy level, lowest level first
    #[serde(default = "default_max_proxies")]
    pub max_proxies: Vec<u8>,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
            frame_length: default_frame_length(),
            max_proxies: default_max_proxies(),
        }
    }
}

fn default_token() -> String {
    DEFAULT_SYSTEM_TOKEN.to_string()
}

fn default_frame_length() -> i64 {
    30
}

fn default_max_proxies() -> Vec<u8> {
    vec![50, 20, 5, 2]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            privileged: Vec::new(),
            limits: LimitsConfig::default(),
            ram: RamConfig::default(),
            stake: None,
        }
    }
}

impl EngineConfig {
    /// Load and validate config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ResourceLimitsError> {
        self.resource_limits_config().validate()?;
        self.privileged_accounts()?;
        self.stake_params()?;
        self.system_token()?;
        Ok(())
    }

    pub fn resource_limits_config(&self) -> ResourceLimitsConfig {
        ResourceLimitsConfig {
            cpu_limit_parameters: self.limits.cpu,
            net_limit_parameters: self.limits.net,
            account_cpu_usage_average_window: self.limits.account_cpu_usage_average_window,
            account_net_usage_average_window: self.limits.account_net_usage_average_window,
        }
    }

    /// The token whose stake backs resource limits.
    pub fn system_token(&self) -> Result<SymbolCode, ResourceLimitsError> {
        let token = self
            .stake
            .as_ref()
            .map(|s| s.token.as_str())
            .unwrap_or(DEFAULT_SYSTEM_TOKEN);
        token
            .parse()
            .map_err(|e| ResourceLimitsError::InvalidConfig(format!("stake token '{token}': {e}")))
    }

    /// Stake parameters to write at genesis, if staking is configured.
    pub fn stake_params(&self) -> Result<Option<StakeParams>, ResourceLimitsError> {
        let Some(stake) = &self.stake else {
            return Ok(None);
        };
        let params = StakeParams {
            max_proxies: stake.max_proxies.clone(),
            frame_length: stake.frame_length,
        };
        params.validate()?;
        Ok(Some(params))
    }

    pub fn privileged_accounts(&self) -> Result<BTreeSet<AccountName>, ResourceLimitsError> {
        self.privileged
            .iter()
            .map(|name| {
                name.parse().map_err(|e| {
                    ResourceLimitsError::InvalidConfig(format!("privileged account '{name}': {e}"))
                })
            })
            .collect()
    }
}
