// Copyright (c) 2024 Botho Foundation

//! Rows persisted by the resource-limits manager and the result type of
//! account limit queries.

use crate::{
    accumulator::UsageAccumulator,
    elastic::{update_elastic_limit, ElasticLimitParameters},
    error::ResourceLimitsError,
    types::AccountName,
};
use serde::{Deserialize, Serialize};

/// Per-account usage, created with the account and never deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub owner: AccountName,
    pub net_usage: UsageAccumulator,
    pub cpu_usage: UsageAccumulator,
    /// Bytes of RAM currently billed to the account.
    pub ram_usage: u64,
}

impl ResourceUsage {
    /// A zeroed row for a new account.
    pub fn new(owner: AccountName) -> Self {
        Self {
            owner,
            ..Default::default()
        }
    }
}

/// Chain-wide configuration, set at genesis and changed only by privileged
/// configuration actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    pub cpu_limit_parameters: ElasticLimitParameters,
    pub net_limit_parameters: ElasticLimitParameters,
    /// Account CPU averaging window, in time slots.
    pub account_cpu_usage_average_window: u32,
    /// Account NET averaging window, in time slots.
    pub account_net_usage_average_window: u32,
}

impl ResourceLimitsConfig {
    pub fn validate(&self) -> Result<(), ResourceLimitsError> {
        self.cpu_limit_parameters.validate()?;
        self.net_limit_parameters.validate()?;
        if self.account_cpu_usage_average_window == 0 {
            return Err(ResourceLimitsError::InvalidConfig(
                "account cpu usage average window must be non-zero".to_string(),
            ));
        }
        if self.account_net_usage_average_window == 0 {
            return Err(ResourceLimitsError::InvalidConfig(
                "account net usage average window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chain-wide live state, updated by every transaction and every block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsState {
    /// Moving average of CPU usage per block.
    pub average_block_cpu_usage: UsageAccumulator,
    /// Moving average of NET usage per block.
    pub average_block_net_usage: UsageAccumulator,

    /// CPU used so far in the block being built.
    pub pending_cpu_usage: u64,
    /// NET used so far in the block being built.
    pub pending_net_usage: u64,

    pub virtual_cpu_limit: u64,
    pub virtual_net_limit: u64,
    pub virtual_ram_limit: u64,
}

impl ResourceLimitsState {
    /// State at genesis: virtual limits start at the hard maximums.
    pub fn genesis(config: &ResourceLimitsConfig, virtual_ram_limit: u64) -> Self {
        Self {
            virtual_cpu_limit: config.cpu_limit_parameters.max,
            virtual_net_limit: config.net_limit_parameters.max,
            virtual_ram_limit,
            ..Default::default()
        }
    }

    pub fn update_virtual_cpu_limit(&mut self, config: &ResourceLimitsConfig) {
        self.virtual_cpu_limit = update_elastic_limit(
            self.virtual_cpu_limit,
            self.average_block_cpu_usage.average(),
            &config.cpu_limit_parameters,
        );
    }

    pub fn update_virtual_net_limit(&mut self, config: &ResourceLimitsConfig) {
        self.virtual_net_limit = update_elastic_limit(
            self.virtual_net_limit,
            self.average_block_net_usage.average(),
            &config.net_limit_parameters,
        );
    }
}

/// Result of an account limit query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountResourceLimit {
    /// No limit applies: privileged account, or stake is not configured.
    Unlimited,
    Limited {
        /// Quantity used in the current window.
        used: i64,
        /// Quantity still available in the current window, never negative.
        available: i64,
        /// Maximum for the window under current congestion.
        max: i64,
        /// Stake the maximum was derived from.
        staked_virtual_balance: i64,
    },
}

impl AccountResourceLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, AccountResourceLimit::Unlimited)
    }

    /// Legacy `(used, available, max)` form, `(-1, -1, -1)` when unlimited.
    pub fn as_triple(&self) -> (i64, i64, i64) {
        match *self {
            AccountResourceLimit::Unlimited => (-1, -1, -1),
            AccountResourceLimit::Limited {
                used,
                available,
                max,
                ..
            } => (used, available, max),
        }
    }
}
