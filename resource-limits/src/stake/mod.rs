// Copyright (c) 2024 Botho Foundation

//! Stake agents and the grants between them.
//!
//! An agent pools its own stake with stake granted to it by other agents.
//! Ownership of the pool is tracked in shares: the agent itself holds
//! `own_share`, each inbound grant holds its `share`, and the total is
//! `shares_sum`. An agent of proxy level `L` may only grant to agents of a
//! strictly lower level, so the graph is a DAG whose depth is bounded by the
//! number of levels.
//!
//! [`ProxyTraversal`] keeps the `proxied` amounts current and recalls grants;
//! [`StakeActions`] are the bookkeeping operations that create and mutate
//! agents and grants.

mod actions;
mod propagation;

pub use actions::StakeActions;
pub use propagation::{ProxyTraversal, MAX_PROXY_DEPTH};

use crate::{
    error::ResourceLimitsError,
    math::{safe_prop, PERCENT_100},
    types::{AccountName, SymbolCode},
};
use serde::{Deserialize, Serialize};

/// One account's position in the stake pool of a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeAgent {
    pub token: SymbolCode,
    pub account: AccountName,
    /// 0 is a plain staker; higher levels may grant to lower ones.
    pub proxy_level: u8,
    /// Seconds timestamp of the last `proxied` refresh.
    pub last_proxied_update: i64,
    /// Funds held directly.
    pub balance: i64,
    /// Funds held through outbound grants, as of the last refresh.
    pub proxied: i64,
    pub own_share: i64,
    pub shares_sum: i64,
    /// Fee charged on grantors' gains, in `PERCENT_100` units.
    pub fee: i16,
    pub min_own_staked: i64,
}

impl StakeAgent {
    pub fn new(token: SymbolCode, account: AccountName, proxy_level: u8, now: i64) -> Self {
        Self {
            token,
            account,
            proxy_level,
            last_proxied_update: now,
            balance: 0,
            proxied: 0,
            own_share: 0,
            shares_sum: 0,
            fee: 0,
            min_own_staked: 0,
        }
    }

    pub fn get_total_funds(&self) -> i64 {
        self.balance + self.proxied
    }

    /// The part of the pool owned by the agent itself.
    pub fn get_own_funds(&self) -> i64 {
        if self.shares_sum == 0 {
            return 0;
        }
        safe_prop(self.get_total_funds(), self.own_share, self.shares_sum)
    }

    /// Shares issued for `amount` entering the pool.
    pub(crate) fn shares_for(&self, amount: i64) -> i64 {
        let total = self.get_total_funds();
        if self.shares_sum == 0 || total == 0 {
            amount
        } else {
            safe_prop(self.shares_sum, amount, total)
        }
    }
}

/// A delegation of part of `grantor`'s stake to `agent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeGrant {
    pub token: SymbolCode,
    pub grantor: AccountName,
    pub agent: AccountName,
    /// Automatic-delegation percentage, in `PERCENT_100` units.
    pub pct: i16,
    /// Shares of the agent's pool held by the grant.
    pub share: i64,
    /// Principal contributed, the basis the agent's fee is charged above.
    pub granted: i64,
    /// Highest agent fee the grantor tolerates.
    pub break_fee: i16,
    /// Lowest agent own stake the grantor tolerates.
    pub break_min_own_staked: i64,
}

impl StakeGrant {
    /// A grant with no shares and the most permissive terms.
    pub fn new(token: SymbolCode, grantor: AccountName, agent: AccountName) -> Self {
        Self {
            token,
            grantor,
            agent,
            pct: 0,
            share: 0,
            granted: 0,
            break_fee: PERCENT_100 as i16,
            break_min_own_staked: 0,
        }
    }

    /// Whether `agent` still honours the grantor's break terms.
    pub fn accepts(&self, agent: &StakeAgent) -> bool {
        self.break_fee >= agent.fee && self.break_min_own_staked <= agent.min_own_staked
    }
}

/// Per-token stake parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeParams {
    /// `max_proxies[L - 1]` is the number of outbound grants an agent of
    /// level `L` may hold; the length is the highest level.
    pub max_proxies: Vec<u8>,
    /// Seconds between lazy refreshes of an agent's `proxied` amount.
    pub frame_length: i64,
}

impl StakeParams {
    pub fn validate(&self) -> Result<(), ResourceLimitsError> {
        if self.max_proxies.len() >= MAX_PROXY_DEPTH {
            return Err(ResourceLimitsError::InvalidConfig(format!(
                "at most {} proxy levels are supported, got {}",
                MAX_PROXY_DEPTH - 1,
                self.max_proxies.len()
            )));
        }
        if self.frame_length < 0 {
            return Err(ResourceLimitsError::InvalidConfig(
                "stake frame length cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_level(&self) -> u8 {
        self.max_proxies.len() as u8
    }

    /// Outbound grants allowed at `level`; zero for plain stakers.
    pub fn max_grants(&self, level: u8) -> usize {
        match level {
            0 => 0,
            l => self
                .max_proxies
                .get(l as usize - 1)
                .map(|&n| n as usize)
                .unwrap_or(0),
        }
    }
}

/// Per-token stake totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeStat {
    /// Sum of all stake ever staked and not withdrawn.
    pub total_staked: i64,
    /// Resource limits are stake-based only once enabled.
    pub enabled: bool,
}
