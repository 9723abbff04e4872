// Copyright (c) 2024 Botho Foundation

//! Bookkeeping operations on the stake graph.
//!
//! Every operation runs inside the caller's write transaction. A returned
//! error leaves partial writes in that transaction, so the caller must abort
//! it.

use super::{ProxyTraversal, StakeAgent, StakeGrant, StakeParams, StakeStat};
use crate::{
    error::ResourceLimitsError,
    math::{safe_prop_ceil, PERCENT_100},
    store::StakeStore,
    types::{AccountName, SymbolCode},
};
use lmdb::{RwTransaction, Transaction};
use tracing::{debug, info};

pub struct StakeActions {
    store: StakeStore,
}

impl StakeActions {
    pub fn new(store: StakeStore) -> Self {
        Self { store }
    }

    // --- per-token configuration ---

    /// Create the totals row for `token`. Existing totals are kept.
    pub fn create_stake_stat(
        &self,
        token: SymbolCode,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        if self.store.get_stat(token, db_transaction)?.is_none() {
            self.store
                .put_stat(token, &StakeStat::default(), db_transaction)?;
            info!(token = %token, "Created stake stat");
        }
        Ok(())
    }

    pub fn set_stake_params(
        &self,
        token: SymbolCode,
        params: &StakeParams,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        params.validate()?;
        self.store.put_params(token, params, db_transaction)?;
        info!(
            token = %token,
            levels = params.max_proxies.len(),
            frame_length = params.frame_length,
            "Set stake params"
        );
        Ok(())
    }

    /// Switch resource limits for `token` to stake-based accounting.
    pub fn enable_stake(
        &self,
        token: SymbolCode,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        self.params(token, db_transaction)?;
        let mut stat = self
            .store
            .get_stat(token, db_transaction)?
            .ok_or(ResourceLimitsError::StakeNotConfigured(token))?;
        if stat.total_staked <= 0 {
            return Err(ResourceLimitsError::InvalidAmount(format!(
                "cannot enable {token} with nothing staked"
            )));
        }
        stat.enabled = true;
        self.store.put_stat(token, &stat, db_transaction)?;
        info!(token = %token, total_staked = stat.total_staked, "Enabled stake");
        Ok(())
    }

    // --- agents ---

    pub fn open_agent(
        &self,
        token: SymbolCode,
        account: AccountName,
        proxy_level: u8,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let params = self.params(token, db_transaction)?;
        check_level(&params, proxy_level)?;
        if self.store.get_agent(token, account, db_transaction)?.is_some() {
            return Err(ResourceLimitsError::AgentAlreadyExists { token, account });
        }
        let agent = StakeAgent::new(token, account, proxy_level, now);
        self.store.put_agent(&agent, db_transaction)?;
        debug!(token = %token, account = %account, proxy_level, "Opened stake agent");
        Ok(())
    }

    /// Change the level of an agent that neither holds nor receives grants.
    pub fn set_proxy_level(
        &self,
        token: SymbolCode,
        account: AccountName,
        proxy_level: u8,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let params = self.params(token, db_transaction)?;
        check_level(&params, proxy_level)?;
        let mut agent = self.load_agent(token, account, db_transaction)?;

        if !self
            .store
            .grants_by_grantor(token, account, db_transaction)?
            .is_empty()
            || !self
                .store
                .grants_to_agent(token, account, db_transaction)?
                .is_empty()
        {
            return Err(ResourceLimitsError::AgentHasGrants(account));
        }

        agent.proxy_level = proxy_level;
        self.store.put_agent(&agent, db_transaction)?;
        Ok(())
    }

    /// Grantors whose break fee is below the new fee recall on their next
    /// refresh.
    pub fn set_proxy_fee(
        &self,
        token: SymbolCode,
        account: AccountName,
        fee: i16,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        check_pct("fee", fee)?;
        let mut agent = self.load_agent(token, account, db_transaction)?;
        agent.fee = fee;
        self.store.put_agent(&agent, db_transaction)?;
        Ok(())
    }

    pub fn set_min_own_staked(
        &self,
        token: SymbolCode,
        account: AccountName,
        amount: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        if amount < 0 {
            return Err(ResourceLimitsError::InvalidAmount(format!(
                "min own staked {amount} is negative"
            )));
        }
        let mut agent = self.load_agent(token, account, db_transaction)?;
        agent.min_own_staked = amount;
        self.store.put_agent(&agent, db_transaction)?;
        Ok(())
    }

    // --- grants ---

    /// Set the automatic-delegation percentage and break terms of a grant,
    /// creating a share-less grant if there is none.
    #[allow(clippy::too_many_arguments)]
    pub fn set_grant_terms(
        &self,
        token: SymbolCode,
        grantor: AccountName,
        agent: AccountName,
        pct: i16,
        break_fee: i16,
        break_min_own_staked: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        check_pct("pct", pct)?;
        check_pct("break fee", break_fee)?;
        if break_min_own_staked < 0 {
            return Err(ResourceLimitsError::InvalidAmount(format!(
                "break min own staked {break_min_own_staked} is negative"
            )));
        }

        let params = self.params(token, db_transaction)?;
        let grantor_agent = self.load_agent(token, grantor, db_transaction)?;
        let target = self.load_agent(token, agent, db_transaction)?;
        check_grant_levels(&grantor_agent, &target)?;

        let mut grant = match self.store.get_grant(token, grantor, agent, db_transaction)? {
            Some(grant) => grant,
            None => {
                self.check_grant_capacity(&params, &grantor_agent, db_transaction)?;
                StakeGrant::new(token, grantor, agent)
            }
        };
        grant.pct = pct;
        grant.break_fee = break_fee;
        grant.break_min_own_staked = break_min_own_staked;

        if is_empty_grant(&grant) {
            self.store
                .delete_grant(token, grantor, agent, db_transaction)?;
        } else {
            self.store.put_grant(&grant, db_transaction)?;
        }
        Ok(())
    }

    // --- funds ---

    /// Add `amount` to `account`'s own stake.
    pub fn stake(
        &self,
        token: SymbolCode,
        account: AccountName,
        amount: i64,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        check_positive(amount)?;
        let params = self.params(token, db_transaction)?;
        let mut stat = self
            .store
            .get_stat(token, db_transaction)?
            .ok_or(ResourceLimitsError::StakeNotConfigured(token))?;
        self.load_agent(token, account, db_transaction)?;

        ProxyTraversal::new(&self.store, db_transaction, token, now, params.frame_length)
            .update_proxied(account, true)?;

        let mut agent = self.load_agent(token, account, db_transaction)?;
        let shares = agent.shares_for(amount);
        agent.own_share += shares;
        agent.shares_sum += shares;
        agent.balance += amount;
        self.store.put_agent(&agent, db_transaction)?;

        stat.total_staked = stat
            .total_staked
            .checked_add(amount)
            .ok_or_else(|| ResourceLimitsError::InvalidAmount("total stake overflows".into()))?;
        self.store.put_stat(token, &stat, db_transaction)?;

        debug!(token = %token, account = %account, amount, shares, "Staked");
        Ok(())
    }

    /// Take `amount` of `account`'s own stake out of its direct balance.
    pub fn withdraw(
        &self,
        token: SymbolCode,
        account: AccountName,
        amount: i64,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        check_positive(amount)?;
        let params = self.params(token, db_transaction)?;
        let mut stat = self
            .store
            .get_stat(token, db_transaction)?
            .ok_or(ResourceLimitsError::StakeNotConfigured(token))?;
        self.load_agent(token, account, db_transaction)?;

        ProxyTraversal::new(&self.store, db_transaction, token, now, params.frame_length)
            .update_proxied(account, true)?;

        let mut agent = self.load_agent(token, account, db_transaction)?;
        let available = agent.get_own_funds().min(agent.balance);
        if amount > available {
            return Err(ResourceLimitsError::InsufficientFunds {
                account,
                available,
                requested: amount,
            });
        }
        if stat.enabled && stat.total_staked - amount <= 0 {
            return Err(ResourceLimitsError::InvalidAmount(format!(
                "cannot withdraw the last stake of {token} while stake is enabled"
            )));
        }

        let burned = safe_prop_ceil(agent.shares_sum, amount, agent.get_total_funds());
        assert!(
            burned <= agent.own_share,
            "withdrawal from '{account}' burns more than its own shares"
        );
        agent.own_share -= burned;
        agent.shares_sum -= burned;
        agent.balance -= amount;
        self.store.put_agent(&agent, db_transaction)?;

        stat.total_staked -= amount;
        self.store.put_stat(token, &stat, db_transaction)?;

        debug!(token = %token, account = %account, amount, burned, "Withdrew stake");
        Ok(())
    }

    /// Move `amount` from `grantor`'s balance into `agent`'s pool.
    pub fn delegate(
        &self,
        token: SymbolCode,
        grantor: AccountName,
        agent: AccountName,
        amount: i64,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        check_positive(amount)?;
        let params = self.params(token, db_transaction)?;
        self.load_agent(token, grantor, db_transaction)?;
        self.load_agent(token, agent, db_transaction)?;

        {
            let mut traversal =
                ProxyTraversal::new(&self.store, db_transaction, token, now, params.frame_length);
            traversal.update_proxied(grantor, true)?;
            traversal.update_proxied(agent, true)?;
        }

        let mut grantor_agent = self.load_agent(token, grantor, db_transaction)?;
        let mut target = self.load_agent(token, agent, db_transaction)?;
        check_grant_levels(&grantor_agent, &target)?;

        if amount > grantor_agent.balance {
            return Err(ResourceLimitsError::InsufficientFunds {
                account: grantor,
                available: grantor_agent.balance,
                requested: amount,
            });
        }

        let mut grant = match self.store.get_grant(token, grantor, agent, db_transaction)? {
            Some(grant) => grant,
            None => {
                self.check_grant_capacity(&params, &grantor_agent, db_transaction)?;
                StakeGrant::new(token, grantor, agent)
            }
        };
        if !grant.accepts(&target) {
            return Err(ResourceLimitsError::AgentTermsViolated {
                agent,
                reason: format!(
                    "fee {} / min own staked {} outside break fee {} / break min own staked {}",
                    target.fee,
                    target.min_own_staked,
                    grant.break_fee,
                    grant.break_min_own_staked
                ),
            });
        }
        let own_funds = target.get_own_funds();
        if own_funds < target.min_own_staked {
            return Err(ResourceLimitsError::AgentTermsViolated {
                agent,
                reason: format!(
                    "own stake {own_funds} below its minimum {}",
                    target.min_own_staked
                ),
            });
        }

        let shares = target.shares_for(amount);
        target.balance += amount;
        target.shares_sum += shares;
        self.store.put_agent(&target, db_transaction)?;

        grantor_agent.balance -= amount;
        grantor_agent.proxied += amount;
        self.store.put_agent(&grantor_agent, db_transaction)?;

        grant.share += shares;
        grant.granted += amount;
        self.store.put_grant(&grant, db_transaction)?;

        debug!(
            token = %token,
            grantor = %grantor,
            agent = %agent,
            amount,
            shares,
            "Delegated stake"
        );
        Ok(())
    }

    /// Recall `pct` of a grant into the grantor's balance, returning the
    /// amount released.
    pub fn recall(
        &self,
        token: SymbolCode,
        grantor: AccountName,
        agent: AccountName,
        pct: i16,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<i64, ResourceLimitsError> {
        check_pct("pct", pct)?;
        if pct == 0 {
            return Err(ResourceLimitsError::InvalidAmount(
                "recall percentage must be positive".to_string(),
            ));
        }
        let params = self.params(token, db_transaction)?;

        let amount = {
            let mut traversal =
                ProxyTraversal::new(&self.store, db_transaction, token, now, params.frame_length);
            traversal.update_proxied(grantor, true)?;
            traversal.recall_proxied(grantor, agent, pct, false)?
        };

        let mut grantor_agent = self.load_agent(token, grantor, db_transaction)?;
        grantor_agent.balance += amount;
        self.store.put_agent(&grantor_agent, db_transaction)?;

        ProxyTraversal::new(&self.store, db_transaction, token, now, params.frame_length)
            .update_proxied(grantor, true)?;

        debug!(
            token = %token,
            grantor = %grantor,
            agent = %agent,
            pct,
            amount,
            "Recalled stake"
        );
        Ok(amount)
    }

    fn params(
        &self,
        token: SymbolCode,
        db_transaction: &impl Transaction,
    ) -> Result<StakeParams, ResourceLimitsError> {
        self.store
            .get_params(token, db_transaction)?
            .ok_or(ResourceLimitsError::StakeNotConfigured(token))
    }

    fn load_agent(
        &self,
        token: SymbolCode,
        account: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<StakeAgent, ResourceLimitsError> {
        self.store
            .get_agent(token, account, db_transaction)?
            .ok_or(ResourceLimitsError::AgentNotFound { token, account })
    }

    fn check_grant_capacity(
        &self,
        params: &StakeParams,
        grantor: &StakeAgent,
        db_transaction: &impl Transaction,
    ) -> Result<(), ResourceLimitsError> {
        let held = self
            .store
            .grants_by_grantor(grantor.token, grantor.account, db_transaction)?
            .len();
        if held >= params.max_grants(grantor.proxy_level) {
            return Err(ResourceLimitsError::TooManyGrants(grantor.account));
        }
        Ok(())
    }
}

fn check_level(params: &StakeParams, proxy_level: u8) -> Result<(), ResourceLimitsError> {
    if proxy_level > params.max_level() {
        return Err(ResourceLimitsError::InvalidProxyLevel(format!(
            "level {proxy_level} above the highest level {}",
            params.max_level()
        )));
    }
    Ok(())
}

fn check_grant_levels(grantor: &StakeAgent, agent: &StakeAgent) -> Result<(), ResourceLimitsError> {
    if grantor.account == agent.account || grantor.proxy_level <= agent.proxy_level {
        return Err(ResourceLimitsError::InvalidProxyLevel(format!(
            "'{}' at level {} cannot grant to '{}' at level {}",
            grantor.account, grantor.proxy_level, agent.account, agent.proxy_level
        )));
    }
    Ok(())
}

fn check_pct(what: &str, value: i16) -> Result<(), ResourceLimitsError> {
    if !(0..=PERCENT_100).contains(&(value as i64)) {
        return Err(ResourceLimitsError::InvalidAmount(format!(
            "{what} {value} outside 0..={PERCENT_100}"
        )));
    }
    Ok(())
}

fn check_positive(amount: i64) -> Result<(), ResourceLimitsError> {
    if amount <= 0 {
        return Err(ResourceLimitsError::InvalidAmount(format!(
            "amount {amount} must be positive"
        )));
    }
    Ok(())
}

fn is_empty_grant(grant: &StakeGrant) -> bool {
    grant.share == 0
        && grant.pct == 0
        && grant.break_fee as i64 == PERCENT_100
        && grant.break_min_own_staked == 0
}
