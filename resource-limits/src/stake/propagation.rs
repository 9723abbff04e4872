// Copyright (c) 2024 Botho Foundation

//! Proxied-stake propagation and recall.
//!
//! Refreshing an agent recomputes `proxied` from the current value of every
//! pool it granted to, refreshing those pools first. A grant holding shares
//! whose agent no longer honours the grant's break terms, or no longer sits
//! at a lower proxy level, is recalled in full and its row erased during the
//! refresh. Share-less grants only carry terms and are left alone.
//!
//! Recalling a grant returns the grant's portion of the agent's pool. The
//! agent keeps its fee on any gain above the granted principal by converting
//! the fee into own shares, and passes the recall down to its own grants in
//! proportion to the shares leaving the pool.

use super::{StakeAgent, StakeGrant};
use crate::{
    error::ResourceLimitsError,
    math::{safe_pct, safe_prop, PERCENT_100},
    store::StakeStore,
    types::{AccountName, SymbolCode},
};
use lmdb::RwTransaction;
use tracing::{debug, warn};

/// Bound on the length of any grant chain walked by a traversal.
pub const MAX_PROXY_DEPTH: usize = 16;

/// A walk over the grant graph of one token at one point in time.
pub struct ProxyTraversal<'a, 'env> {
    store: &'a StakeStore,
    db_transaction: &'a mut RwTransaction<'env>,
    token: SymbolCode,
    now: i64,
    frame_length: i64,
}

impl<'a, 'env> ProxyTraversal<'a, 'env> {
    pub fn new(
        store: &'a StakeStore,
        db_transaction: &'a mut RwTransaction<'env>,
        token: SymbolCode,
        now: i64,
        frame_length: i64,
    ) -> Self {
        Self {
            store,
            db_transaction,
            token,
            now,
            frame_length,
        }
    }

    /// A traversal using the frame length configured for `token`.
    pub fn for_token(
        store: &'a StakeStore,
        db_transaction: &'a mut RwTransaction<'env>,
        token: SymbolCode,
        now: i64,
    ) -> Result<Self, ResourceLimitsError> {
        let params = store
            .get_params(token, db_transaction)?
            .ok_or(ResourceLimitsError::StakeNotConfigured(token))?;
        Ok(Self::new(store, db_transaction, token, now, params.frame_length))
    }

    /// Recompute `account`'s proxied amount if its frame has elapsed, or
    /// unconditionally when `force` is set.
    pub fn update_proxied(
        &mut self,
        account: AccountName,
        force: bool,
    ) -> Result<(), ResourceLimitsError> {
        self.update_proxied_at(account, force, 0)
    }

    /// Recall `pct` of the grant from `grantor` to `agent` and return the
    /// amount released. The grant is erased when nothing is left of it, or
    /// unconditionally when `forced_erase` is set.
    pub fn recall_proxied(
        &mut self,
        grantor: AccountName,
        agent: AccountName,
        pct: i16,
        forced_erase: bool,
    ) -> Result<i64, ResourceLimitsError> {
        assert!(
            (0..=PERCENT_100).contains(&(pct as i64)),
            "recall percentage {pct} out of range"
        );
        let grant = self.load_grant(grantor, agent)?;
        let share = safe_pct(grant.share, pct as i64);
        let granted = safe_pct(grant.granted, pct as i64);
        self.recall_grant(grant, share, granted, forced_erase, 0)
    }

    fn update_proxied_at(
        &mut self,
        account: AccountName,
        force: bool,
        depth: usize,
    ) -> Result<(), ResourceLimitsError> {
        assert!(
            depth < MAX_PROXY_DEPTH,
            "proxy traversal deeper than {MAX_PROXY_DEPTH} at '{account}'"
        );

        let agent = self.load_agent(account)?;
        if !force && self.now - agent.last_proxied_update < self.frame_length {
            return Ok(());
        }

        let grants = self
            .store
            .grants_by_grantor(self.token, account, &*self.db_transaction)?;

        let mut proxied = 0i64;
        let mut released = 0i64;
        for grant in grants {
            self.update_proxied_at(grant.agent, force, depth + 1)?;
            let proxy = self.load_agent(grant.agent)?;

            if proxy.proxy_level < agent.proxy_level && grant.accepts(&proxy) {
                if proxy.shares_sum > 0 {
                    proxied += safe_prop(proxy.get_total_funds(), grant.share, proxy.shares_sum);
                }
            } else if grant.share > 0 {
                warn!(
                    token = %self.token,
                    grantor = %account,
                    agent = %grant.agent,
                    "Grant terms broken, recalling"
                );
                released +=
                    self.recall_grant(grant, grant.share, grant.granted, true, depth + 1)?;
            }
        }

        let mut agent = self.load_agent(account)?;
        agent.proxied = proxied;
        agent.balance += released;
        agent.last_proxied_update = self.now;
        self.store.put_agent(&agent, self.db_transaction)?;

        debug!(
            token = %self.token,
            account = %account,
            proxied,
            released,
            "Refreshed proxied stake"
        );
        Ok(())
    }

    /// Remove `share` and `granted` from `grant` and return what the agent
    /// paid out for them.
    fn recall_grant(
        &mut self,
        mut grant: StakeGrant,
        share: i64,
        granted: i64,
        forced_erase: bool,
        depth: usize,
    ) -> Result<i64, ResourceLimitsError> {
        let amount = self.recall_share(grant.agent, share, granted, grant.break_fee, depth)?;

        grant.share -= share;
        grant.granted -= granted;
        if (grant.share == 0 && grant.pct == 0) || forced_erase {
            self.store
                .delete_grant(grant.token, grant.grantor, grant.agent, self.db_transaction)?;
        } else {
            self.store.put_grant(&grant, self.db_transaction)?;
        }
        Ok(amount)
    }

    fn recall_share(
        &mut self,
        account: AccountName,
        share: i64,
        granted: i64,
        break_fee: i16,
        depth: usize,
    ) -> Result<i64, ResourceLimitsError> {
        self.update_proxied_at(account, true, depth)?;
        let agent = self.load_agent(account)?;

        assert!(
            share >= 0 && share <= agent.shares_sum,
            "recalled share {share} outside the pool of '{account}' ({})",
            agent.shares_sum
        );

        let total = agent.get_total_funds();
        if total <= 0 || share == 0 {
            return Ok(0);
        }

        let current = safe_prop(total, share, agent.shares_sum);
        let fee_amount = if current > granted {
            safe_pct(current - granted, agent.fee.min(break_fee) as i64)
        } else {
            0
        };
        let fee_share = if fee_amount > 0 {
            safe_prop(share, fee_amount, current)
        } else {
            0
        };
        let net_share = share - fee_share;
        let balance_ret = safe_prop(agent.balance, net_share, agent.shares_sum);

        let mut proxied_ret = 0i64;
        let children = self
            .store
            .grants_by_grantor(self.token, account, &*self.db_transaction)?;
        for child in children {
            let child_share = safe_prop(child.share, net_share, agent.shares_sum);
            let child_granted = safe_prop(child.granted, net_share, agent.shares_sum);
            proxied_ret += self.recall_grant(child, child_share, child_granted, false, depth + 1)?;
        }

        let mut agent = self.load_agent(account)?;
        agent.balance -= balance_ret;
        agent.proxied -= proxied_ret;
        agent.shares_sum -= net_share;
        agent.own_share += fee_share;
        assert!(agent.balance >= 0, "negative balance of '{account}' after recall");
        assert!(agent.proxied >= 0, "negative proxied of '{account}' after recall");
        assert!(
            agent.shares_sum >= agent.own_share,
            "shares of '{account}' below its own share after recall"
        );
        self.store.put_agent(&agent, self.db_transaction)?;

        Ok(balance_ret + proxied_ret)
    }

    fn load_agent(&self, account: AccountName) -> Result<StakeAgent, ResourceLimitsError> {
        self.store
            .get_agent(self.token, account, &*self.db_transaction)?
            .ok_or(ResourceLimitsError::AgentNotFound {
                token: self.token,
                account,
            })
    }

    fn load_grant(
        &self,
        grantor: AccountName,
        agent: AccountName,
    ) -> Result<StakeGrant, ResourceLimitsError> {
        self.store
            .get_grant(self.token, grantor, agent, &*self.db_transaction)?
            .ok_or(ResourceLimitsError::GrantNotFound {
                token: self.token,
                grantor,
                agent,
            })
    }
}
