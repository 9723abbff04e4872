// Copyright (c) 2024 Botho Foundation

//! Per-transaction and per-block resource accounting.
//!
//! The transaction pipeline calls [`ResourceLimitsManager::add_transaction_usage`]
//! once per transaction and [`ResourceLimitsManager::process_block_usage`] once
//! per block. Every call takes the caller's LMDB write transaction; when a
//! call returns an error the caller aborts that transaction, which discards
//! every write made on its behalf.
//!
//! An account's share of a resource is its own stake in the system token's
//! pool divided by the total staked, applied to the current virtual capacity.

use crate::{
    config::EngineConfig,
    elastic::ElasticLimitParameters,
    error::ResourceLimitsError,
    math::downgrade_cast,
    stake::ProxyTraversal,
    state::{AccountResourceLimit, ResourceLimitsState, ResourceUsage},
    store::{ResourceDb, ResourceLimitsStore, ResourceUsageStore, StakeStore},
    types::{AccountName, ResourcePurpose, SymbolCode},
};
use lmdb::{RwTransaction, Transaction};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info, warn};

/// Answers whether an account bypasses resource limits.
pub trait AccountPrivileges {
    fn is_privileged(&self, account: AccountName) -> bool;
}

impl AccountPrivileges for BTreeSet<AccountName> {
    fn is_privileged(&self, account: AccountName) -> bool {
        self.contains(&account)
    }
}

/// No account is privileged.
pub struct NoPrivileges;

impl AccountPrivileges for NoPrivileges {
    fn is_privileged(&self, _account: AccountName) -> bool {
        false
    }
}

pub struct ResourceLimitsManager {
    usage: ResourceUsageStore,
    limits: ResourceLimitsStore,
    stake: StakeStore,
    system_token: SymbolCode,
    privileges: Arc<dyn AccountPrivileges + Send + Sync>,
}

impl ResourceLimitsManager {
    pub fn new(
        db: &ResourceDb,
        system_token: SymbolCode,
        privileges: Arc<dyn AccountPrivileges + Send + Sync>,
    ) -> Self {
        Self {
            usage: db.usage.clone(),
            limits: db.limits.clone(),
            stake: db.stake.clone(),
            system_token,
            privileges,
        }
    }

    /// A manager using the system token and privileged accounts of `config`.
    pub fn from_config(db: &ResourceDb, config: &EngineConfig) -> Result<Self, ResourceLimitsError> {
        Ok(Self::new(
            db,
            config.system_token()?,
            Arc::new(config.privileged_accounts()?),
        ))
    }

    pub fn system_token(&self) -> SymbolCode {
        self.system_token
    }

    // --- genesis and configuration ---

    /// Write the genesis configuration and state.
    pub fn initialize_database(
        &self,
        config: &EngineConfig,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        config.validate()?;
        let limits_config = config.resource_limits_config();
        let state = ResourceLimitsState::genesis(&limits_config, config.ram.virtual_limit);

        self.limits.put_config(&limits_config, db_transaction)?;
        self.limits.put_state(&state, db_transaction)?;

        if let Some(params) = config.stake_params()? {
            self.stake
                .put_params(self.system_token, &params, db_transaction)?;
            if self.stake.get_stat(self.system_token, db_transaction)?.is_none() {
                self.stake
                    .put_stat(self.system_token, &Default::default(), db_transaction)?;
            }
        }

        info!(
            virtual_cpu_limit = state.virtual_cpu_limit,
            virtual_net_limit = state.virtual_net_limit,
            virtual_ram_limit = state.virtual_ram_limit,
            "Initialized resource limits"
        );
        Ok(())
    }

    pub fn initialize_account(
        &self,
        account: AccountName,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        if self.usage.get(account, db_transaction)?.is_some() {
            return Err(ResourceLimitsError::AccountAlreadyExists(account));
        }
        self.usage
            .put(&ResourceUsage::new(account), db_transaction)?;
        Ok(())
    }

    pub fn set_block_parameters(
        &self,
        cpu_limit_parameters: ElasticLimitParameters,
        net_limit_parameters: ElasticLimitParameters,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        cpu_limit_parameters.validate()?;
        net_limit_parameters.validate()?;

        let mut config = self.limits.config(db_transaction)?;
        config.cpu_limit_parameters = cpu_limit_parameters;
        config.net_limit_parameters = net_limit_parameters;
        self.limits.put_config(&config, db_transaction)?;

        info!(
            cpu_max = cpu_limit_parameters.max,
            net_max = net_limit_parameters.max,
            "Set block parameters"
        );
        Ok(())
    }

    pub fn set_account_usage_windows(
        &self,
        cpu_window: u32,
        net_window: u32,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let mut config = self.limits.config(db_transaction)?;
        config.account_cpu_usage_average_window = cpu_window;
        config.account_net_usage_average_window = net_window;
        config.validate()?;
        self.limits.put_config(&config, db_transaction)?;

        info!(cpu_window, net_window, "Set account usage windows");
        Ok(())
    }

    pub fn set_virtual_ram_limit(
        &self,
        bytes: u64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let mut state = self.limits.state(db_transaction)?;
        state.virtual_ram_limit = bytes;
        self.limits.put_state(&state, db_transaction)?;

        info!(bytes, "Set virtual ram limit");
        Ok(())
    }

    // --- transactions and blocks ---

    /// Decay the usage of `accounts` to `time_slot` without adding usage.
    pub fn update_account_usage(
        &self,
        accounts: &BTreeSet<AccountName>,
        time_slot: u32,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let config = self.limits.config(db_transaction)?;
        for &account in accounts {
            let mut usage = self.load_usage(account, db_transaction)?;
            usage
                .net_usage
                .add(0, time_slot, config.account_net_usage_average_window);
            usage
                .cpu_usage
                .add(0, time_slot, config.account_cpu_usage_average_window);
            self.usage.put(&usage, db_transaction)?;
        }
        Ok(())
    }

    /// Bill one transaction's usage to every authorizing account and to the
    /// block being built.
    ///
    /// Account limits are only enforced when `now` is non-negative.
    pub fn add_transaction_usage(
        &self,
        accounts: &BTreeSet<AccountName>,
        cpu_usage: u64,
        net_usage: u64,
        time_slot: u32,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let config = self.limits.config(db_transaction)?;

        for &account in accounts {
            let mut usage = self.load_usage(account, db_transaction)?;
            usage
                .net_usage
                .add(net_usage, time_slot, config.account_net_usage_average_window);
            usage
                .cpu_usage
                .add(cpu_usage, time_slot, config.account_cpu_usage_average_window);
            self.usage.put(&usage, db_transaction)?;

            if now < 0 {
                continue;
            }

            let cpu = self.get_account_limit_ex(account, ResourcePurpose::Cpu, now, db_transaction)?;
            if let AccountResourceLimit::Limited { used, max, .. } = cpu {
                if used > max {
                    warn!(account = %account, used, max, "Transaction exceeds account cpu");
                    return Err(ResourceLimitsError::TxCpuUsageExceeded { account, used, max });
                }
            }

            let net = self.get_account_limit_ex(account, ResourcePurpose::Net, now, db_transaction)?;
            if let AccountResourceLimit::Limited { used, max, .. } = net {
                if used > max {
                    warn!(account = %account, used, max, "Transaction exceeds account net");
                    return Err(ResourceLimitsError::TxNetUsageExceeded { account, used, max });
                }
            }
        }

        let mut state = self.limits.state(db_transaction)?;
        state.pending_cpu_usage = state.pending_cpu_usage.saturating_add(cpu_usage);
        state.pending_net_usage = state.pending_net_usage.saturating_add(net_usage);

        if state.pending_cpu_usage > config.cpu_limit_parameters.max {
            warn!(pending = state.pending_cpu_usage, "Block cpu exhausted");
            return Err(ResourceLimitsError::BlockResourceExhausted {
                resource: ResourcePurpose::Cpu,
                pending: state.pending_cpu_usage,
                max: config.cpu_limit_parameters.max,
            });
        }
        if state.pending_net_usage > config.net_limit_parameters.max {
            warn!(pending = state.pending_net_usage, "Block net exhausted");
            return Err(ResourceLimitsError::BlockResourceExhausted {
                resource: ResourcePurpose::Net,
                pending: state.pending_net_usage,
                max: config.net_limit_parameters.max,
            });
        }

        self.limits.put_state(&state, db_transaction)?;
        Ok(())
    }

    /// Apply a signed change to `account`'s RAM usage.
    pub fn add_pending_ram_usage(
        &self,
        account: AccountName,
        delta: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        if delta == 0 {
            return Ok(());
        }

        let mut usage = self.load_usage(account, db_transaction)?;
        let current = usage.ram_usage;
        usage.ram_usage = if delta > 0 {
            current
                .checked_add(delta.unsigned_abs())
                .ok_or(ResourceLimitsError::RamUsageOverflow { account, current, delta })?
        } else {
            current
                .checked_sub(delta.unsigned_abs())
                .ok_or(ResourceLimitsError::RamUsageUnderflow { account, current, delta })?
        };
        self.usage.put(&usage, db_transaction)?;
        Ok(())
    }

    /// Fail if `account` holds more RAM than its stake entitles it to.
    pub fn verify_account_ram_usage(
        &self,
        account: AccountName,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let ram = self.get_account_limit_ex(account, ResourcePurpose::Ram, now, db_transaction)?;
        if let AccountResourceLimit::Limited { used, max, .. } = ram {
            if used > max {
                return Err(ResourceLimitsError::RamUsageExceeded { account, used, max });
            }
        }
        Ok(())
    }

    /// Fold the block's usage into the block averages and move the virtual
    /// limits one step.
    pub fn process_block_usage(
        &self,
        block_num: u32,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), ResourceLimitsError> {
        let config = self.limits.config(db_transaction)?;
        let mut state = self.limits.state(db_transaction)?;

        state.average_block_cpu_usage.add(
            state.pending_cpu_usage,
            block_num,
            config.cpu_limit_parameters.periods,
        );
        state.update_virtual_cpu_limit(&config);
        state.pending_cpu_usage = 0;

        state.average_block_net_usage.add(
            state.pending_net_usage,
            block_num,
            config.net_limit_parameters.periods,
        );
        state.update_virtual_net_limit(&config);
        state.pending_net_usage = 0;

        self.limits.put_state(&state, db_transaction)?;

        debug!(
            block_num,
            virtual_cpu_limit = state.virtual_cpu_limit,
            virtual_net_limit = state.virtual_net_limit,
            "Processed block usage"
        );
        Ok(())
    }

    // --- queries ---

    /// The account's limit for `purpose` at time `now`.
    ///
    /// Takes a write transaction because the account's proxied stake is
    /// refreshed when its frame has elapsed.
    pub fn get_account_limit_ex(
        &self,
        account: AccountName,
        purpose: ResourcePurpose,
        now: i64,
        db_transaction: &mut RwTransaction,
    ) -> Result<AccountResourceLimit, ResourceLimitsError> {
        if self.privileges.is_privileged(account) {
            return Ok(AccountResourceLimit::Unlimited);
        }

        let token = self.system_token;
        let stat = match self.stake.get_stat(token, db_transaction)? {
            Some(stat) if stat.enabled => stat,
            _ => return Ok(AccountResourceLimit::Unlimited),
        };
        let Some(params) = self.stake.get_params(token, db_transaction)? else {
            return Ok(AccountResourceLimit::Unlimited);
        };
        assert!(
            stat.total_staked > 0,
            "stake of {token} is enabled with nothing staked"
        );

        let staked = if self.stake.get_agent(token, account, db_transaction)?.is_some() {
            ProxyTraversal::new(&self.stake, db_transaction, token, now, params.frame_length)
                .update_proxied(account, false)?;
            self.stake
                .get_agent(token, account, db_transaction)?
                .ok_or(ResourceLimitsError::AgentNotFound { token, account })?
                .get_own_funds()
        } else {
            0
        };
        assert!(staked >= 0, "negative stake of '{account}'");

        let config = self.limits.config(db_transaction)?;
        let state = self.limits.state(db_transaction)?;
        let usage = self.load_usage(account, db_transaction)?;

        let (capacity, used) = match purpose {
            ResourcePurpose::Cpu => {
                let window = config.account_cpu_usage_average_window;
                (
                    state.virtual_cpu_limit as u128 * window as u128,
                    usage.cpu_usage.value_in_window(window),
                )
            }
            ResourcePurpose::Net => {
                let window = config.account_net_usage_average_window;
                (
                    state.virtual_net_limit as u128 * window as u128,
                    usage.net_usage.value_in_window(window),
                )
            }
            ResourcePurpose::Ram => (state.virtual_ram_limit as u128, usage.ram_usage),
        };

        let max: i64 = downgrade_cast(capacity * staked as u128 / stat.total_staked as u128);
        let used: i64 = downgrade_cast(used as u128);

        Ok(AccountResourceLimit::Limited {
            used,
            available: (max - used).max(0),
            max,
            staked_virtual_balance: staked,
        })
    }

    pub fn get_virtual_block_cpu_limit(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<u64, ResourceLimitsError> {
        Ok(self.limits.state(db_transaction)?.virtual_cpu_limit)
    }

    pub fn get_virtual_block_net_limit(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<u64, ResourceLimitsError> {
        Ok(self.limits.state(db_transaction)?.virtual_net_limit)
    }

    /// CPU left in the block being built.
    pub fn get_block_cpu_limit(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<u64, ResourceLimitsError> {
        let config = self.limits.config(db_transaction)?;
        let state = self.limits.state(db_transaction)?;
        Ok(config
            .cpu_limit_parameters
            .max
            .saturating_sub(state.pending_cpu_usage))
    }

    /// NET left in the block being built.
    pub fn get_block_net_limit(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<u64, ResourceLimitsError> {
        let config = self.limits.config(db_transaction)?;
        let state = self.limits.state(db_transaction)?;
        Ok(config
            .net_limit_parameters
            .max
            .saturating_sub(state.pending_net_usage))
    }

    pub fn get_account_ram_usage(
        &self,
        account: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<u64, ResourceLimitsError> {
        Ok(self.load_usage(account, db_transaction)?.ram_usage)
    }

    pub fn get_account_usage(
        &self,
        account: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<ResourceUsage, ResourceLimitsError> {
        self.load_usage(account, db_transaction)
    }

    fn load_usage(
        &self,
        account: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<ResourceUsage, ResourceLimitsError> {
        self.usage
            .get(account, db_transaction)?
            .ok_or(ResourceLimitsError::AccountNotFound(account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stake::{StakeActions, StakeParams};
    use tempfile::TempDir;

    fn name(s: &str) -> AccountName {
        s.parse().unwrap()
    }

    fn setup(config: &EngineConfig) -> (TempDir, ResourceDb, ResourceLimitsManager) {
        let temp_dir = TempDir::new().unwrap();
        let db = ResourceDb::open(temp_dir.path()).unwrap();
        let manager = ResourceLimitsManager::from_config(&db, config).unwrap();

        let mut txn = db.env().begin_rw_txn().unwrap();
        manager.initialize_database(config, &mut txn).unwrap();
        txn.commit().unwrap();
        (temp_dir, db, manager)
    }

    #[test]
    fn test_initialize_account_twice() {
        let (_temp_dir, db, manager) = setup(&EngineConfig::default());
        let mut txn = db.env().begin_rw_txn().unwrap();
        manager.initialize_account(name("alice"), &mut txn).unwrap();
        assert!(matches!(
            manager.initialize_account(name("alice"), &mut txn),
            Err(ResourceLimitsError::AccountAlreadyExists(_))
        ));
    }

    #[test]
    fn test_ram_delta_bounds() {
        let (_temp_dir, db, manager) = setup(&EngineConfig::default());
        let alice = name("alice");
        let mut txn = db.env().begin_rw_txn().unwrap();
        manager.initialize_account(alice, &mut txn).unwrap();

        manager.add_pending_ram_usage(alice, 100, &mut txn).unwrap();
        manager.add_pending_ram_usage(alice, -40, &mut txn).unwrap();
        manager.add_pending_ram_usage(alice, 0, &mut txn).unwrap();
        assert_eq!(manager.get_account_ram_usage(alice, &txn).unwrap(), 60);

        assert!(matches!(
            manager.add_pending_ram_usage(alice, -61, &mut txn),
            Err(ResourceLimitsError::RamUsageUnderflow { current: 60, .. })
        ));

        let mut usage = manager.get_account_usage(alice, &txn).unwrap();
        usage.ram_usage = u64::MAX - 1;
        db.usage.put(&usage, &mut txn).unwrap();
        assert!(matches!(
            manager.add_pending_ram_usage(alice, 2, &mut txn),
            Err(ResourceLimitsError::RamUsageOverflow { .. })
        ));

        // Zero deltas never touch the store, even for unknown accounts.
        manager
            .add_pending_ram_usage(name("nobody"), 0, &mut txn)
            .unwrap();
        assert!(matches!(
            manager.add_pending_ram_usage(name("nobody"), 1, &mut txn),
            Err(ResourceLimitsError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_block_parameters_validated_before_write() {
        let (_temp_dir, db, manager) = setup(&EngineConfig::default());
        let mut txn = db.env().begin_rw_txn().unwrap();

        let good = EngineConfig::default().limits.cpu;
        let mut bad = good;
        bad.periods = 0;
        assert!(matches!(
            manager.set_block_parameters(bad, good, &mut txn),
            Err(ResourceLimitsError::InvalidElasticLimit(_))
        ));
        assert!(manager.set_account_usage_windows(0, 10, &mut txn).is_err());

        let mut smaller = good;
        smaller.max = 150;
        smaller.target = 15;
        manager
            .set_block_parameters(smaller, good, &mut txn)
            .unwrap();
        assert_eq!(manager.get_block_cpu_limit(&txn).unwrap(), 150);
    }

    #[test]
    fn test_privileged_account_unlimited_with_stake() {
        let config = EngineConfig {
            privileged: vec!["eosio".to_string()],
            stake: Some(Default::default()),
            ..Default::default()
        };
        let (_temp_dir, db, manager) = setup(&config);
        let token = manager.system_token();
        let actions = StakeActions::new(db.stake.clone());

        let mut txn = db.env().begin_rw_txn().unwrap();
        for account in ["eosio", "alice"] {
            manager.initialize_account(name(account), &mut txn).unwrap();
        }
        actions.open_agent(token, name("alice"), 0, 0, &mut txn).unwrap();
        actions.stake(token, name("alice"), 100, 0, &mut txn).unwrap();
        actions.enable_stake(token, &mut txn).unwrap();

        let limit = manager
            .get_account_limit_ex(name("eosio"), ResourcePurpose::Cpu, 0, &mut txn)
            .unwrap();
        assert!(limit.is_unlimited());
        assert_eq!(limit.as_triple(), (-1, -1, -1));

        // Alice holds all the stake, so she gets the whole virtual capacity.
        let limit = manager
            .get_account_limit_ex(name("alice"), ResourcePurpose::Ram, 0, &mut txn)
            .unwrap();
        assert_eq!(
            limit,
            AccountResourceLimit::Limited {
                used: 0,
                available: config.ram.virtual_limit as i64,
                max: config.ram.virtual_limit as i64,
                staked_virtual_balance: 100,
            }
        );
    }

    #[test]
    fn test_unstaked_account_has_no_capacity() {
        let config = EngineConfig {
            stake: Some(Default::default()),
            ..Default::default()
        };
        let (_temp_dir, db, manager) = setup(&config);
        let token = manager.system_token();
        let actions = StakeActions::new(db.stake.clone());

        let mut txn = db.env().begin_rw_txn().unwrap();
        for account in ["alice", "bob"] {
            manager.initialize_account(name(account), &mut txn).unwrap();
        }
        actions.open_agent(token, name("alice"), 0, 0, &mut txn).unwrap();
        actions.stake(token, name("alice"), 100, 0, &mut txn).unwrap();
        actions.enable_stake(token, &mut txn).unwrap();

        manager.add_pending_ram_usage(name("bob"), 1, &mut txn).unwrap();
        assert!(matches!(
            manager.verify_account_ram_usage(name("bob"), 0, &mut txn),
            Err(ResourceLimitsError::RamUsageExceeded { used: 1, max: 0, .. })
        ));

        let accounts: BTreeSet<_> = [name("bob")].into_iter().collect();
        assert!(matches!(
            manager.add_transaction_usage(&accounts, 1, 0, 1, 0, &mut txn),
            Err(ResourceLimitsError::TxCpuUsageExceeded { used: 2, max: 0, .. })
        ));
    }

    #[test]
    fn test_usage_decays_over_account_window() {
        let (_temp_dir, db, manager) = setup(&EngineConfig::default());
        let alice = name("alice");
        let accounts: BTreeSet<_> = [alice].into_iter().collect();
        let mut txn = db.env().begin_rw_txn().unwrap();
        manager.initialize_account(alice, &mut txn).unwrap();
        manager.set_account_usage_windows(10, 10, &mut txn).unwrap();
        manager.set_virtual_ram_limit(4096, &mut txn).unwrap();
        assert_eq!(db.limits.state(&txn).unwrap().virtual_ram_limit, 4096);

        manager
            .add_transaction_usage(&accounts, 1000, 200, 1, -1, &mut txn)
            .unwrap();
        let usage = manager.get_account_usage(alice, &txn).unwrap();
        assert_eq!(usage.cpu_usage.average(), 100);
        assert_eq!(usage.cpu_usage.value_in_window(10), 1000);

        // Half the window later half the usage remains.
        manager.update_account_usage(&accounts, 6, &mut txn).unwrap();
        let usage = manager.get_account_usage(alice, &txn).unwrap();
        assert_eq!(usage.cpu_usage.average(), 50);
        assert_eq!(usage.net_usage.average(), 10);
        assert_eq!(usage.cpu_usage.consumed, 0);

        manager.update_account_usage(&accounts, 20, &mut txn).unwrap();
        let usage = manager.get_account_usage(alice, &txn).unwrap();
        assert_eq!(usage.cpu_usage.value_ex, 0);
        assert_eq!(usage.net_usage.value_ex, 0);
    }

    #[test]
    fn test_stake_params_written_at_genesis() {
        let config = EngineConfig {
            stake: Some(Default::default()),
            ..Default::default()
        };
        let (_temp_dir, db, manager) = setup(&config);
        let txn = db.env().begin_ro_txn().unwrap();
        let params = db
            .stake
            .get_params(manager.system_token(), &txn)
            .unwrap()
            .unwrap();
        assert_eq!(
            params,
            StakeParams {
                max_proxies: vec![50, 20, 5, 2],
                frame_length: 30,
            }
        );
        let stat = db.stake.get_stat(manager.system_token(), &txn).unwrap().unwrap();
        assert!(!stat.enabled);
    }
}
