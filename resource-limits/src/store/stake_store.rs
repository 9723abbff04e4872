// Copyright (c) 2024 Botho Foundation

//! Stake agents, grants, and the per-token stake parameters and totals.

use super::{compose_key, decompose_key, delete_row, get_row, put_row, scan_prefix, StoreError};
use crate::{
    stake::{StakeAgent, StakeGrant, StakeParams, StakeStat},
    types::{AccountName, SymbolCode},
};
use lmdb::{Database, DatabaseFlags, Environment, RwTransaction, Transaction};

// LMDB Database names.
/// Maps (token, account) -> StakeAgent
pub const STAKE_AGENTS_DB_NAME: &str = "stake:agents";
/// Maps (token, grantor, agent) -> StakeGrant
pub const STAKE_GRANTS_DB_NAME: &str = "stake:grants";
/// Maps token -> StakeParams
pub const STAKE_PARAMS_DB_NAME: &str = "stake:params";
/// Maps token -> StakeStat
pub const STAKE_STATS_DB_NAME: &str = "stake:stats";

#[derive(Clone)]
pub struct StakeStore {
    agents: Database,
    grants: Database,
    params: Database,
    stats: Database,
}

impl StakeStore {
    /// Opens an existing StakeStore.
    pub fn new(env: &Environment) -> Result<Self, StoreError> {
        Ok(StakeStore {
            agents: env.open_db(Some(STAKE_AGENTS_DB_NAME))?,
            grants: env.open_db(Some(STAKE_GRANTS_DB_NAME))?,
            params: env.open_db(Some(STAKE_PARAMS_DB_NAME))?,
            stats: env.open_db(Some(STAKE_STATS_DB_NAME))?,
        })
    }

    /// Creates a fresh StakeStore.
    pub fn create(env: &Environment) -> Result<(), StoreError> {
        env.create_db(Some(STAKE_AGENTS_DB_NAME), DatabaseFlags::empty())?;
        env.create_db(Some(STAKE_GRANTS_DB_NAME), DatabaseFlags::empty())?;
        env.create_db(Some(STAKE_PARAMS_DB_NAME), DatabaseFlags::empty())?;
        env.create_db(Some(STAKE_STATS_DB_NAME), DatabaseFlags::empty())?;
        Ok(())
    }

    // --- agents ---

    pub fn get_agent(
        &self,
        token: SymbolCode,
        account: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<Option<StakeAgent>, StoreError> {
        get_row(
            db_transaction,
            self.agents,
            &compose_key(&[token.raw(), account.raw()]),
        )
    }

    pub fn put_agent(
        &self,
        agent: &StakeAgent,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(
            db_transaction,
            self.agents,
            &compose_key(&[agent.token.raw(), agent.account.raw()]),
            agent,
        )
    }

    /// Every agent of every token, in (token, account) order.
    pub fn all_agents(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<Vec<StakeAgent>, StoreError> {
        Ok(scan_prefix(db_transaction, self.agents, &[])?
            .into_iter()
            .map(|(_, agent)| agent)
            .collect())
    }

    // --- grants ---

    pub fn get_grant(
        &self,
        token: SymbolCode,
        grantor: AccountName,
        agent: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<Option<StakeGrant>, StoreError> {
        get_row(
            db_transaction,
            self.grants,
            &compose_key(&[token.raw(), grantor.raw(), agent.raw()]),
        )
    }

    pub fn put_grant(
        &self,
        grant: &StakeGrant,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(
            db_transaction,
            self.grants,
            &compose_key(&[grant.token.raw(), grant.grantor.raw(), grant.agent.raw()]),
            grant,
        )
    }

    pub fn delete_grant(
        &self,
        token: SymbolCode,
        grantor: AccountName,
        agent: AccountName,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        delete_row(
            db_transaction,
            self.grants,
            &compose_key(&[token.raw(), grantor.raw(), agent.raw()]),
        )
    }

    /// Outbound grants of `grantor`, in agent order.
    pub fn grants_by_grantor(
        &self,
        token: SymbolCode,
        grantor: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<Vec<StakeGrant>, StoreError> {
        Ok(scan_prefix(
            db_transaction,
            self.grants,
            &compose_key(&[token.raw(), grantor.raw()]),
        )?
        .into_iter()
        .map(|(_, grant)| grant)
        .collect())
    }

    /// Inbound grants of `agent`, in grantor order.
    ///
    /// Grants are keyed by grantor, so this scans every grant of the token.
    pub fn grants_to_agent(
        &self,
        token: SymbolCode,
        agent: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<Vec<StakeGrant>, StoreError> {
        Ok(
            scan_prefix::<StakeGrant>(db_transaction, self.grants, &compose_key(&[token.raw()]))?
                .into_iter()
                .filter(|(key, _)| decompose_key(key).get(2) == Some(&agent.raw()))
                .map(|(_, grant)| grant)
                .collect(),
        )
    }

    /// Every grant of every token, in key order.
    pub fn all_grants(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<Vec<StakeGrant>, StoreError> {
        Ok(scan_prefix(db_transaction, self.grants, &[])?
            .into_iter()
            .map(|(_, grant)| grant)
            .collect())
    }

    // --- params and stats ---

    pub fn get_params(
        &self,
        token: SymbolCode,
        db_transaction: &impl Transaction,
    ) -> Result<Option<StakeParams>, StoreError> {
        get_row(db_transaction, self.params, &token.to_key_bytes())
    }

    pub fn put_params(
        &self,
        token: SymbolCode,
        params: &StakeParams,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(db_transaction, self.params, &token.to_key_bytes(), params)
    }

    pub fn all_params(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<Vec<(SymbolCode, StakeParams)>, StoreError> {
        Ok(scan_prefix(db_transaction, self.params, &[])?
            .into_iter()
            .map(|(key, params)| (SymbolCode::from_raw(decompose_key(&key)[0]), params))
            .collect())
    }

    pub fn get_stat(
        &self,
        token: SymbolCode,
        db_transaction: &impl Transaction,
    ) -> Result<Option<StakeStat>, StoreError> {
        get_row(db_transaction, self.stats, &token.to_key_bytes())
    }

    pub fn put_stat(
        &self,
        token: SymbolCode,
        stat: &StakeStat,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(db_transaction, self.stats, &token.to_key_bytes(), stat)
    }

    pub fn all_stats(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<Vec<(SymbolCode, StakeStat)>, StoreError> {
        Ok(scan_prefix(db_transaction, self.stats, &[])?
            .into_iter()
            .map(|(key, stat)| (SymbolCode::from_raw(decompose_key(&key)[0]), stat))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmdb::EnvironmentFlags;
    use tempfile::TempDir;

    fn create_test_env() -> (TempDir, Environment) {
        let temp_dir = TempDir::new().unwrap();
        let env = Environment::new()
            .set_flags(EnvironmentFlags::empty())
            .set_max_dbs(10)
            .open(temp_dir.path())
            .unwrap();
        (temp_dir, env)
    }

    fn name(s: &str) -> AccountName {
        s.parse().unwrap()
    }

    #[test]
    fn test_agent_roundtrip_per_token() {
        let (_temp_dir, env) = create_test_env();
        StakeStore::create(&env).unwrap();
        let store = StakeStore::new(&env).unwrap();
        let sys: SymbolCode = "SYS".parse().unwrap();
        let other: SymbolCode = "OTHER".parse().unwrap();

        let mut agent = StakeAgent::new(sys, name("alice"), 1, 100);
        agent.balance = 500;

        let mut txn = env.begin_rw_txn().unwrap();
        store.put_agent(&agent, &mut txn).unwrap();
        txn.commit().unwrap();

        let txn = env.begin_ro_txn().unwrap();
        assert_eq!(store.get_agent(sys, name("alice"), &txn).unwrap(), Some(agent));
        assert!(store.get_agent(other, name("alice"), &txn).unwrap().is_none());
        assert_eq!(store.all_agents(&txn).unwrap().len(), 1);
    }

    #[test]
    fn test_grant_scans() {
        let (_temp_dir, env) = create_test_env();
        StakeStore::create(&env).unwrap();
        let store = StakeStore::new(&env).unwrap();
        let sys: SymbolCode = "SYS".parse().unwrap();

        let mut txn = env.begin_rw_txn().unwrap();
        for (grantor, agent) in [
            ("carol", "bob"),
            ("carol", "alice"),
            ("dave", "alice"),
            ("dave", "erin"),
        ] {
            let grant = StakeGrant::new(sys, name(grantor), name(agent));
            store.put_grant(&grant, &mut txn).unwrap();
        }
        txn.commit().unwrap();

        let txn = env.begin_ro_txn().unwrap();
        let outbound: Vec<_> = store
            .grants_by_grantor(sys, name("carol"), &txn)
            .unwrap()
            .iter()
            .map(|g| g.agent)
            .collect();
        assert_eq!(outbound, vec![name("alice"), name("bob")]);

        let inbound: Vec<_> = store
            .grants_to_agent(sys, name("alice"), &txn)
            .unwrap()
            .iter()
            .map(|g| g.grantor)
            .collect();
        assert_eq!(inbound, vec![name("carol"), name("dave")]);
        txn.abort();

        let mut txn = env.begin_rw_txn().unwrap();
        store
            .delete_grant(sys, name("carol"), name("alice"), &mut txn)
            .unwrap();
        // Deleting twice is harmless.
        store
            .delete_grant(sys, name("carol"), name("alice"), &mut txn)
            .unwrap();
        assert_eq!(store.grants_by_grantor(sys, name("carol"), &txn).unwrap().len(), 1);
        assert_eq!(store.all_grants(&txn).unwrap().len(), 3);
    }

    #[test]
    fn test_params_and_stats() {
        let (_temp_dir, env) = create_test_env();
        StakeStore::create(&env).unwrap();
        let store = StakeStore::new(&env).unwrap();
        let sys: SymbolCode = "SYS".parse().unwrap();

        let params = StakeParams {
            max_proxies: vec![30, 5],
            frame_length: 60,
        };
        let stat = StakeStat {
            total_staked: 1000,
            enabled: true,
        };

        let mut txn = env.begin_rw_txn().unwrap();
        assert!(store.get_params(sys, &txn).unwrap().is_none());
        store.put_params(sys, &params, &mut txn).unwrap();
        store.put_stat(sys, &stat, &mut txn).unwrap();
        txn.commit().unwrap();

        let txn = env.begin_ro_txn().unwrap();
        assert_eq!(store.get_params(sys, &txn).unwrap(), Some(params.clone()));
        assert_eq!(store.all_params(&txn).unwrap(), vec![(sys, params)]);
        assert_eq!(store.all_stats(&txn).unwrap(), vec![(sys, stat)]);
    }
}
