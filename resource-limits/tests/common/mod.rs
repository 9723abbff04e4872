// Copyright (c) 2024 Botho Foundation
//
//! Common test utilities for accounting integration tests.
//!
//! Every test gets its own LMDB environment in a temporary directory, with
//! the genesis configuration already committed.

#![allow(dead_code)]

use std::collections::BTreeSet;

use bth_resource_limits::{
    AccountName, EngineConfig, ResourceDb, ResourceLimitsManager, StakeActions, StakeConfig,
    SymbolCode,
};
use lmdb::Transaction;
use tempfile::TempDir;

/// A committed genesis database plus the handles tests drive it with.
pub struct TestEngine {
    pub db: ResourceDb,
    pub manager: ResourceLimitsManager,
    pub actions: StakeActions,
    pub token: SymbolCode,
    _temp_dir: TempDir,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        init_logging();

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = ResourceDb::open(temp_dir.path()).expect("Failed to open resource db");
        let manager =
            ResourceLimitsManager::from_config(&db, &config).expect("Failed to create manager");
        let actions = StakeActions::new(db.stake.clone());
        let token = manager.system_token();

        let mut txn = db.env().begin_rw_txn().unwrap();
        manager
            .initialize_database(&config, &mut txn)
            .expect("Failed to initialize database");
        txn.commit().unwrap();

        Self {
            db,
            manager,
            actions,
            token,
            _temp_dir: temp_dir,
        }
    }

    /// Default limits with staking configured for two proxy levels.
    pub fn with_stake() -> Self {
        Self::new(EngineConfig {
            stake: Some(StakeConfig {
                frame_length: 60,
                max_proxies: vec![2, 1],
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Create usage rows for `names` in a committed transaction.
    pub fn create_accounts(&self, names: &[&str]) {
        let mut txn = self.db.env().begin_rw_txn().unwrap();
        for n in names {
            self.manager.initialize_account(name(n), &mut txn).unwrap();
        }
        txn.commit().unwrap();
    }
}

pub fn name(s: &str) -> AccountName {
    s.parse().expect("invalid account name")
}

pub fn accounts(names: &[&str]) -> BTreeSet<AccountName> {
    names.iter().map(|n| name(n)).collect()
}

/// Route engine logs to the test harness; set `RUST_LOG` to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
