// Copyright (c) 2024 Botho Foundation

//! Per-account CPU, NET and RAM usage.

use super::{get_row, put_row, scan_prefix, StoreError};
use crate::{state::ResourceUsage, types::AccountName};
use lmdb::{Database, DatabaseFlags, Environment, RwTransaction, Transaction};

// LMDB Database names.
/// Maps account name -> ResourceUsage
pub const USAGE_DB_NAME: &str = "resource_limits:usage_by_account";

#[derive(Clone)]
pub struct ResourceUsageStore {
    usage_by_account: Database,
}

impl ResourceUsageStore {
    /// Opens an existing ResourceUsageStore.
    pub fn new(env: &Environment) -> Result<Self, StoreError> {
        Ok(ResourceUsageStore {
            usage_by_account: env.open_db(Some(USAGE_DB_NAME))?,
        })
    }

    /// Creates a fresh ResourceUsageStore.
    pub fn create(env: &Environment) -> Result<(), StoreError> {
        env.create_db(Some(USAGE_DB_NAME), DatabaseFlags::empty())?;
        Ok(())
    }

    pub fn get(
        &self,
        account: AccountName,
        db_transaction: &impl Transaction,
    ) -> Result<Option<ResourceUsage>, StoreError> {
        get_row(db_transaction, self.usage_by_account, &account.to_key_bytes())
    }

    pub fn put(
        &self,
        usage: &ResourceUsage,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(
            db_transaction,
            self.usage_by_account,
            &usage.owner.to_key_bytes(),
            usage,
        )
    }

    /// Every usage row, in account order.
    pub fn all(&self, db_transaction: &impl Transaction) -> Result<Vec<ResourceUsage>, StoreError> {
        Ok(scan_prefix(db_transaction, self.usage_by_account, &[])?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }
}
