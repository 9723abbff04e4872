// Copyright (c) 2024 Botho Foundation

//! Chain-wide singletons: the resource limits configuration and live state.

use super::{get_row, put_row, StoreError};
use crate::state::{ResourceLimitsConfig, ResourceLimitsState};
use lmdb::{Database, DatabaseFlags, Environment, RwTransaction, Transaction};

// LMDB Database names.
/// Maps singleton key -> row
pub const SINGLETONS_DB_NAME: &str = "resource_limits:singletons";

const CONFIG_KEY: &[u8] = b"config";
const STATE_KEY: &[u8] = b"state";

#[derive(Clone)]
pub struct ResourceLimitsStore {
    singletons: Database,
}

impl ResourceLimitsStore {
    /// Opens an existing ResourceLimitsStore.
    pub fn new(env: &Environment) -> Result<Self, StoreError> {
        Ok(ResourceLimitsStore {
            singletons: env.open_db(Some(SINGLETONS_DB_NAME))?,
        })
    }

    /// Creates a fresh ResourceLimitsStore.
    pub fn create(env: &Environment) -> Result<(), StoreError> {
        env.create_db(Some(SINGLETONS_DB_NAME), DatabaseFlags::empty())?;
        Ok(())
    }

    pub fn get_config(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<Option<ResourceLimitsConfig>, StoreError> {
        get_row(db_transaction, self.singletons, CONFIG_KEY)
    }

    /// The configuration, which must have been initialized.
    pub fn config(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<ResourceLimitsConfig, StoreError> {
        self.get_config(db_transaction)?
            .ok_or(StoreError::MissingSingleton("config"))
    }

    pub fn put_config(
        &self,
        config: &ResourceLimitsConfig,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(db_transaction, self.singletons, CONFIG_KEY, config)
    }

    pub fn get_state(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<Option<ResourceLimitsState>, StoreError> {
        get_row(db_transaction, self.singletons, STATE_KEY)
    }

    /// The live state, which must have been initialized.
    pub fn state(
        &self,
        db_transaction: &impl Transaction,
    ) -> Result<ResourceLimitsState, StoreError> {
        self.get_state(db_transaction)?
            .ok_or(StoreError::MissingSingleton("state"))
    }

    pub fn put_state(
        &self,
        state: &ResourceLimitsState,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), StoreError> {
        put_row(db_transaction, self.singletons, STATE_KEY, state)
    }
}
