// Copyright (c) 2024 Botho Foundation

//! LMDB-backed persistence for the accounting engine.
//!
//! Every logical table lives in its own named database. Rows are bincode
//! encoded; keys are concatenations of big-endian u64 identifiers, so a
//! prefix scan returns rows in key order. All access goes through a caller
//! supplied transaction: reads through anything implementing
//! [`lmdb::Transaction`], writes through an [`lmdb::RwTransaction`]. Aborting
//! that transaction discards every write made by the engine within it.

mod limits_store;
mod stake_store;
mod usage_store;

pub use limits_store::{ResourceLimitsStore, SINGLETONS_DB_NAME};
pub use stake_store::{
    StakeStore, STAKE_AGENTS_DB_NAME, STAKE_GRANTS_DB_NAME, STAKE_PARAMS_DB_NAME,
    STAKE_STATS_DB_NAME,
};
pub use usage_store::{ResourceUsageStore, USAGE_DB_NAME};

use lmdb::{
    Cursor, Database, Environment, EnvironmentFlags, RwTransaction, Transaction, WriteFlags,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::info;

/// Number of named databases the environment must accommodate.
const MAX_DBS: u32 = 8;

/// Default LMDB map size (1GB).
const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// File holding the environment inside the state directory.
const DB_FILE_NAME: &str = "resources.mdb";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("LMDB error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Singleton '{0}' has not been initialized")]
    MissingSingleton(&'static str),
}

/// Read and decode one row. A missing key is `Ok(None)`.
pub(crate) fn get_row<T: DeserializeOwned>(
    db_transaction: &impl Transaction,
    db: Database,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match db_transaction.get(db, &key) {
        Ok(bytes) => bincode::deserialize(bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(StoreError::Lmdb(e)),
    }
}

/// Encode and write one row, replacing any previous value.
pub(crate) fn put_row<T: Serialize>(
    db_transaction: &mut RwTransaction,
    db: Database,
    key: &[u8],
    row: &T,
) -> Result<(), StoreError> {
    let bytes = bincode::serialize(row).map_err(|e| StoreError::Serialization(e.to_string()))?;
    db_transaction.put(db, &key, &bytes, WriteFlags::empty())?;
    Ok(())
}

/// Delete one row. Deleting a missing row is not an error.
pub(crate) fn delete_row(
    db_transaction: &mut RwTransaction,
    db: Database,
    key: &[u8],
) -> Result<(), StoreError> {
    match db_transaction.del(db, &key, None) {
        Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
        Err(e) => Err(StoreError::Lmdb(e)),
    }
}

/// Decode every row whose key starts with `prefix`, in key order.
pub(crate) fn scan_prefix<T: DeserializeOwned>(
    db_transaction: &impl Transaction,
    db: Database,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, T)>, StoreError> {
    let mut cursor = db_transaction.open_ro_cursor(db)?;
    let mut rows = Vec::new();

    let iter = if prefix.is_empty() {
        cursor.iter_start()
    } else {
        cursor.iter_from(prefix)
    };
    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        let row = bincode::deserialize(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        rows.push((key.to_vec(), row));
    }

    Ok(rows)
}

/// Concatenate u64 identifiers into a big-endian key.
pub(crate) fn compose_key(parts: &[u64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.len() * 8);
    for part in parts {
        key.extend_from_slice(&part.to_be_bytes());
    }
    key
}

/// Split a composed key back into its u64 identifiers.
pub(crate) fn decompose_key(key: &[u8]) -> Vec<u64> {
    key.chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            u64::from_be_bytes(bytes)
        })
        .collect()
}

/// The LMDB environment together with a handle on every table.
pub struct ResourceDb {
    env: Environment,
    pub usage: ResourceUsageStore,
    pub limits: ResourceLimitsStore,
    pub stake: StakeStore,
}

impl ResourceDb {
    /// Open or create the state database in the directory `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Open or create the state database with an explicit LMDB map size.
    pub fn open_with_map_size(path: &Path, map_size: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(path)?;

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SUB_DIR)
            .set_max_dbs(MAX_DBS)
            .set_map_size(map_size)
            .open(&path.join(DB_FILE_NAME))?;

        ResourceUsageStore::create(&env)?;
        ResourceLimitsStore::create(&env)?;
        StakeStore::create(&env)?;

        let db = Self {
            usage: ResourceUsageStore::new(&env)?,
            limits: ResourceLimitsStore::new(&env)?,
            stake: StakeStore::new(&env)?,
            env,
        };

        info!(path = %path.display(), "Opened resource limits database");
        Ok(db)
    }

    /// The underlying environment, used to begin transactions.
    pub fn env(&self) -> &Environment {
        &self.env
    }
}
