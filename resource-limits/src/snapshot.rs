// Copyright (c) 2024 Botho Foundation

//! Resource state snapshots.
//!
//! A snapshot holds every row of every resource table at one block, so a
//! node can start from it instead of replaying usage from genesis.
//!
//! # Verification
//!
//! Each table carries a Merkle root over its rows in key order, and the
//! snapshot carries a digest over the singletons and all table roots. Two
//! nodes with identical resource state produce identical digests.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use thiserror::Error;

use crate::{
    stake::{StakeAgent, StakeGrant, StakeParams, StakeStat},
    state::{ResourceLimitsConfig, ResourceLimitsState, ResourceUsage},
    store::{ResourceDb, StoreError},
    types::SymbolCode,
};
use lmdb::{RwTransaction, Transaction};
use tracing::info;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Magic bytes for snapshot file identification
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"BTHRES\x00\x01";

/// Zstd compression level (3 = balanced speed/compression)
const COMPRESSION_LEVEL: i32 = 3;

/// Errors that can occur during snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("Merkle root verification failed: {0}")]
    MerkleVerification(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// One table: its row count, Merkle root and compressed rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub row_count: u64,
    pub merkle_root: [u8; 32],
    pub data: Vec<u8>,
}

impl TableSnapshot {
    fn new<T: Serialize>(rows: &[T]) -> Result<Self, SnapshotError> {
        let bytes =
            bincode::serialize(rows).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        Ok(Self {
            row_count: rows.len() as u64,
            merkle_root: table_root(rows)?,
            data: compress(&bytes)?,
        })
    }

    fn rows<T: DeserializeOwned>(&self) -> Result<Vec<T>, SnapshotError> {
        let decompressed = decompress(&self.data)?;
        bincode::deserialize(&decompressed)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    fn verify<T: Serialize + DeserializeOwned>(&self, table: &str) -> Result<(), SnapshotError> {
        let rows: Vec<T> = self.rows()?;
        if rows.len() as u64 != self.row_count {
            return Err(SnapshotError::Invalid(format!(
                "{table}: expected {} rows, found {}",
                self.row_count,
                rows.len()
            )));
        }
        if table_root(&rows)? != self.merkle_root {
            return Err(SnapshotError::MerkleVerification(format!(
                "{table} Merkle root mismatch"
            )));
        }
        Ok(())
    }
}

/// Complete resource accounting state at one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Snapshot format version for compatibility
    pub version: u32,

    /// Block at which the snapshot was taken
    pub block_num: u32,

    /// Digest over the singletons and every table root
    pub state_digest: [u8; 32],

    pub config: ResourceLimitsConfig,
    pub state: ResourceLimitsState,

    pub usage: TableSnapshot,
    pub agents: TableSnapshot,
    pub grants: TableSnapshot,
    pub params: TableSnapshot,
    pub stats: TableSnapshot,
}

impl ResourceSnapshot {
    /// Capture every resource table as seen by `db_transaction`.
    pub fn capture(
        db: &ResourceDb,
        db_transaction: &impl Transaction,
        block_num: u32,
    ) -> Result<Self, SnapshotError> {
        let config = db.limits.config(db_transaction)?;
        let state = db.limits.state(db_transaction)?;

        let usage = TableSnapshot::new(&db.usage.all(db_transaction)?)?;
        let agents = TableSnapshot::new(&db.stake.all_agents(db_transaction)?)?;
        let grants = TableSnapshot::new(&db.stake.all_grants(db_transaction)?)?;
        let params = TableSnapshot::new(&db.stake.all_params(db_transaction)?)?;
        let stats = TableSnapshot::new(&db.stake.all_stats(db_transaction)?)?;

        let mut snapshot = Self {
            version: SNAPSHOT_VERSION,
            block_num,
            state_digest: [0u8; 32],
            config,
            state,
            usage,
            agents,
            grants,
            params,
            stats,
        };
        snapshot.state_digest = snapshot.compute_digest()?;

        info!(
            block_num,
            accounts = snapshot.usage.row_count,
            agents = snapshot.agents.row_count,
            grants = snapshot.grants.row_count,
            "Captured resource snapshot"
        );
        Ok(snapshot)
    }

    pub fn get_usage(&self) -> Result<Vec<ResourceUsage>, SnapshotError> {
        self.usage.rows()
    }

    pub fn get_agents(&self) -> Result<Vec<StakeAgent>, SnapshotError> {
        self.agents.rows()
    }

    pub fn get_grants(&self) -> Result<Vec<StakeGrant>, SnapshotError> {
        self.grants.rows()
    }

    pub fn get_params(&self) -> Result<Vec<(SymbolCode, StakeParams)>, SnapshotError> {
        self.params.rows()
    }

    pub fn get_stats(&self) -> Result<Vec<(SymbolCode, StakeStat)>, SnapshotError> {
        self.stats.rows()
    }

    /// Verify the version, every table root and the state digest.
    pub fn verify(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                got: self.version,
            });
        }

        self.usage.verify::<ResourceUsage>("usage")?;
        self.agents.verify::<StakeAgent>("agents")?;
        self.grants.verify::<StakeGrant>("grants")?;
        self.params.verify::<(SymbolCode, StakeParams)>("params")?;
        self.stats.verify::<(SymbolCode, StakeStat)>("stats")?;

        if self.compute_digest()? != self.state_digest {
            return Err(SnapshotError::MerkleVerification(
                "State digest mismatch".to_string(),
            ));
        }
        Ok(())
    }

    /// Verify the snapshot and write it into an empty database.
    pub fn restore(
        &self,
        db: &ResourceDb,
        db_transaction: &mut RwTransaction,
    ) -> Result<(), SnapshotError> {
        self.verify()?;

        if db.limits.get_config(db_transaction)?.is_some()
            || !db.usage.all(db_transaction)?.is_empty()
            || !db.stake.all_agents(db_transaction)?.is_empty()
        {
            return Err(SnapshotError::Invalid(
                "Cannot restore into a non-empty database".to_string(),
            ));
        }

        db.limits.put_config(&self.config, db_transaction)?;
        db.limits.put_state(&self.state, db_transaction)?;
        for usage in self.get_usage()? {
            db.usage.put(&usage, db_transaction)?;
        }
        for agent in self.get_agents()? {
            db.stake.put_agent(&agent, db_transaction)?;
        }
        for grant in self.get_grants()? {
            db.stake.put_grant(&grant, db_transaction)?;
        }
        for (token, params) in self.get_params()? {
            db.stake.put_params(token, &params, db_transaction)?;
        }
        for (token, stat) in self.get_stats()? {
            db.stake.put_stat(token, &stat, db_transaction)?;
        }

        info!(block_num = self.block_num, "Restored resource snapshot");
        Ok(())
    }

    /// Write snapshot to a writer with magic header.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), SnapshotError> {
        writer.write_all(SNAPSHOT_MAGIC)?;

        let data =
            bincode::serialize(self).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        writer.write_all(&data)?;

        Ok(())
    }

    /// Read snapshot from a reader, verifying magic header.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, SnapshotError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Invalid(
                "Invalid snapshot magic bytes".to_string(),
            ));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        bincode::deserialize(&data).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    /// Get the compressed size of the table data.
    pub fn compressed_size(&self) -> u64 {
        [
            &self.usage,
            &self.agents,
            &self.grants,
            &self.params,
            &self.stats,
        ]
        .iter()
        .map(|table| table.data.len() as u64)
        .sum()
    }

    fn compute_digest(&self) -> Result<[u8; 32], SnapshotError> {
        let singletons = bincode::serialize(&(self.block_num, &self.config, &self.state))
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(SNAPSHOT_MAGIC);
        hasher.update(hash_leaf(&singletons));
        for table in [
            &self.usage,
            &self.agents,
            &self.grants,
            &self.params,
            &self.stats,
        ] {
            hasher.update(table.merkle_root);
        }
        Ok(hasher.finalize().into())
    }
}

// ============================================================================
// Merkle Tree Implementation
// ============================================================================

fn table_root<T: Serialize>(rows: &[T]) -> Result<[u8; 32], SnapshotError> {
    let hashes = rows
        .iter()
        .map(|row| {
            let bytes =
                bincode::serialize(row).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
            Ok(hash_leaf(&bytes))
        })
        .collect::<Result<Vec<_>, SnapshotError>>()?;
    Ok(compute_merkle_root(&hashes))
}

/// Hash a leaf node (single item).
fn hash_leaf(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]); // Leaf prefix
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash two child nodes to create parent.
fn hash_branch(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]); // Branch prefix
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Compute Merkle root from a list of leaf hashes.
///
/// Odd levels pair their last node with itself.
pub fn compute_merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut current_level = leaves.to_vec();
    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|pair| hash_branch(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }

    current_level[0]
}

// ============================================================================
// Compression Helpers
// ============================================================================

fn compress(data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    zstd::encode_all(data, COMPRESSION_LEVEL)
        .map_err(|e| SnapshotError::Compression(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    zstd::decode_all(data).map_err(|e| SnapshotError::Decompression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        manager::ResourceLimitsManager,
        stake::StakeActions,
        types::AccountName,
    };
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn name(s: &str) -> AccountName {
        s.parse().unwrap()
    }

    fn populated_db() -> (TempDir, ResourceDb) {
        let temp_dir = TempDir::new().unwrap();
        let db = ResourceDb::open(temp_dir.path()).unwrap();
        let config = EngineConfig {
            stake: Some(Default::default()),
            ..Default::default()
        };
        let manager = ResourceLimitsManager::from_config(&db, &config).unwrap();
        let actions = StakeActions::new(db.stake.clone());
        let token = manager.system_token();

        let mut txn = db.env().begin_rw_txn().unwrap();
        manager.initialize_database(&config, &mut txn).unwrap();
        for account in ["alice", "bob", "proxy"] {
            manager.initialize_account(name(account), &mut txn).unwrap();
        }
        actions.open_agent(token, name("alice"), 0, 0, &mut txn).unwrap();
        actions.open_agent(token, name("proxy"), 1, 0, &mut txn).unwrap();
        actions.stake(token, name("alice"), 1000, 0, &mut txn).unwrap();
        actions.stake(token, name("proxy"), 400, 0, &mut txn).unwrap();
        actions
            .delegate(token, name("proxy"), name("alice"), 300, 0, &mut txn)
            .unwrap();

        let accounts: BTreeSet<_> = [name("alice"), name("bob")].into_iter().collect();
        manager
            .add_transaction_usage(&accounts, 500, 200, 1, -1, &mut txn)
            .unwrap();
        manager.add_pending_ram_usage(name("bob"), 2048, &mut txn).unwrap();
        manager.process_block_usage(1, &mut txn).unwrap();
        txn.commit().unwrap();

        (temp_dir, db)
    }

    #[test]
    fn test_merkle_root_shapes() {
        assert_eq!(compute_merkle_root(&[]), [0u8; 32]);

        let a = hash_leaf(b"a");
        let b = hash_leaf(b"b");
        let c = hash_leaf(b"c");
        assert_eq!(compute_merkle_root(&[a]), a);
        assert_eq!(compute_merkle_root(&[a, b]), hash_branch(&a, &b));
        assert_eq!(
            compute_merkle_root(&[a, b, c]),
            hash_branch(&hash_branch(&a, &b), &hash_branch(&c, &c))
        );
        assert_ne!(compute_merkle_root(&[a, b]), compute_merkle_root(&[b, a]));
    }

    #[test]
    fn test_capture_and_verify() {
        let (_temp_dir, db) = populated_db();
        let txn = db.env().begin_ro_txn().unwrap();
        let snapshot = ResourceSnapshot::capture(&db, &txn, 1).unwrap();

        assert_eq!(snapshot.usage.row_count, 3);
        assert_eq!(snapshot.agents.row_count, 2);
        assert_eq!(snapshot.grants.row_count, 1);
        assert_eq!(snapshot.params.row_count, 1);
        assert_eq!(snapshot.stats.row_count, 1);
        assert!(snapshot.verify().is_ok());
        assert!(snapshot.compressed_size() > 0);

        // Capturing the same state twice gives the same digest.
        let again = ResourceSnapshot::capture(&db, &txn, 1).unwrap();
        assert_eq!(again.state_digest, snapshot.state_digest);
    }

    #[test]
    fn test_tampering_detected() {
        let (_temp_dir, db) = populated_db();
        let txn = db.env().begin_ro_txn().unwrap();
        let snapshot = ResourceSnapshot::capture(&db, &txn, 1).unwrap();

        let mut usage = snapshot.get_usage().unwrap();
        usage[0].ram_usage += 1;
        let mut tampered = snapshot.clone();
        tampered.usage.data = compress(&bincode::serialize(&usage).unwrap()).unwrap();
        assert!(matches!(
            tampered.verify(),
            Err(SnapshotError::MerkleVerification(_))
        ));

        let mut tampered = snapshot.clone();
        tampered.state.virtual_cpu_limit += 1;
        assert!(matches!(
            tampered.verify(),
            Err(SnapshotError::MerkleVerification(_))
        ));

        let mut wrong_version = snapshot;
        wrong_version.version = SNAPSHOT_VERSION + 1;
        assert!(matches!(
            wrong_version.verify(),
            Err(SnapshotError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_write_read_restore() {
        let (_temp_dir, db) = populated_db();
        let txn = db.env().begin_ro_txn().unwrap();
        let snapshot = ResourceSnapshot::capture(&db, &txn, 1).unwrap();
        txn.abort();

        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..8], SNAPSHOT_MAGIC);
        let loaded = ResourceSnapshot::read_from(&buf[..]).unwrap();
        assert_eq!(loaded, snapshot);

        let restored_dir = TempDir::new().unwrap();
        let restored = ResourceDb::open(restored_dir.path()).unwrap();
        let mut txn = restored.env().begin_rw_txn().unwrap();
        loaded.restore(&restored, &mut txn).unwrap();
        txn.commit().unwrap();

        let txn = restored.env().begin_ro_txn().unwrap();
        let recaptured = ResourceSnapshot::capture(&restored, &txn, 1).unwrap();
        assert_eq!(recaptured.state_digest, snapshot.state_digest);
        txn.abort();

        // A second restore into the now-populated database is refused.
        let mut txn = restored.env().begin_rw_txn().unwrap();
        assert!(matches!(
            loaded.restore(&restored, &mut txn),
            Err(SnapshotError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let result = ResourceSnapshot::read_from(&b"NOTASNAPxxxx"[..]);
        assert!(matches!(result, Err(SnapshotError::Invalid(_))));
    }
}
