// Copyright (c) 2024 Botho Foundation

//! Recoverable errors of the accounting engine.
//!
//! Any of these aborts the current store transaction only; the caller turns
//! it into a failed transaction (or a rejected configuration action).
//! Internal-consistency violations are not represented here: they panic.

use crate::{
    store::StoreError,
    types::{AccountName, ResourcePurpose, SymbolCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceLimitsError {
    // --- resource exhaustion ---
    #[error("authorizing account '{account}' has insufficient cpu resources: used {used}, max {max}")]
    TxCpuUsageExceeded { account: AccountName, used: i64, max: i64 },

    #[error("authorizing account '{account}' has insufficient net resources: used {used}, max {max}")]
    TxNetUsageExceeded { account: AccountName, used: i64, max: i64 },

    #[error("block has insufficient {resource} resources: pending {pending}, max {max}")]
    BlockResourceExhausted {
        resource: ResourcePurpose,
        pending: u64,
        max: u64,
    },

    #[error("ram usage of '{account}' overflows: current {current}, delta {delta}")]
    RamUsageOverflow { account: AccountName, current: u64, delta: i64 },

    #[error("ram usage of '{account}' underflows: current {current}, delta {delta}")]
    RamUsageUnderflow { account: AccountName, current: u64, delta: i64 },

    #[error("account '{account}' has insufficient ram: used {used}, max {max}")]
    RamUsageExceeded { account: AccountName, used: i64, max: i64 },

    // --- configuration ---
    #[error("invalid elastic limit parameters: {0}")]
    InvalidElasticLimit(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- not found ---
    #[error("no resource usage row for account '{0}'")]
    AccountNotFound(AccountName),

    #[error("resource usage row for account '{0}' already exists")]
    AccountAlreadyExists(AccountName),

    #[error("stake agent '{account}' not found for token {token}")]
    AgentNotFound { token: SymbolCode, account: AccountName },

    #[error("grant from '{grantor}' to '{agent}' not found for token {token}")]
    GrantNotFound {
        token: SymbolCode,
        grantor: AccountName,
        agent: AccountName,
    },

    #[error("stake is not configured for token {0}")]
    StakeNotConfigured(SymbolCode),

    // --- stake actions ---
    #[error("stake agent '{account}' already exists for token {token}")]
    AgentAlreadyExists { token: SymbolCode, account: AccountName },

    #[error("insufficient funds for '{account}': available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountName,
        available: i64,
        requested: i64,
    },

    #[error("invalid proxy level: {0}")]
    InvalidProxyLevel(String),

    #[error("agent '{0}' cannot hold more grants at its proxy level")]
    TooManyGrants(AccountName),

    #[error("terms of agent '{agent}' violate the grant: {reason}")]
    AgentTermsViolated { agent: AccountName, reason: String },

    #[error("agent '{0}' has grants and cannot change its proxy level")]
    AgentHasGrants(AccountName),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    // --- storage ---
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<lmdb::Error> for ResourceLimitsError {
    fn from(err: lmdb::Error) -> Self {
        ResourceLimitsError::Store(StoreError::Lmdb(err))
    }
}
