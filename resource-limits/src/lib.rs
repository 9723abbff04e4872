// Copyright (c) 2024 Botho Foundation

//! Deterministic resource accounting for block producers.
//!
//! Every account is charged for the CPU time and NET bandwidth its
//! transactions consume and for the RAM its state occupies. An account's
//! share of each resource is proportional to the stake it controls, where
//! stake may be held directly or proxied through a graph of stake agents.
//!
//! ## Key Concepts
//!
//! - **Usage accumulator**: a decaying moving average over a window of time
//!   slots. Accounts are charged against the average, so bursts are allowed
//!   while sustained use is limited.
//! - **Elastic block limit**: the virtual CPU/NET limit shared among stakers.
//!   It contracts while blocks are congested and expands while they are idle,
//!   between the real block maximum and `max * max_multiplier`.
//! - **Stake agent**: an account's position in the stake pool. Agents at a
//!   higher proxy level may grant part of their stake to lower-level agents
//!   and are credited with it as `proxied` stake.
//! - **Privileged account**: never limited.
//!
//! All state lives in an LMDB environment ([`ResourceDb`]). Every operation
//! takes the caller's transaction, and an error leaves that transaction to
//! be aborted, which discards the partial update.

pub mod accumulator;
pub mod config;
pub mod elastic;
pub mod error;
pub mod manager;
pub mod math;
pub mod snapshot;
pub mod stake;
pub mod state;
pub mod store;
pub mod types;

pub use accumulator::UsageAccumulator;
pub use config::{EngineConfig, LimitsConfig, RamConfig, StakeConfig, DEFAULT_SYSTEM_TOKEN};
pub use elastic::{update_elastic_limit, ElasticLimitParameters};
pub use error::ResourceLimitsError;
pub use manager::{AccountPrivileges, NoPrivileges, ResourceLimitsManager};
pub use math::{PERCENT_100, RATE_LIMITING_PRECISION};
pub use snapshot::{ResourceSnapshot, SnapshotError, SNAPSHOT_VERSION};
pub use stake::{
    ProxyTraversal, StakeActions, StakeAgent, StakeGrant, StakeParams, StakeStat, MAX_PROXY_DEPTH,
};
pub use state::{AccountResourceLimit, ResourceLimitsConfig, ResourceLimitsState, ResourceUsage};
pub use store::{ResourceDb, StoreError};
pub use types::{AccountName, NameError, ResourcePurpose, SymbolCode};
