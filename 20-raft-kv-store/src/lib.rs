//! Replicated key-value store over Raft.
//!
//! Every write becomes a command in the Raft log. Once an entry is committed,
//! each node applies it to its own in-memory map, so all replicas converge on
//! the same state. Reads are served from the local map.
//!
//! # Architecture
//!
//! - **Store facade** ([`kv::Store`]): leader-gated `set`/`delete`, local
//!   `get`, plus `join` ([`membership`]) and `status` ([`topology`])
//! - **State machine** ([`fsm`]): applies committed commands, takes and
//!   restores snapshots
//! - **Consensus** ([`consensus::Consensus`]): the engine the store writes
//!   through, implemented on tikv/raft by [`engine`] and in memory by
//!   [`testing`]
//! - **HTTP** ([`http`]): the axum front end the `node` binary serves
//!
//! The raft worker is a plain thread fed by crossbeam channels; the HTTP side
//! runs on tokio and hands blocking store calls to the blocking pool.
//!
//! # Modules
//!
//! - [`command`]: wire format of replicated commands
//! - [`store`]: the shared key-value map
//! - [`snapshot`]: snapshot sinks and on-disk retention
//! - [`config`]: store and engine settings
//! - [`error`]: errors returned to the front end

pub mod command;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod http;
pub mod kv;
pub mod membership;
pub mod snapshot;
pub mod store;
pub mod topology;

/// Testing utilities for integration tests.
pub mod testing;
