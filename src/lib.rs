#![deny(missing_docs)]
//! Crash-safe balanced splitting of a sharded table.
//!
//! Every shard of a table is split once at the integer midpoint of its key
//! range. The run is driven from a durable operation log so that it can be
//! stopped at any point and resumed without repeating or skipping a split,
//! and it throttles itself so that only a bounded number of fresh daughters
//! wait on post-split compaction at once.
//!
//! The cluster is reached through [`cluster::ClusterControl`]; log files go
//! through [`oplog::store::LogStore`]. [`job::BalancedSplit`] ties planning,
//! the log and the executor together.

mod observability;

/// Error type of a whole run.
pub mod error;

/// Fixed-width numeric keys and the row-key hashing scheme.
pub mod key;

/// Midpoint planning over shard ranges.
pub mod plan;

/// Durable operation log: codec, replay and storage backends.
pub mod oplog;

/// Control-plane seam and its local and in-memory implementations.
pub mod cluster;

/// Cancellable fixed-interval polling.
pub mod poll;

/// Waiting for post-split compaction.
pub mod compaction;

/// Split state machine and compaction window.
pub mod executor;

/// Run configuration.
pub mod option;

/// Plan-or-resume driver for a single table.
pub mod job;

pub use crate::{
    error::SplitError,
    executor::ExecutionReport,
    job::BalancedSplit,
    key::{KeySpace, KeyValue},
    option::SplitOptions,
    plan::{compute_plan, SplitOperation},
};
