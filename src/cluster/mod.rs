//! Control-plane seam.
//!
//! The controller never splits or compacts anything itself. It asks a
//! [`ClusterControl`] implementation to split, looks shards up to watch the
//! daughters come online, and lists shard data directories to see whether
//! post-split compaction has finished.

pub mod local;
pub mod mem;

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors reported by a control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The control plane could not be reached or answered with a transient
    /// failure. Pollers retry these.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    /// The table does not exist.
    #[error("table {0} not found")]
    TableNotFound(String),
    /// The request was refused.
    #[error("cluster rejected request: {0}")]
    Rejected(String),
    /// Cluster metadata could not be read or written.
    #[error("cluster catalog error: {0}")]
    Catalog(String),
}

impl ClusterError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_))
    }
}

/// Raw boundaries of one shard, as stored by the cluster.
///
/// An empty key is the open start or end of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardBounds {
    /// First key of the shard.
    pub start: Vec<u8>,
    /// First key past the shard.
    pub end: Vec<u8>,
}

/// Identity of a shard, enough to find its data directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardRef {
    /// Encoded shard name, unique within the table.
    pub name: String,
    /// Raw start key.
    pub start_key: Vec<u8>,
}

/// Result of looking up the shard that owns a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocation {
    /// The owning shard.
    pub shard: ShardRef,
    /// Whether the shard is serving.
    pub online: bool,
}

/// Operations the controller consumes from the cluster.
pub trait ClusterControl {
    /// Current boundaries of every shard of `table`.
    fn shard_boundaries(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<Vec<ShardBounds>, ClusterError>> + Send;

    /// Shard that currently owns `key`, bypassing any cached location.
    fn locate_shard(
        &self,
        table: &str,
        key: &[u8],
    ) -> impl Future<Output = Result<ShardLocation, ClusterError>> + Send;

    /// Ask the cluster to split the shard owning `split_key` at that key.
    ///
    /// The split completes asynchronously; callers poll
    /// [`ClusterControl::locate_shard`] to see the daughter.
    fn split_shard(
        &self,
        table: &str,
        split_key: &[u8],
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Number of workers serving shards.
    fn worker_count(&self) -> impl Future<Output = Result<usize, ClusterError>> + Send;

    /// One data directory per column family of `shard`.
    fn column_family_dirs(
        &self,
        table: &str,
        shard: &ShardRef,
    ) -> impl Future<Output = Result<Vec<PathBuf>, ClusterError>> + Send;

    /// Files inside `dir`. A missing directory lists as empty.
    fn list_dir(&self, dir: &Path)
        -> impl Future<Output = Result<Vec<PathBuf>, ClusterError>> + Send;

    /// Whether `file` is a reference left by a split and not yet compacted.
    fn is_reference_artifact(&self, file: &Path) -> bool {
        is_reference_file(file)
    }
}

/// `<hex-file-id>.<parent-shard-name>`: a half-file pointing back into the
/// parent shard's data.
static REFERENCE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]+\.[0-9a-z]+$").expect("reference name regex is valid"));

/// Default reference artifact rule, by file name.
pub fn is_reference_file(file: &Path) -> bool {
    file.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| REFERENCE_NAME.is_match(name))
}
