//! In-memory control plane.
//!
//! `MemCluster` keeps shard topology in a map and fakes the asynchronous parts
//! of a split: daughters can stay offline for a number of lookups, and their
//! column-family directories can keep listing a reference artifact for a
//! number of listings. Transient failures can be injected. It backs dry runs
//! and the crate's tests.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_lock::Mutex;

use crate::cluster::{ClusterControl, ClusterError, ShardBounds, ShardLocation, ShardRef};

#[derive(Debug, Clone)]
struct MemShard {
    end: Vec<u8>,
    name: String,
    offline_lookups: u32,
}

#[derive(Debug, Default)]
struct MemTable {
    families: Vec<String>,
    shards: BTreeMap<Vec<u8>, MemShard>,
}

#[derive(Debug, Default)]
struct MemState {
    workers: usize,
    tables: HashMap<String, MemTable>,
    reference_lists: HashMap<PathBuf, u32>,
    online_delay: u32,
    reference_rounds: u32,
    failures: u32,
    next_shard: u64,
    split_requests: Vec<(String, Vec<u8>)>,
    list_calls: usize,
}

impl MemState {
    fn shard_name(&mut self) -> String {
        self.next_shard += 1;
        format!("s{:06}", self.next_shard)
    }

    fn inject_failure(&mut self) -> Result<(), ClusterError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(ClusterError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut MemTable, ClusterError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| ClusterError::TableNotFound(table.to_string()))
    }

    fn split(&mut self, table: &str, key: &[u8]) -> Result<(), ClusterError> {
        let lower_name = self.shard_name();
        let upper_name = self.shard_name();
        let online_delay = self.online_delay;
        let reference_rounds = self.reference_rounds;

        let entry = self.table_mut(table)?;
        let (start, parent) = owner(entry, key)
            .map(|(start, shard)| (start.clone(), shard.clone()))
            .ok_or_else(|| ClusterError::Rejected("no shard owns the split key".to_string()))?;
        if start.as_slice() == key {
            return Err(ClusterError::Rejected(
                "split key is already a shard boundary".to_string(),
            ));
        }

        entry.shards.insert(
            start,
            MemShard {
                end: key.to_vec(),
                name: lower_name.clone(),
                offline_lookups: online_delay,
            },
        );
        entry.shards.insert(
            key.to_vec(),
            MemShard {
                end: parent.end.clone(),
                name: upper_name.clone(),
                offline_lookups: online_delay,
            },
        );
        let families = entry.families.clone();

        for name in [&lower_name, &upper_name] {
            for family in &families {
                self.reference_lists
                    .insert(family_dir(table, name, family), reference_rounds);
            }
        }
        Ok(())
    }
}

fn owner<'a>(table: &'a MemTable, key: &[u8]) -> Option<(&'a Vec<u8>, &'a MemShard)> {
    let (start, shard) = table.shards.range(..=key.to_vec()).next_back()?;
    if shard.end.is_empty() || key < shard.end.as_slice() {
        Some((start, shard))
    } else {
        None
    }
}

fn family_dir(table: &str, shard: &str, family: &str) -> PathBuf {
    PathBuf::from(table).join(shard).join(family)
}

/// Builder for [`MemCluster`].
#[derive(Debug, Default)]
pub struct MemClusterBuilder {
    state: MemState,
}

impl MemClusterBuilder {
    /// Number of workers reported by the cluster.
    pub fn workers(mut self, workers: usize) -> Self {
        self.state.workers = workers;
        self
    }

    /// Add a table whose shards are delimited by `splits` (ascending raw
    /// keys). No splits gives a single shard covering the whole table.
    pub fn table<K: AsRef<[u8]>>(mut self, table: &str, families: &[&str], splits: &[K]) -> Self {
        let mut bounds: Vec<Vec<u8>> = vec![Vec::new()];
        bounds.extend(splits.iter().map(|k| k.as_ref().to_vec()));
        let mut shards = BTreeMap::new();
        for (idx, start) in bounds.iter().enumerate() {
            let end = bounds.get(idx + 1).cloned().unwrap_or_default();
            let name = self.state.shard_name();
            shards.insert(
                start.clone(),
                MemShard {
                    end,
                    name,
                    offline_lookups: 0,
                },
            );
        }
        self.state.tables.insert(
            table.to_string(),
            MemTable {
                families: families.iter().map(|f| f.to_string()).collect(),
                shards,
            },
        );
        self
    }

    /// Lookups for which a new daughter still reports offline.
    pub fn online_delay(mut self, lookups: u32) -> Self {
        self.state.online_delay = lookups;
        self
    }

    /// Listings of a daughter family directory that still show a reference.
    pub fn reference_rounds(mut self, rounds: u32) -> Self {
        self.state.reference_rounds = rounds;
        self
    }

    /// Finish building.
    pub fn build(self) -> MemCluster {
        MemCluster {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

/// In-memory [`ClusterControl`].
#[derive(Debug, Clone)]
pub struct MemCluster {
    state: Arc<Mutex<MemState>>,
}

impl MemCluster {
    /// Start building a cluster.
    pub fn builder() -> MemClusterBuilder {
        MemClusterBuilder::default()
    }

    /// Fail the next `count` calls of any kind with
    /// [`ClusterError::Unavailable`].
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.failures = count;
    }

    /// Split outside of the controller, as another operator would.
    pub async fn split_now(&self, table: &str, key: &[u8]) -> Result<(), ClusterError> {
        self.state.lock().await.split(table, key)
    }

    /// Split keys requested through [`ClusterControl::split_shard`], in order.
    pub async fn split_requests(&self, table: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .split_requests
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Number of directory listings served so far.
    pub async fn list_calls(&self) -> usize {
        self.state.lock().await.list_calls
    }
}

impl ClusterControl for MemCluster {
    async fn shard_boundaries(&self, table: &str) -> Result<Vec<ShardBounds>, ClusterError> {
        let mut state = self.state.lock().await;
        state.inject_failure()?;
        let entry = state.table_mut(table)?;
        Ok(entry
            .shards
            .iter()
            .map(|(start, shard)| ShardBounds {
                start: start.clone(),
                end: shard.end.clone(),
            })
            .collect())
    }

    async fn locate_shard(&self, table: &str, key: &[u8]) -> Result<ShardLocation, ClusterError> {
        let mut state = self.state.lock().await;
        state.inject_failure()?;
        let entry = state.table_mut(table)?;
        let start = owner(entry, key)
            .map(|(start, _)| start.clone())
            .ok_or_else(|| ClusterError::Rejected("no shard owns the key".to_string()))?;
        let shard = entry
            .shards
            .get_mut(&start)
            .ok_or_else(|| ClusterError::Catalog("shard vanished during lookup".to_string()))?;
        let online = shard.offline_lookups == 0;
        shard.offline_lookups = shard.offline_lookups.saturating_sub(1);
        Ok(ShardLocation {
            shard: ShardRef {
                name: shard.name.clone(),
                start_key: start,
            },
            online,
        })
    }

    async fn split_shard(&self, table: &str, split_key: &[u8]) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.inject_failure()?;
        state.split(table, split_key)?;
        state
            .split_requests
            .push((table.to_string(), split_key.to_vec()));
        Ok(())
    }

    async fn worker_count(&self) -> Result<usize, ClusterError> {
        let mut state = self.state.lock().await;
        state.inject_failure()?;
        Ok(state.workers)
    }

    async fn column_family_dirs(
        &self,
        table: &str,
        shard: &ShardRef,
    ) -> Result<Vec<PathBuf>, ClusterError> {
        let mut state = self.state.lock().await;
        state.inject_failure()?;
        let entry = state.table_mut(table)?;
        Ok(entry
            .families
            .iter()
            .map(|family| family_dir(table, &shard.name, family))
            .collect())
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, ClusterError> {
        let mut state = self.state.lock().await;
        state.inject_failure()?;
        state.list_calls += 1;
        match state.reference_lists.get_mut(dir) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(vec![dir.join("00c0ffee"), dir.join("00c0ffee.parent")])
            }
            Some(_) => Ok(vec![dir.join("00c0ffee")]),
            None => Ok(Vec::new()),
        }
    }
}
