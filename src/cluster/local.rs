//! Filesystem-backed single-node control plane.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<table>/.shards.json          shard catalog
//! <root>/<table>/<shard>/<family>/...  shard data files
//! ```
//!
//! A split here is synchronous: daughters are created with full copies of
//! the parent's files, the catalog is rewritten atomically, and the parent
//! directory is removed. Daughters are online as soon as the catalog is
//! written and carry no reference artifacts.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_lock::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use ulid::Ulid;

use crate::{
    cluster::{ClusterControl, ClusterError, ShardBounds, ShardLocation, ShardRef},
    observability::log_debug,
};

/// Name of the catalog file inside a table directory.
pub const CATALOG_FILE_NAME: &str = ".shards.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Catalog {
    families: Vec<String>,
    shards: Vec<CatalogShard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogShard {
    start: String,
    end: String,
    name: String,
    #[serde(default = "serving")]
    online: bool,
}

fn serving() -> bool {
    true
}

impl Catalog {
    fn owner(&self, key: &[u8]) -> Option<usize> {
        self.shards.iter().position(|shard| {
            shard.start.as_bytes() <= key && (shard.end.is_empty() || key < shard.end.as_bytes())
        })
    }
}

fn new_shard_name() -> String {
    Ulid::new().to_string().to_lowercase()
}

fn key_text(key: &[u8]) -> Result<String, ClusterError> {
    String::from_utf8(key.to_vec())
        .map_err(|_| ClusterError::Rejected("shard keys must be utf-8 text".to_string()))
}

fn catalog_err(action: &str, path: &Path, err: impl std::fmt::Display) -> ClusterError {
    ClusterError::Catalog(format!("failed to {action} {}: {err}", path.display()))
}

/// [`ClusterControl`] over a local directory tree.
#[derive(Debug)]
pub struct LocalCluster {
    root: PathBuf,
    catalog_lock: Mutex<()>,
}

impl LocalCluster {
    /// Serve tables stored under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            catalog_lock: Mutex::new(()),
        }
    }

    /// Directory of `table`.
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    /// Create `table` with the given column families and shards delimited by
    /// `splits` (ascending raw keys).
    pub async fn create_table<K: AsRef<[u8]>>(
        &self,
        table: &str,
        families: &[&str],
        splits: &[K],
    ) -> Result<(), ClusterError> {
        let _guard = self.catalog_lock.lock().await;
        let catalog_path = self.catalog_path(table);
        match fs::metadata(&catalog_path).await {
            Ok(_) => {
                return Err(ClusterError::Rejected(format!("table {table} already exists")));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(catalog_err("stat", &catalog_path, err)),
        }

        let mut bounds = vec![String::new()];
        for split in splits {
            bounds.push(key_text(split.as_ref())?);
        }
        let mut shards = Vec::with_capacity(bounds.len());
        for (idx, start) in bounds.iter().enumerate() {
            shards.push(CatalogShard {
                start: start.clone(),
                end: bounds.get(idx + 1).cloned().unwrap_or_default(),
                name: new_shard_name(),
                online: true,
            });
        }
        let catalog = Catalog {
            families: families.iter().map(|f| f.to_string()).collect(),
            shards,
        };
        for shard in &catalog.shards {
            for family in &catalog.families {
                let dir = self.family_dir(table, &shard.name, family);
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|err| catalog_err("create", &dir, err))?;
            }
        }
        self.store_catalog(table, &catalog).await
    }

    fn catalog_path(&self, table: &str) -> PathBuf {
        self.table_dir(table).join(CATALOG_FILE_NAME)
    }

    fn family_dir(&self, table: &str, shard: &str, family: &str) -> PathBuf {
        self.table_dir(table).join(shard).join(family)
    }

    async fn load_catalog(&self, table: &str) -> Result<Catalog, ClusterError> {
        let path = self.catalog_path(table);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ClusterError::TableNotFound(table.to_string()));
            }
            Err(err) => {
                return Err(ClusterError::Unavailable(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&data).map_err(|err| catalog_err("parse", &path, err))
    }

    async fn store_catalog(&self, table: &str, catalog: &Catalog) -> Result<(), ClusterError> {
        let path = self.catalog_path(table);
        let tmp = path.with_extension("json.tmp");
        let data =
            serde_json::to_vec_pretty(catalog).map_err(|err| catalog_err("encode", &path, err))?;
        fs::write(&tmp, data)
            .await
            .map_err(|err| catalog_err("write", &tmp, err))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|err| catalog_err("publish", &path, err))
    }

    async fn copy_family(&self, from: &Path, targets: [&Path; 2]) -> Result<(), ClusterError> {
        for target in targets {
            fs::create_dir_all(target)
                .await
                .map_err(|err| catalog_err("create", target, err))?;
        }
        let mut entries = match fs::read_dir(from).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(catalog_err("list", from, err)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| catalog_err("list", from, err))?
        {
            let source = entry.path();
            for target in targets {
                let dest = target.join(entry.file_name());
                fs::copy(&source, &dest)
                    .await
                    .map_err(|err| catalog_err("copy into", &dest, err))?;
            }
        }
        Ok(())
    }
}

impl ClusterControl for LocalCluster {
    async fn shard_boundaries(&self, table: &str) -> Result<Vec<ShardBounds>, ClusterError> {
        let catalog = self.load_catalog(table).await?;
        Ok(catalog
            .shards
            .into_iter()
            .map(|shard| ShardBounds {
                start: shard.start.into_bytes(),
                end: shard.end.into_bytes(),
            })
            .collect())
    }

    async fn locate_shard(&self, table: &str, key: &[u8]) -> Result<ShardLocation, ClusterError> {
        let catalog = self.load_catalog(table).await?;
        let idx = catalog
            .owner(key)
            .ok_or_else(|| ClusterError::Rejected(format!("no shard of {table} owns the key")))?;
        let shard = &catalog.shards[idx];
        Ok(ShardLocation {
            shard: ShardRef {
                name: shard.name.clone(),
                start_key: shard.start.clone().into_bytes(),
            },
            online: shard.online,
        })
    }

    async fn split_shard(&self, table: &str, split_key: &[u8]) -> Result<(), ClusterError> {
        let _guard = self.catalog_lock.lock().await;
        let mut catalog = self.load_catalog(table).await?;
        let split = key_text(split_key)?;
        let idx = catalog
            .owner(split_key)
            .ok_or_else(|| ClusterError::Rejected(format!("no shard of {table} owns {split}")))?;
        let parent = catalog.shards[idx].clone();
        if parent.start == split {
            return Err(ClusterError::Rejected(format!(
                "{split} is already a boundary of {table}"
            )));
        }

        let lower = CatalogShard {
            start: parent.start.clone(),
            end: split.clone(),
            name: new_shard_name(),
            online: true,
        };
        let upper = CatalogShard {
            start: split,
            end: parent.end.clone(),
            name: new_shard_name(),
            online: true,
        };
        for family in &catalog.families {
            let from = self.family_dir(table, &parent.name, family);
            let lower_dir = self.family_dir(table, &lower.name, family);
            let upper_dir = self.family_dir(table, &upper.name, family);
            self.copy_family(&from, [&lower_dir, &upper_dir]).await?;
        }
        log_debug!(
            component = "cluster",
            event = "local_split",
            table = table,
            parent = %parent.name,
            lower = %lower.name,
            upper = %upper.name,
        );

        catalog.shards[idx] = lower;
        catalog.shards.insert(idx + 1, upper);
        self.store_catalog(table, &catalog).await?;

        let parent_dir = self.table_dir(table).join(&parent.name);
        match fs::remove_dir_all(&parent_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(catalog_err("remove", &parent_dir, err)),
        }
    }

    async fn worker_count(&self) -> Result<usize, ClusterError> {
        Ok(1)
    }

    async fn column_family_dirs(
        &self,
        table: &str,
        shard: &ShardRef,
    ) -> Result<Vec<PathBuf>, ClusterError> {
        let catalog = self.load_catalog(table).await?;
        Ok(catalog
            .families
            .iter()
            .map(|family| self.family_dir(table, &shard.name, family))
            .collect())
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, ClusterError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(ClusterError::Unavailable(format!(
                    "failed to list {}: {err}",
                    dir.display()
                )));
            }
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            ClusterError::Unavailable(format!("failed to list {}: {err}", dir.display()))
        })? {
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}
