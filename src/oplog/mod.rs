//! Durable, append-only record of planned and completed splits.
//!
//! The log is the only source of truth for resuming a run. A fresh plan is
//! written to a side file and renamed onto the canonical path so readers
//! never see a partial plan. Completed operations are appended as `Remove`
//! lines and synced before the caller moves on. On restart the log is
//! replayed and reconciled into the set of operations still pending.

pub mod codec;
pub mod replay;
pub mod store;

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    key::KeySpace,
    observability::{log_debug, log_error, log_info, log_warn},
    oplog::{
        codec::{decode_log, encode_entries, LogEntry},
        replay::reconcile,
        store::{LeaseStatus, LogStore, LogWriter},
    },
    plan::SplitOperation,
};

/// File name of the canonical log inside the table directory.
pub const LOG_FILE_NAME: &str = "_balancedSplit";
/// File name used while a fresh log is being written.
pub const PREPARE_FILE_NAME: &str = "_balancedSplit_prepare";

/// Result type shared across operation log calls.
pub type OpLogResult<T> = Result<T, OpLogError>;

/// Errors surfaced by the operation log.
#[derive(Debug, Error)]
pub enum OpLogError {
    /// A line failed to parse, or replay broke an invariant. Never retried:
    /// the log has to be inspected and repaired by hand.
    #[error("operation log is corrupt at line {line}: {reason}")]
    Corruption {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
    /// A fresh log was requested but one already exists.
    #[error("operation log already exists at {0}; recover it instead")]
    AlreadyExists(PathBuf),
    /// Another live writer owns the log.
    #[error("operation log {path} is leased by a live writer ({owner})")]
    LeaseHeld {
        /// Canonical path of the log.
        path: PathBuf,
        /// Owner recorded in the lease.
        owner: String,
    },
    /// An append was attempted without an open writer.
    #[error("operation log is not open for writing")]
    NotOpen,
    /// The backing store failed.
    #[error("operation log storage error: {0}")]
    Storage(String),
}

fn storage_err(action: &str, path: &Path, err: io::Error) -> OpLogError {
    OpLogError::Storage(format!("failed to {action} {}: {err}", path.display()))
}

/// Handle on one table's operation log.
pub struct OperationLog<S: LogStore> {
    store: S,
    space: KeySpace,
    path: PathBuf,
    prepare_path: PathBuf,
    writer: Option<S::Writer>,
}

impl<S: LogStore> OperationLog<S> {
    /// Bind a log to `table_dir`, where its canonical and side files live.
    pub fn new(store: S, space: KeySpace, table_dir: impl AsRef<Path>) -> Self {
        let table_dir = table_dir.as_ref();
        Self {
            store,
            space,
            path: table_dir.join(LOG_FILE_NAME),
            prepare_path: table_dir.join(PREPARE_FILE_NAME),
            writer: None,
        }
    }

    /// Canonical path of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a log exists at the canonical path.
    pub async fn exists(&self) -> OpLogResult<bool> {
        self.store
            .exists(&self.path)
            .await
            .map_err(|err| storage_err("stat operation log", &self.path, err))
    }

    /// Persist a fresh plan and open the log for appends.
    ///
    /// Fails with [`OpLogError::AlreadyExists`] when a log is already
    /// published.
    pub async fn create(&mut self, operations: &BTreeSet<SplitOperation>) -> OpLogResult<()> {
        if self.exists().await? {
            return Err(OpLogError::AlreadyExists(self.path.clone()));
        }
        let entries: Vec<LogEntry> = operations.iter().copied().map(LogEntry::Add).collect();
        self.publish(&entries).await?;
        log_info!(
            component = "oplog",
            event = "log_created",
            path = %self.path.display(),
            operations = operations.len(),
        );
        self.open_writer().await
    }

    /// Replay the log into the set of operations still pending, then open it
    /// for appends.
    ///
    /// A lease left by a dead writer is reclaimed first; a live one fails
    /// with [`OpLogError::LeaseHeld`] before anything is read. A final line
    /// cut short by a crash is dropped and the log rewritten without it.
    pub async fn recover(&mut self) -> OpLogResult<BTreeSet<SplitOperation>> {
        let lease = self
            .store
            .recover_lease(&self.path)
            .await
            .map_err(|err| storage_err("reclaim lease on", &self.path, err))?;
        match lease {
            LeaseStatus::Free => {}
            LeaseStatus::Reclaimed => log_warn!(
                component = "oplog",
                event = "stale_lease_reclaimed",
                path = %self.path.display(),
            ),
            LeaseStatus::Held { owner } => {
                log_error!(
                    component = "oplog",
                    event = "lease_held",
                    path = %self.path.display(),
                    owner = %owner,
                );
                return Err(OpLogError::LeaseHeld {
                    path: self.path.clone(),
                    owner,
                });
            }
        }

        let data = self
            .store
            .read(&self.path)
            .await
            .map_err(|err| storage_err("read operation log", &self.path, err))?;
        let decoded = decode_log(&data).inspect_err(|err| {
            log_error!(
                component = "oplog",
                event = "log_corrupt",
                path = %self.path.display(),
                error = %err,
            );
        })?;

        for entry in &decoded.entries {
            match entry {
                LogEntry::Add(op) => {
                    log_debug!(component = "oplog", event = "replay_add", operation = %op)
                }
                LogEntry::Remove(op) => {
                    log_debug!(component = "oplog", event = "replay_remove", operation = %op)
                }
            }
        }
        let pending = reconcile(decoded.entries.iter().copied()).inspect_err(|err| {
            log_error!(
                component = "oplog",
                event = "log_corrupt",
                path = %self.path.display(),
                error = %err,
            );
        })?;

        if let Some(offset) = decoded.torn_tail {
            log_warn!(
                component = "oplog",
                event = "torn_tail_repaired",
                path = %self.path.display(),
                kept_entries = decoded.entries.len(),
                dropped_bytes = data.len() - offset,
            );
            self.publish(&decoded.entries).await?;
        }

        log_info!(
            component = "oplog",
            event = "log_recovered",
            path = %self.path.display(),
            entries = decoded.entries.len(),
            pending = pending.len(),
        );
        self.open_writer().await?;
        Ok(pending)
    }

    /// Record that `operation` completed. Returns once the line is durable.
    pub async fn append_remove(&mut self, operation: &SplitOperation) -> OpLogResult<()> {
        let line = LogEntry::Remove(*operation).encode(&self.space);
        let writer = self.writer.as_mut().ok_or(OpLogError::NotOpen)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| storage_err("append to operation log", &self.path, err))?;
        writer
            .sync()
            .await
            .map_err(|err| storage_err("sync operation log", &self.path, err))?;
        log_debug!(
            component = "oplog",
            event = "remove_logged",
            operation = %operation,
        );
        Ok(())
    }

    /// Sync and release the writer, if any.
    pub async fn close(&mut self) -> OpLogResult<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .close()
                .await
                .map_err(|err| storage_err("close operation log", &self.path, err))?;
        }
        Ok(())
    }

    /// Close and remove the log, marking the run complete.
    pub async fn delete(mut self) -> OpLogResult<()> {
        self.close().await?;
        self.store
            .remove(&self.path)
            .await
            .map_err(|err| storage_err("delete operation log", &self.path, err))?;
        log_info!(
            component = "oplog",
            event = "log_deleted",
            path = %self.path.display(),
        );
        Ok(())
    }

    /// Write `entries` to the side file, then rename it over the canonical
    /// path.
    async fn publish(&mut self, entries: &[LogEntry]) -> OpLogResult<()> {
        let data = encode_entries(&self.space, entries);
        let mut writer = self
            .store
            .create(&self.prepare_path)
            .await
            .map_err(|err| storage_err("create", &self.prepare_path, err))?;
        writer
            .write_all(&data)
            .await
            .map_err(|err| storage_err("write", &self.prepare_path, err))?;
        writer
            .close()
            .await
            .map_err(|err| storage_err("close", &self.prepare_path, err))?;
        self.store
            .rename(&self.prepare_path, &self.path)
            .await
            .map_err(|err| storage_err("publish operation log to", &self.path, err))
    }

    async fn open_writer(&mut self) -> OpLogResult<()> {
        let writer = self
            .store
            .append(&self.path)
            .await
            .map_err(|err| storage_err("open operation log for append", &self.path, err))?;
        self.writer = Some(writer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::store::MemLogStore;

    fn op(start: u128, split: u128) -> SplitOperation {
        SplitOperation::new(start, split)
    }

    fn plan(ops: &[(u128, u128)]) -> BTreeSet<SplitOperation> {
        ops.iter().map(|(s, p)| op(*s, *p)).collect()
    }

    fn log(store: &MemLogStore) -> OperationLog<MemLogStore> {
        OperationLog::new(store.clone(), KeySpace::md5_prefix(), "tables/t")
    }

    #[tokio::test]
    async fn create_then_recover_round_trips() {
        let store = MemLogStore::new();
        let ops = plan(&[(100, 150), (0, 50), (200, 250)]);

        let mut first = log(&store);
        first.create(&ops).await.unwrap();
        first.close().await.unwrap();

        let mut second = log(&store);
        assert_eq!(second.recover().await.unwrap(), ops);
        second.close().await.unwrap();

        let mut third = log(&store);
        assert_eq!(third.recover().await.unwrap(), ops);
    }

    #[tokio::test]
    async fn create_refuses_existing_log() {
        let store = MemLogStore::new();
        let mut first = log(&store);
        first.create(&plan(&[(0, 50)])).await.unwrap();
        first.close().await.unwrap();

        let err = log(&store).create(&plan(&[(0, 50)])).await.unwrap_err();
        assert!(matches!(err, OpLogError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_leaves_no_side_file() {
        let store = MemLogStore::new();
        let mut oplog = log(&store);
        oplog.create(&plan(&[(0, 50)])).await.unwrap();
        assert!(store
            .contents(Path::new("tables/t/_balancedSplit_prepare"))
            .await
            .is_none());
        assert_eq!(
            store
                .contents(Path::new("tables/t/_balancedSplit"))
                .await
                .unwrap(),
            b"+ 00000000 00000032\n".to_vec()
        );
    }

    #[tokio::test]
    async fn removes_survive_a_crash() {
        let store = MemLogStore::new();
        let mut first = log(&store);
        first.create(&plan(&[(0, 50), (100, 150)])).await.unwrap();
        first.append_remove(&op(0, 50)).await.unwrap();
        // crash: writer dropped without close, lease left behind
        drop(first);
        assert!(store.lease_held(Path::new("tables/t/_balancedSplit")).await);

        let mut second = log(&store);
        assert_eq!(second.recover().await.unwrap(), plan(&[(100, 150)]));
        second.append_remove(&op(100, 150)).await.unwrap();
        second.close().await.unwrap();

        let mut third = log(&store);
        assert!(third.recover().await.unwrap().is_empty());
        third.delete().await.unwrap();
        assert!(!log(&store).exists().await.unwrap());
    }

    #[tokio::test]
    async fn live_writer_blocks_a_second_recovery() {
        let store = MemLogStore::new();
        let mut first = log(&store);
        first.create(&plan(&[(0, 50), (100, 150)])).await.unwrap();

        let mut second = log(&store);
        let err = second.recover().await.unwrap_err();
        assert!(matches!(err, OpLogError::LeaseHeld { .. }), "{err}");
        assert!(matches!(
            second.append_remove(&op(0, 50)).await,
            Err(OpLogError::NotOpen)
        ));

        // the first writer is untouched and keeps the log
        first.append_remove(&op(0, 50)).await.unwrap();
        first.close().await.unwrap();
        assert_eq!(second.recover().await.unwrap(), plan(&[(100, 150)]));
    }

    #[tokio::test]
    async fn unsynced_plan_never_reaches_the_canonical_path() {
        let store = MemLogStore::new();
        // a run that crashed while writing its plan
        let mut prepare = store
            .create(Path::new("tables/t/_balancedSplit_prepare"))
            .await
            .unwrap();
        prepare.write_all(b"+ 00000000 00000032\n+ 0000").await.unwrap();
        drop(prepare);

        let mut oplog = log(&store);
        assert!(!oplog.exists().await.unwrap());
        assert!(store
            .contents(Path::new("tables/t/_balancedSplit"))
            .await
            .is_none());

        // the next run plans afresh over the leftover side file
        oplog.create(&plan(&[(0, 50), (100, 150)])).await.unwrap();
        oplog.close().await.unwrap();
        assert!(store
            .contents(Path::new("tables/t/_balancedSplit_prepare"))
            .await
            .is_none());
        assert_eq!(
            log(&store).recover().await.unwrap(),
            plan(&[(0, 50), (100, 150)])
        );
    }

    #[tokio::test]
    async fn unterminated_remove_is_dropped_on_recovery() {
        let store = MemLogStore::new();
        store
            .install(
                "tables/t/_balancedSplit",
                "+ 00000000 00000032\n- 00000000 00000032",
            )
            .await;
        let mut oplog = log(&store);
        assert_eq!(oplog.recover().await.unwrap(), plan(&[(0, 50)]));
        oplog.close().await.unwrap();
        assert_eq!(
            store
                .contents(Path::new("tables/t/_balancedSplit"))
                .await
                .unwrap(),
            b"+ 00000000 00000032\n".to_vec()
        );
    }

    #[tokio::test]
    async fn unknown_remove_fails_recovery() {
        let store = MemLogStore::new();
        store
            .install("tables/t/_balancedSplit", "+ 1 5\n- 2 9\n")
            .await;
        let err = log(&store).recover().await.unwrap_err();
        assert!(matches!(err, OpLogError::Corruption { line: 2, .. }));
        // the log stays in place for inspection
        assert!(log(&store).exists().await.unwrap());
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_and_rewritten() {
        let store = MemLogStore::new();
        store
            .install("tables/t/_balancedSplit", "+ 1 5\n+ a f\n- 1 ")
            .await;
        let mut oplog = log(&store);
        assert_eq!(oplog.recover().await.unwrap(), plan(&[(1, 5), (0xa, 0xf)]));
        oplog.append_remove(&op(1, 5)).await.unwrap();
        oplog.close().await.unwrap();

        assert_eq!(
            store
                .contents(Path::new("tables/t/_balancedSplit"))
                .await
                .unwrap(),
            b"+ 00000001 00000005\n+ 0000000a 0000000f\n- 00000001 00000005\n".to_vec()
        );
    }

    #[tokio::test]
    async fn append_requires_open_log() {
        let store = MemLogStore::new();
        let mut oplog = log(&store);
        assert!(matches!(
            oplog.append_remove(&op(1, 5)).await,
            Err(OpLogError::NotOpen)
        ));
    }
}
