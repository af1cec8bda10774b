//! Drives pending split operations through the cluster.
//!
//! Operations are processed one at a time in ascending order. Each one moves
//! through `Pending -> Requested -> DaughterVisible -> Logged ->
//! AwaitingCompaction -> Settled`. The `Remove` line is made durable before
//! the operation enters the compaction window, and the window never holds
//! more than its limit: when it is full the oldest entry is drained first.

use std::collections::{BTreeSet, VecDeque};

use crate::{
    cluster::{ClusterControl, ShardRef},
    compaction::CompactionWaiter,
    error::SplitError,
    key::{KeySpace, KeyValue},
    observability::{log_debug, log_info},
    oplog::{store::LogStore, OperationLog},
    option::SplitOptions,
    plan::SplitOperation,
    poll::{Poll, Poller},
};

/// Smallest compaction window.
pub const MIN_WINDOW: usize = 2;
/// Workers per additional split allowed to await compaction.
pub const WORKERS_PER_SPLIT: usize = 10;

/// Splits that may await compaction at once on a cluster of `workers`.
pub fn window_limit(workers: usize) -> usize {
    (workers / WORKERS_PER_SPLIT).max(MIN_WINDOW)
}

/// Counters for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Split requests sent to the cluster.
    pub requested: usize,
    /// Operations found already applied, so no request was sent.
    pub skipped: usize,
    /// `Remove` lines appended to the log.
    pub logged: usize,
    /// Operations whose daughters were seen free of references.
    pub settled: usize,
    /// Largest number of operations awaiting compaction at once.
    pub max_window: usize,
}

/// Executes a set of pending operations against one table.
pub struct SplitExecutor<'a, C> {
    cluster: &'a C,
    table: &'a str,
    poller: &'a Poller,
    space: KeySpace,
    window: Option<usize>,
    status_every: usize,
    drain_on_finish: bool,
}

impl<'a, C: ClusterControl> SplitExecutor<'a, C> {
    /// Executor for `table` configured by `options`.
    pub fn new(cluster: &'a C, table: &'a str, poller: &'a Poller, options: &SplitOptions) -> Self {
        Self {
            cluster,
            table,
            poller,
            space: options.key_space,
            window: options.window,
            status_every: options.status_every,
            drain_on_finish: options.drain_on_finish,
        }
    }

    /// Run every operation in `pending`, recording completions in `log`.
    pub async fn execute<S: LogStore>(
        &self,
        log: &mut OperationLog<S>,
        pending: BTreeSet<SplitOperation>,
    ) -> Result<ExecutionReport, SplitError> {
        let limit = match self.window {
            Some(window) => window,
            None => {
                let workers = self
                    .poller
                    .retry("worker count", || self.cluster.worker_count())
                    .await?;
                window_limit(workers)
            }
        };
        let total = pending.len();
        log_info!(
            component = "executor",
            event = "execution_started",
            table = self.table,
            pending = total,
            window = limit,
        );

        let mut report = ExecutionReport::default();
        let mut window: VecDeque<SplitOperation> = VecDeque::with_capacity(limit);

        for (done, op) in pending.into_iter().enumerate() {
            if self.request(&op).await? {
                report.requested += 1;
            } else {
                report.skipped += 1;
            }
            self.await_daughter(&op).await?;

            log.append_remove(&op).await?;
            report.logged += 1;

            if window.len() >= limit {
                if let Some(oldest) = window.pop_front() {
                    self.settle(&oldest).await?;
                    report.settled += 1;
                }
            }
            window.push_back(op);
            report.max_window = report.max_window.max(window.len());

            let done = done + 1;
            if self.status_every > 0 && done % self.status_every == 0 {
                log_info!(
                    component = "executor",
                    event = "status",
                    table = self.table,
                    done = done,
                    total = total,
                    awaiting_compaction = window.len(),
                );
            }
        }

        if self.drain_on_finish {
            while let Some(oldest) = window.pop_front() {
                self.settle(&oldest).await?;
                report.settled += 1;
            }
        }

        log_info!(
            component = "executor",
            event = "execution_finished",
            table = self.table,
            requested = report.requested,
            skipped = report.skipped,
            settled = report.settled,
        );
        Ok(report)
    }

    /// Check the shard owning the split point and send the split request.
    ///
    /// Returns `false` when the split was already applied, for instance by
    /// a run that crashed before logging it.
    async fn request(&self, op: &SplitOperation) -> Result<bool, SplitError> {
        let split_key = self.space.decode(op.split_point);
        let split_key = split_key.as_slice();
        let location = self
            .poller
            .retry("shard lookup", || self.cluster.locate_shard(self.table, split_key))
            .await?;

        if !location.shard.start_key.is_empty() {
            let found = self.space.encode(&location.shard.start_key)?;
            if found == op.split_point {
                log_info!(
                    component = "executor",
                    event = "split_already_applied",
                    table = self.table,
                    operation = %op,
                    shard = %location.shard.name,
                );
                return Ok(false);
            }
            if found != op.start {
                return Err(SplitError::PlanInconsistency {
                    operation: *op,
                    found,
                });
            }
        }

        self.poller
            .retry("split request", || self.cluster.split_shard(self.table, split_key))
            .await?;
        log_info!(
            component = "executor",
            event = "split_requested",
            table = self.table,
            operation = %op,
            parent = %location.shard.name,
        );
        Ok(true)
    }

    /// Poll until the upper daughter starts at the split point and serves.
    async fn await_daughter(&self, op: &SplitOperation) -> Result<ShardRef, SplitError> {
        let split_key = self.space.decode(op.split_point);
        let split_key = split_key.as_slice();
        let what = format!("daughter of {op}");
        let daughter = self
            .poller
            .run(&what, || async move {
                let location = self.cluster.locate_shard(self.table, split_key).await?;
                if location.online && self.starts_at(&location.shard, op.split_point) {
                    Ok(Poll::Ready(location.shard))
                } else {
                    Ok(Poll::Pending)
                }
            })
            .await?;
        log_debug!(
            component = "executor",
            event = "daughter_online",
            table = self.table,
            operation = %op,
            shard = %daughter.name,
        );
        Ok(daughter)
    }

    /// Wait for both daughters of `op` to shed their reference artifacts.
    async fn settle(&self, op: &SplitOperation) -> Result<(), SplitError> {
        let lower_key = self.space.decode(op.start);
        let upper_key = self.space.decode(op.split_point);
        let lower = self.locate(&lower_key).await?;
        let upper = self.locate(&upper_key).await?;

        CompactionWaiter::new(self.cluster, self.table, self.poller)
            .await_settled([lower, upper])
            .await?;
        log_debug!(
            component = "executor",
            event = "split_settled",
            table = self.table,
            operation = %op,
        );
        Ok(())
    }

    async fn locate(&self, key: &[u8]) -> Result<ShardRef, SplitError> {
        let location = self
            .poller
            .retry("shard lookup", || self.cluster.locate_shard(self.table, key))
            .await?;
        Ok(location.shard)
    }

    fn starts_at(&self, shard: &ShardRef, key: KeyValue) -> bool {
        self.space
            .encode(&shard.start_key)
            .is_ok_and(|start| start == key)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{cluster::mem::MemCluster, oplog::store::MemLogStore};

    #[test]
    fn window_has_a_floor_of_two() {
        assert_eq!(window_limit(0), 2);
        assert_eq!(window_limit(19), 2);
        assert_eq!(window_limit(30), 3);
        assert_eq!(window_limit(250), 25);
    }

    fn key(value: u128) -> Vec<u8> {
        KeySpace::md5_prefix().decode(KeyValue::new(value))
    }

    #[tokio::test]
    async fn single_operation_runs_to_settled() {
        let cluster = MemCluster::builder()
            .workers(4)
            .table("t", &["d"], &[key(0x100)])
            .online_delay(2)
            .reference_rounds(1)
            .build();
        let store = MemLogStore::new();
        let options = SplitOptions::from("tables").poll_interval(Duration::ZERO);
        let poller = Poller::new(options.poll_policy(), CancellationToken::new());

        let pending: BTreeSet<_> = [SplitOperation::new(0x100, 0x180)].into();
        let mut log = OperationLog::new(store.clone(), options.key_space, "tables/t");
        log.create(&pending).await.unwrap();

        let report = SplitExecutor::new(&cluster, "t", &poller, &options)
            .execute(&mut log, pending)
            .await
            .unwrap();
        assert_eq!(
            report,
            ExecutionReport {
                requested: 1,
                skipped: 0,
                logged: 1,
                settled: 1,
                max_window: 1,
            }
        );
        assert_eq!(cluster.split_requests("t").await, vec![key(0x180)]);
    }
}
