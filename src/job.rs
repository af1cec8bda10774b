//! One balanced split run over a table.
//!
//! A run either resumes the table's operation log, when one exists, or plans
//! a fresh set of operations from the current shard boundaries and persists
//! it. The pending operations are then executed and the log is deleted once
//! everything completed. Any failure leaves the log in place so the next run
//! picks up where this one stopped.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;

use crate::{
    cluster::ClusterControl,
    error::SplitError,
    executor::{ExecutionReport, SplitExecutor},
    key::KeyError,
    observability::{log_error, log_info, log_warn},
    oplog::{store::LogStore, OperationLog},
    option::SplitOptions,
    plan::{compute_plan, ShardRange, SplitOperation},
    poll::Poller,
};

/// Controller splitting every shard of a table in half.
pub struct BalancedSplit<C, S> {
    cluster: C,
    store: S,
    options: SplitOptions,
    cancel: CancellationToken,
}

impl<C, S> BalancedSplit<C, S>
where
    C: ClusterControl,
    S: LogStore + Clone,
{
    /// Controller talking to `cluster`, keeping its log in `store`.
    pub fn new(cluster: C, store: S, options: SplitOptions) -> Self {
        Self {
            cluster,
            store,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort waits when `cancel` fires.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    /// Token that stops the run at its next wait.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Control plane in use.
    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Split every shard of `table` once, resuming an interrupted run if
    /// its log is still present.
    pub async fn run(&self, table: &str) -> Result<ExecutionReport, SplitError> {
        let poller = Poller::new(self.options.poll_policy(), self.cancel.clone());
        let mut log = OperationLog::new(
            self.store.clone(),
            self.options.key_space,
            self.options.table_dir(table),
        );

        let result = self.execute(table, &poller, &mut log).await;
        match result {
            Ok(report) => {
                log.delete().await?;
                log_info!(
                    component = "job",
                    event = "run_complete",
                    table = table,
                    requested = report.requested,
                    skipped = report.skipped,
                );
                Ok(report)
            }
            Err(err) => {
                log_error!(
                    component = "job",
                    event = "run_failed",
                    table = table,
                    error = %err,
                );
                if let Err(close_err) = log.close().await {
                    log_warn!(
                        component = "job",
                        event = "log_close_failed",
                        table = table,
                        error = %close_err,
                    );
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        table: &str,
        poller: &Poller,
        log: &mut OperationLog<S>,
    ) -> Result<ExecutionReport, SplitError> {
        let pending = if log.exists().await? {
            log_info!(
                component = "job",
                event = "resuming",
                table = table,
                path = %log.path().display(),
            );
            log.recover().await?
        } else {
            let plan = self.plan(table, poller).await?;
            log.create(&plan).await?;
            plan
        };

        SplitExecutor::new(&self.cluster, table, poller, &self.options)
            .execute(log, pending)
            .await
    }

    /// Plan one split per current shard of `table`.
    pub async fn plan(
        &self,
        table: &str,
        poller: &Poller,
    ) -> Result<BTreeSet<SplitOperation>, SplitError> {
        let space = self.options.key_space;
        let bounds = poller
            .retry("shard boundaries", || self.cluster.shard_boundaries(table))
            .await?;
        let ranges = bounds
            .iter()
            .map(|bound| Ok(ShardRange::new(space.encode(&bound.start)?, space.encode(&bound.end)?)))
            .collect::<Result<Vec<_>, KeyError>>()?;
        let plan = compute_plan(&space, &ranges)?;
        log_info!(
            component = "job",
            event = "plan_computed",
            table = table,
            shards = ranges.len(),
            operations = plan.len(),
        );
        Ok(plan)
    }
}
