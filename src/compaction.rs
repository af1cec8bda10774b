//! Waits for post-split compaction to clear reference artifacts.
//!
//! A freshly split daughter serves reads through reference files that point
//! back into its parent's data. Until the cluster compacts them away the
//! daughter cannot be split again cheaply, so the executor bounds how many
//! splits may still hold references at once and drains them through here.

use crate::{
    cluster::{ClusterControl, ClusterError, ShardRef},
    observability::{log_debug, log_info, log_warn},
    poll::{PollError, Poller},
};

/// Polls the data directories of daughter shards until no reference
/// artifacts remain. Never mutates the cluster.
pub struct CompactionWaiter<'a, C> {
    cluster: &'a C,
    table: &'a str,
    poller: &'a Poller,
}

impl<'a, C: ClusterControl> CompactionWaiter<'a, C> {
    /// Watch shards of `table` on `cluster`, sleeping between rounds per
    /// `poller`.
    pub fn new(cluster: &'a C, table: &'a str, poller: &'a Poller) -> Self {
        Self {
            cluster,
            table,
            poller,
        }
    }

    /// Return once neither daughter holds reference artifacts.
    pub async fn await_settled(&self, daughters: [ShardRef; 2]) -> Result<(), PollError> {
        let mut remaining: Vec<ShardRef> = daughters.into();
        remaining.dedup();
        let mut round = self
            .poller
            .round(format!("compaction of {}", shard_names(&remaining)));

        loop {
            if self.poller.cancel_token().is_cancelled() {
                return Err(PollError::Cancelled);
            }
            match self.still_referenced(&remaining).await {
                Ok(next) => remaining = next,
                Err(err) if err.is_transient() => {
                    log_warn!(
                        component = "compaction",
                        event = "transient_failure",
                        table = self.table,
                        error = %err,
                    );
                }
                Err(err) => return Err(err.into()),
            }
            if remaining.is_empty() {
                return Ok(());
            }
            round.wait().await?;
        }
    }

    /// Subset of `shards` with at least one reference artifact left.
    async fn still_referenced(&self, shards: &[ShardRef]) -> Result<Vec<ShardRef>, ClusterError> {
        let mut referenced = Vec::new();
        for shard in shards {
            let mut pending = 0usize;
            for dir in self.cluster.column_family_dirs(self.table, shard).await? {
                for file in self.cluster.list_dir(&dir).await? {
                    if self.cluster.is_reference_artifact(&file) {
                        pending += 1;
                        log_debug!(
                            component = "compaction",
                            event = "reference_pending",
                            shard = %shard.name,
                            file = %file.display(),
                        );
                    }
                }
            }
            if pending > 0 {
                referenced.push(shard.clone());
            } else {
                log_info!(
                    component = "compaction",
                    event = "shard_settled",
                    table = self.table,
                    shard = %shard.name,
                );
            }
        }
        Ok(referenced)
    }
}

fn shard_names(shards: &[ShardRef]) -> String {
    shards
        .iter()
        .map(|shard| shard.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
