//! Command line entrypoint: split every shard of a table stored under a local
//! data directory, resuming an interrupted run when its log is present.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use balanced_split::{
    cluster::local::LocalCluster,
    key::{parse_hex, KeySpace},
    oplog::store::TokioLogStore,
    plan::uniform_boundaries,
    BalancedSplit, SplitOptions,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Split every shard of a table in half, crash-safely")]
struct Args {
    /// Table to split.
    table: String,
    /// Directory holding the table and its operation log.
    #[arg(long, env = "BALANCED_SPLIT_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,
    /// Seconds between two probes of the cluster.
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,
    /// Give up a single wait after this many probes.
    #[arg(long)]
    max_poll_attempts: Option<u32>,
    /// Splits allowed to await compaction at once; derived from the worker
    /// count when omitted.
    #[arg(long)]
    window: Option<usize>,
    /// Hex digits in a key.
    #[arg(long, default_value_t = 8)]
    key_width: usize,
    /// Largest key, in hex.
    #[arg(long, default_value = "7fffffff")]
    key_max: String,
    /// Create the table pre-split into this many shards first.
    #[arg(long, value_name = "SHARDS")]
    create: Option<u32>,
    /// Column families of a created table.
    #[arg(long = "family", default_value = "d")]
    families: Vec<String>,
    /// Stop after creating the table.
    #[arg(long, requires = "create")]
    create_only: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let key_max = parse_hex(&args.key_max).context("invalid --key-max")?;
    let space = KeySpace::new(args.key_width, key_max.get()).context("invalid key space")?;
    let cluster = LocalCluster::new(&args.data_dir);

    if let Some(shards) = args.create {
        let boundaries = uniform_boundaries(&space, shards)?;
        let splits: Vec<Vec<u8>> = boundaries.into_iter().map(|key| space.decode(key)).collect();
        let families: Vec<&str> = args.families.iter().map(String::as_str).collect();
        cluster
            .create_table(&args.table, &families, &splits)
            .await
            .with_context(|| format!("failed to create table {}", args.table))?;
        println!("created {} with {} shards", args.table, shards);
        if args.create_only {
            return Ok(());
        }
    }

    let mut options = SplitOptions::from(&args.data_dir)
        .poll_interval(Duration::from_secs(args.poll_interval_secs))
        .key_space(space);
    if let Some(attempts) = args.max_poll_attempts {
        options = options.max_poll_attempts(attempts);
    }
    if let Some(window) = args.window {
        options = options.window(window);
    }

    let cancel = CancellationToken::new();
    let job = BalancedSplit::new(cluster, TokioLogStore, options).with_cancellation(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let report = job
        .run(&args.table)
        .await
        .with_context(|| format!("balanced split of {} failed", args.table))?;
    println!(
        "split {} shards of {} ({} already applied)",
        report.requested + report.skipped,
        args.table,
        report.skipped
    );
    Ok(())
}
