//! Structured events of a balanced split run.
//!
//! A run narrates itself through `tracing` events under the
//! `balanced_split` target, so `RUST_LOG=balanced_split=debug` follows one
//! table from plan to deleted log without library noise from elsewhere.
//! The crate only emits; installing a subscriber is left to the binary or
//! to whoever embeds the library.
//!
//! Every event names the `component` that raised it and a snake_case
//! `event`:
//!
//! - `planner`: `plan_computed`, `shard_too_small`
//! - `oplog`: log lifecycle (`log_created`, `log_recovered`, `log_deleted`),
//!   replay, `torn_tail_repaired`, lease outcomes, `log_corrupt`
//! - `executor` and `compaction`: one event per request, per daughter coming
//!   online and per settled split
//! - `poll` and `cluster`: retries and transient failures
//! - `job`: start, resume and end of a run
//!
//! Keys and split operations are rendered as padded hex through their
//! `Display` impls (`%op`); paths through `%path.display()`.

/// Target for all balanced-split log events.
pub(crate) const SPLIT_TARGET: &str = "balanced_split";

/// Macro for info-level log events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "oplog",
///     event = "log_created",
///     path = %path.display(),
///     operations = ops.len(),
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::SPLIT_TARGET, $($field)*)
    };
}

/// Macro for debug-level log events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::SPLIT_TARGET, $($field)*)
    };
}

/// Macro for warn-level log events.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::SPLIT_TARGET, $($field)*)
    };
}

/// Macro for error-level log events.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::SPLIT_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
