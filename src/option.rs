use std::{path::PathBuf, time::Duration};

use crate::{
    key::KeySpace,
    poll::{PollPolicy, DEFAULT_POLL_INTERVAL},
};

/// Splits between two progress lines.
pub const DEFAULT_STATUS_EVERY: usize = 10;

/// Tunables of a balanced split run.
#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub(crate) log_root: PathBuf,
    pub(crate) poll_interval: Duration,
    pub(crate) max_poll_attempts: Option<u32>,
    pub(crate) poll_timeout: Option<Duration>,
    pub(crate) window: Option<usize>,
    pub(crate) status_every: usize,
    pub(crate) drain_on_finish: bool,
    pub(crate) key_space: KeySpace,
}

impl<P> From<P> for SplitOptions
where
    P: Into<PathBuf>,
{
    fn from(log_root: P) -> Self {
        SplitOptions {
            log_root: log_root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: None,
            poll_timeout: None,
            window: None,
            status_every: DEFAULT_STATUS_EVERY,
            drain_on_finish: true,
            key_space: KeySpace::md5_prefix(),
        }
    }
}

impl SplitOptions {
    /// Directory under which each table keeps its operation log.
    pub fn log_root(self, log_root: impl Into<PathBuf>) -> Self {
        SplitOptions {
            log_root: log_root.into(),
            ..self
        }
    }

    /// Sleep between two probes of the cluster.
    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        SplitOptions {
            poll_interval,
            ..self
        }
    }

    /// Give up a single wait after this many probes.
    pub fn max_poll_attempts(self, max_poll_attempts: u32) -> Self {
        SplitOptions {
            max_poll_attempts: Some(max_poll_attempts),
            ..self
        }
    }

    /// Give up a single wait after this long.
    pub fn poll_timeout(self, poll_timeout: Duration) -> Self {
        SplitOptions {
            poll_timeout: Some(poll_timeout),
            ..self
        }
    }

    /// Fix the number of splits allowed to await compaction at once instead
    /// of deriving it from the worker count. Zero is treated as one.
    pub fn window(self, window: usize) -> Self {
        SplitOptions {
            window: Some(window.max(1)),
            ..self
        }
    }

    /// Log a progress line every `status_every` splits. Zero disables it.
    pub fn status_every(self, status_every: usize) -> Self {
        SplitOptions {
            status_every,
            ..self
        }
    }

    /// Whether to wait out compaction of the last window before finishing.
    pub fn drain_on_finish(self, drain_on_finish: bool) -> Self {
        SplitOptions {
            drain_on_finish,
            ..self
        }
    }

    /// Key encoding shared by the planner, the log and the cluster.
    pub fn key_space(self, key_space: KeySpace) -> Self {
        SplitOptions { key_space, ..self }
    }
}

impl SplitOptions {
    pub(crate) fn table_dir(&self, table: &str) -> PathBuf {
        self.log_root.join(table)
    }

    pub(crate) fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_attempts: self.max_poll_attempts,
            timeout: self.poll_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let options = SplitOptions::from("/data");
        assert_eq!(options.poll_interval, Duration::from_secs(30));
        assert_eq!(options.status_every, 10);
        assert!(options.drain_on_finish);
        assert_eq!(options.window, None);
        assert_eq!(options.key_space, KeySpace::md5_prefix());

        let options = options
            .poll_interval(Duration::ZERO)
            .max_poll_attempts(5)
            .window(0);
        assert_eq!(options.window, Some(1));
        assert_eq!(
            options.poll_policy(),
            PollPolicy {
                interval: Duration::ZERO,
                max_attempts: Some(5),
                timeout: None,
            }
        );
    }

    #[test]
    fn table_dir_is_under_the_log_root() {
        let options = SplitOptions::from("/data").log_root("/logs");
        assert_eq!(options.table_dir("users"), PathBuf::from("/logs/users"));
    }
}
