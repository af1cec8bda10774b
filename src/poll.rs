//! Cancellable fixed-interval polling against the control plane.
//!
//! Every wait in a run goes through a [`Poller`]: probes are issued first,
//! then the poller sleeps one interval, racing the sleep against the run's
//! [`CancellationToken`]. Transient cluster failures count as a pending
//! probe and are retried; every other cluster error ends the poll.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::ClusterError,
    observability::{log_debug, log_warn},
};

/// Default interval between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Errors surfaced by a poll.
#[derive(Debug, Error)]
pub enum PollError {
    /// An attempt or time ceiling was reached before the condition held.
    #[error("gave up waiting for {what} after {attempts} attempts")]
    TimedOut {
        /// What was being waited for.
        what: String,
        /// Probes issued.
        attempts: u32,
    },
    /// The run was cancelled while waiting.
    #[error("cancelled")]
    Cancelled,
    /// The cluster answered with a non-transient error.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    /// The condition holds.
    Ready(T),
    /// Not yet; probe again after an interval.
    Pending,
}

/// When and for how long to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between probes.
    pub interval: Duration,
    /// Give up after this many probes. Unbounded when `None`.
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed. Unbounded when `None`.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: None,
            timeout: None,
        }
    }
}

/// Issues probes under a [`PollPolicy`] until they report ready.
#[derive(Debug, Clone)]
pub struct Poller {
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl Poller {
    /// Poll under `policy`, stopping early when `cancel` fires.
    pub fn new(policy: PollPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// Active policy.
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Token that aborts every wait of this poller.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start a sequence of waits for `what`, sharing one set of ceilings.
    pub fn round(&self, what: impl Into<String>) -> PollRound<'_> {
        PollRound {
            poller: self,
            what: what.into(),
            attempts: 0,
            started: Instant::now(),
        }
    }

    /// Probe until it reports [`Poll::Ready`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Poll<T>, ClusterError>>,
    {
        let mut round = self.round(what);
        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            match probe().await {
                Ok(Poll::Ready(value)) => return Ok(value),
                Ok(Poll::Pending) => {}
                Err(err) if err.is_transient() => {
                    log_warn!(
                        component = "poll",
                        event = "transient_failure",
                        what = what,
                        error = %err,
                    );
                }
                Err(err) => return Err(err.into()),
            }
            round.wait().await?;
        }
    }

    /// Issue `call` until it succeeds, retrying transient failures.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        self.run(what, || {
            let fut = call();
            async move { fut.await.map(Poll::Ready) }
        })
        .await
    }

    async fn sleep(&self) -> Result<(), PollError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PollError::Cancelled),
            _ = tokio::time::sleep(self.policy.interval) => Ok(()),
        }
    }
}

/// Attempt bookkeeping for one wait, for callers that keep their own state
/// between probes.
#[derive(Debug)]
pub struct PollRound<'a> {
    poller: &'a Poller,
    what: String,
    attempts: u32,
    started: Instant,
}

impl PollRound<'_> {
    /// Record a pending probe and sleep one interval.
    ///
    /// Fails with [`PollError::TimedOut`] once a ceiling is reached and with
    /// [`PollError::Cancelled`] when the token fires.
    pub async fn wait(&mut self) -> Result<(), PollError> {
        self.attempts += 1;
        let policy = self.poller.policy;
        let out_of_attempts = policy.max_attempts.is_some_and(|max| self.attempts >= max);
        let out_of_time = policy
            .timeout
            .is_some_and(|timeout| self.started.elapsed() >= timeout);
        if out_of_attempts || out_of_time {
            return Err(PollError::TimedOut {
                what: self.what.clone(),
                attempts: self.attempts,
            });
        }
        log_debug!(
            component = "poll",
            event = "pending",
            what = %self.what,
            attempt = self.attempts,
        );
        self.poller.sleep().await
    }

    /// Probes recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    fn poller(max_attempts: Option<u32>) -> Poller {
        Poller::new(
            PollPolicy {
                interval: Duration::ZERO,
                max_attempts,
                timeout: None,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn ready_after_pending_probes() {
        let calls = AtomicU32::new(0);
        let value = poller(None)
            .run("ready", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n < 3 { Poll::Pending } else { Poll::Ready(n) }) }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn attempt_ceiling_times_out() {
        let err = poller(Some(4))
            .run("never", || async { Ok(Poll::<()>::Pending) })
            .await
            .unwrap_err();
        match err {
            PollError::TimedOut { what, attempts } => {
                assert_eq!(what, "never");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn time_ceiling_times_out() {
        let poller = Poller::new(
            PollPolicy {
                interval: Duration::from_secs(30),
                max_attempts: None,
                timeout: Some(Duration::from_secs(95)),
            },
            CancellationToken::new(),
        );
        let err = poller
            .run("slow", || async { Ok(Poll::<()>::Pending) })
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::TimedOut { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let value = poller(None)
            .retry("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClusterError::Unavailable("busy".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn fatal_errors_end_the_poll() {
        let err = poller(None)
            .retry("fatal", || async {
                Err::<(), _>(ClusterError::TableNotFound("t".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PollError::Cluster(ClusterError::TableNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let poller = Poller::new(PollPolicy::default(), cancel.clone());
        let probes = Arc::new(AtomicU32::new(0));
        let task = {
            let probes = probes.clone();
            tokio::spawn(async move {
                poller
                    .run("forever", || {
                        probes.fetch_add(1, Ordering::SeqCst);
                        async { Ok(Poll::<()>::Pending) }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(45)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PollError::Cancelled));
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }
}
