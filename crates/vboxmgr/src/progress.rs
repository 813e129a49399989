//! Polling waits for remote progress and state transitions.

use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use vboxmgr_endpoint::ProgressHandle;

use crate::error::{VboxError, VboxResult};

/// Polls a condition at a fixed interval until it holds, the optional
/// timeout elapses or the token is cancelled.
#[derive(Debug, Clone)]
pub struct Waiter {
    interval: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Waiter {
    pub fn new(interval: Duration, timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self { interval, timeout, cancel }
    }

    /// Runs `probe` until it yields `true`.  Probe errors end the wait.
    pub async fn until<F, Fut>(&self, what: &str, mut probe: F) -> VboxResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VboxResult<bool>>,
    {
        let poll = async {
            loop {
                match probe().await {
                    Ok(true) => return Ok(()),
                    Ok(false) => tokio::time::sleep(self.interval).await,
                    Err(e) => return Err(e),
                }
            }
        };

        let bounded = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, poll).await {
                    Ok(result) => result,
                    Err(_) => Err(VboxError::timeout(format!(
                        "{what} did not finish within {limit:?}"
                    ))),
                },
                None => poll.await,
            }
        };

        tokio::select! {
            biased;
            result = bounded => result,
            _ = self.cancel.cancelled() => Err(VboxError::cancelled(format!("{what} was cancelled"))),
        }
    }

    /// Waits for a progress handle to complete, logging percent changes.
    /// A handle that completes with an error fails the wait.
    pub async fn progress(&self, what: &str, handle: &dyn ProgressHandle) -> VboxResult<()> {
        let last = AtomicU32::new(0);
        let last = &last;
        self.until(what, || async move {
            if handle.completed().await? {
                return Ok(true);
            }
            let percent = handle.percent().await?;
            if percent != last.swap(percent, Ordering::Relaxed) {
                debug!("{what}: {percent}%");
            }
            Ok::<_, VboxError>(false)
        })
        .await?;

        match handle.error().await? {
            Some(reason) => Err(VboxError::endpoint(format!("{what} failed: {reason}"))),
            None => Ok(()),
        }
    }
}
