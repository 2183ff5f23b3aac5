//! Interrupt Governor
//!
//! Forces a script host to stop once its execution token is cancelled, either
//! by the budget timer or by anyone else holding the token. A script that
//! swallows the interrupt gets interrupted again every retry interval.

use std::time::Duration;

use sandpool_js_runtime::InterruptTarget;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Delay between repeated interrupts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy)]
pub struct InterruptGovernor {
    retry_interval: Duration,
}

impl Default for InterruptGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

impl InterruptGovernor {
    pub fn new(retry_interval: Duration) -> Self {
        Self { retry_interval }
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Watch `source` for one execution.
    ///
    /// `source` is cancelled after `timeout`. The scope's native token is a
    /// child of `source` and so is cancelled synchronously with it. `target`
    /// is fired from the governing task, on its first poll after `source` is
    /// cancelled, and then every retry interval until the scope is dropped.
    /// Only a `source` that is already cancelled at arm time fires inline.
    pub fn arm(
        &self,
        source: &CancellationToken,
        target: InterruptTarget,
        timeout: Duration,
    ) -> CancellationScope {
        let native = source.child_token();

        let already_cancelled = source.is_cancelled();
        if already_cancelled {
            target.fire();
            native.cancel();
        }

        let timer = tokio::spawn(govern(
            source.clone(),
            native.clone(),
            target,
            timeout,
            self.retry_interval,
            already_cancelled,
        ));

        CancellationScope { native, timer }
    }
}

async fn govern(
    source: CancellationToken,
    native: CancellationToken,
    target: InterruptTarget,
    timeout: Duration,
    retry_interval: Duration,
    fired: bool,
) {
    if fired {
        tokio::time::sleep(retry_interval).await;
    } else {
        tokio::select! {
            _ = source.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                debug!(?timeout, "Execution budget elapsed");
                source.cancel();
            }
        }
    }

    loop {
        let delivered = target.fire();
        native.cancel();
        trace!(delivered, fired = target.fired_count(), "Interrupt sent");
        tokio::time::sleep(retry_interval).await;
    }
}

/// Live governance of one execution. Dropping it stops the re-fire loop.
pub struct CancellationScope {
    native: CancellationToken,
    timer: JoinHandle<()>,
}

impl CancellationScope {
    /// Token for native async work started by the script.
    pub fn native_token(&self) -> CancellationToken {
        self.native.clone()
    }
}

impl Drop for CancellationScope {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
