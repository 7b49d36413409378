use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Caller-side handle that aborts a running stream.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying token; pass it as `abort_signal` to tie runs together.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Owns the single token threaded through the model call and every tool
/// execution of one run, plus the optional timeout that fires it.
pub(crate) struct CancellationCoordinator {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl CancellationCoordinator {
    /// The run token is a child of `external`, so cancelling the caller's
    /// signal aborts the run but aborting the run leaves the caller's signal alone.
    pub fn new(external: Option<&CancellationToken>, timeout: Option<Duration>) -> Self {
        let token = external.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let timer = timeout.map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        debug!(timeout_ms = timeout.as_millis() as u64, "run timed out");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });
        Self { token, timer }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CancellationCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
