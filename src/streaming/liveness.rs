//! Supervisor liveness for transfer workers.
//!
//! A worker holds a child of the supervisor's cancellation token. Cancellation
//! means the supervisor is gone or shutting down and nothing will observe the
//! transfer's outcome, so the worker must stop rather than run unsupervised.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    token: CancellationToken,
}

impl LivenessMonitor {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A monitor that is never cancelled, for standalone workers.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    /// True while the supervisor is alive.
    pub fn is_supervised(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
