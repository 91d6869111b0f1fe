//! Caller context: cancellation and deadline for one store operation.

use std::future::Future;
use std::time::Duration;

use horizon_core::HzError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Ctx {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Ctx {
    /// Never cancelled, no deadline.
    pub fn background() -> Self { Self::default() }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { token: CancellationToken::new(), deadline: Some(Instant::now() + timeout) }
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Derived context: cancelled with its parent, deadline is the earlier one.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { token: self.token.child_token(), deadline }
    }

    pub fn cancel(&self) { self.token.cancel() }

    pub fn token(&self) -> &CancellationToken { &self.token }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    /// Fail fast if the context is already done.
    pub fn check(&self, op: &str, key: &str) -> Result<(), HzError> {
        if self.token.is_cancelled() {
            return Err(HzError::cancelled(format!("{} {:?}: context cancelled", op, key)));
        }
        if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            return Err(HzError::cancelled(format!("{} {:?}: deadline exceeded", op, key)));
        }
        Ok(())
    }

    /// Drive `fut` unless the context finishes first. Cancellation wins ties,
    /// so a done context never starts substrate work.
    pub async fn run<F: Future>(&self, op: &str, key: &str, fut: F) -> Result<F::Output, HzError> {
        self.check(op, key)?;
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HzError::cancelled(format!("{} {:?}: context cancelled", op, key))),
            _ = expired => Err(HzError::cancelled(format!("{} {:?}: deadline exceeded", op, key))),
            out = fut => Ok(out),
        }
    }
}
