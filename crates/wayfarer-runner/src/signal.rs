//! Step cancellation: user abort and step deadline composed into one signal.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Which side of a [`StepSignal`] fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    User,
    Deadline,
}

impl CancelCause {
    pub fn into_error(self) -> Error {
        match self {
            CancelCause::User => Error::Cancelled("step aborted by user".into()),
            CancelCause::Deadline => Error::Timeout("step deadline exceeded".into()),
        }
    }
}

/// Cancellation for one step. Cheap to clone; all clones share the outcome.
///
/// The first cause to fire is recorded and never overwritten, so a deadline
/// that elapses after a user abort still reports [`CancelCause::User`].
#[derive(Clone, Debug)]
pub struct StepSignal {
    user: CancellationToken,
    deadline: Option<Instant>,
    fired: Arc<OnceLock<CancelCause>>,
}

impl StepSignal {
    /// Combine a user token with an optional step timeout.
    pub fn compose(user: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            user,
            deadline: timeout.map(|t| Instant::now() + t),
            fired: Arc::new(OnceLock::new()),
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::compose(CancellationToken::new(), None)
    }

    fn record(&self, cause: CancelCause) -> CancelCause {
        let _ = self.fired.set(cause);
        self.fired.get().copied().unwrap_or(cause)
    }

    /// The cause, if the signal has fired.
    pub fn cause(&self) -> Option<CancelCause> {
        if let Some(cause) = self.fired.get() {
            return Some(*cause);
        }
        if self.user.is_cancelled() {
            return Some(self.record(CancelCause::User));
        }
        match self.deadline {
            Some(at) if Instant::now() >= at => Some(self.record(CancelCause::Deadline)),
            _ => None,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.cause().is_some()
    }

    /// `Err` if the signal has fired.
    pub fn check(&self) -> Result<()> {
        match self.cause() {
            Some(cause) => Err(cause.into_error()),
            None => Ok(()),
        }
    }

    /// Resolves when the signal fires.
    pub async fn cancelled(&self) -> CancelCause {
        if let Some(cause) = self.cause() {
            return cause;
        }
        let cause = match self.deadline {
            Some(at) => tokio::select! {
                biased;
                _ = self.user.cancelled() => CancelCause::User,
                _ = tokio::time::sleep_until(at) => CancelCause::Deadline,
            },
            None => {
                self.user.cancelled().await;
                CancelCause::User
            }
        };
        self.record(cause)
    }

    /// Run `fut` unless the signal fires first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            cause = self.cancelled() => Err(cause.into_error()),
            out = fut => out,
        }
    }

    /// [`guard`](Self::guard) plus an internal bound for one document
    /// operation. Elapsing the bound is a plain `Timeout`, not a cancellation.
    pub async fn bounded<T, F>(&self, limit: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard(async {
            match tokio::time::timeout(limit, fut).await {
                Ok(out) => out,
                Err(_) => Err(Error::Timeout(format!(
                    "{} did not finish within {}ms",
                    what,
                    limit.as_millis()
                ))),
            }
        })
        .await
    }

    /// Sleep, waking early if the signal fires.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.check();
        }
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

/// User-facing abort switch for a navigator.
///
/// Cancelling affects the step in flight; [`reset`](Self::reset) arms a
/// fresh token for the next one.
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.lock().cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    pub fn reset(&self) {
        let mut token = self.token.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}
