//! Bounded polling for asynchronous provider conditions.
//!
//! Providers use this for the two recurring waits of the lifecycle: a freshly
//! created instance acquiring a public address, and a deleted instance
//! disappearing from the provider's listing.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Outcome of a single poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Probe<T> {
    /// The condition holds; polling stops with this value.
    Ready(T),
    /// The condition does not hold yet; the string is the observed state,
    /// reported if polling eventually times out.
    Pending(String),
}

impl<T> Probe<T> {
    /// Builds a pending probe from anything printable.
    pub fn pending(state: impl Into<String>) -> Self {
        Self::Pending(state.into())
    }
}

/// Interval and attempt budget for a [`PollingWaiter`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between two evaluations.
    pub interval: Duration,
    /// Maximum number of evaluations.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Repeatedly evaluates a condition until it holds, fails, times out, or the
/// caller cancels.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PollingWaiter {
    policy: PollPolicy,
}

impl PollingWaiter {
    /// Creates a waiter with the given policy.
    #[must_use]
    pub const fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    /// Returns the waiter's policy.
    #[must_use]
    pub const fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Polls `check` until it reports [`Probe::Ready`].
    ///
    /// `check` runs at most `max_attempts` times with `interval` between
    /// evaluations. Its errors propagate immediately; callers that expect a
    /// resource to be briefly unknown must translate that into
    /// [`Probe::Pending`] themselves.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Timeout`] carrying the last pending state when
    /// the attempts run out, [`ProviderError::Cancelled`] when `cancel` fires,
    /// or whatever error `check` produced.
    pub async fn wait_until<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        action: &str,
        mut check: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>, ProviderError>>,
    {
        let mut last_state = String::from("not polled");
        for attempt in 1..=self.policy.max_attempts {
            let probe = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                probe = check() => probe?,
            };
            match probe {
                Probe::Ready(value) => return Ok(value),
                Probe::Pending(state) => {
                    debug!(action, attempt, state = %state, "condition pending");
                    last_state = state;
                }
            }
            if attempt < self.policy.max_attempts {
                sleep_or_cancel(cancel, self.policy.interval).await?;
            }
        }

        Err(ProviderError::Timeout {
            action: action.to_owned(),
            attempts: self.policy.max_attempts,
            last_state,
        })
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`ProviderError::Cancelled`] when the token is cancelled before or
/// during the sleep.
pub async fn sleep_or_cancel(
    cancel: &CancellationToken,
    duration: Duration,
) -> Result<(), ProviderError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProviderError::Cancelled),
        () = sleep(duration) => Ok(()),
    }
}
