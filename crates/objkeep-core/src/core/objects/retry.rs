//! Bounded retry with failure classification and an interruptible backoff.

use std::fmt::Display;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What one attempt produced.
#[derive(Debug)]
pub enum CallbackResult<T, E> {
    Success(T),
    Failure { error: E, should_retry: bool },
}

impl<T, E> CallbackResult<T, E> {
    pub fn retryable(error: E) -> Self {
        Self::Failure {
            error,
            should_retry: true,
        }
    }

    pub fn fatal(error: E) -> Self {
        Self::Failure {
            error,
            should_retry: false,
        }
    }
}

/// Terminal result of an invocation. `Cancelled` is neither success nor failure.
#[derive(Debug)]
pub enum InvocationResult<T, E> {
    Succeeded { attempts: u32, value: T },
    Failed { attempts: u32, error: E },
    Cancelled { attempts: u32 },
}

#[derive(Debug)]
pub struct FailureEvent<'a, E> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: &'a E,
    pub will_retry: bool,
}

type FailureHook<E> = Box<dyn Fn(&FailureEvent<'_, E>) + Send + Sync>;

pub struct RetryExecutor<E> {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    on_failure: Option<FailureHook<E>>,
}

impl<E> RetryExecutor<E> {
    /// `max_attempts` below one is treated as one.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            on_failure: None,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    #[must_use]
    pub fn on_failure(mut self, hook: impl Fn(&FailureEvent<'_, E>) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before attempt `attempt + 1`: `initial * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    pub fn invoke<T>(
        &self,
        cancel: &CancellationToken,
        mut body: impl FnMut(u32) -> CallbackResult<T, E>,
    ) -> InvocationResult<T, E> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return InvocationResult::Cancelled { attempts: attempt };
            }
            attempt += 1;
            let (error, should_retry) = match body(attempt) {
                CallbackResult::Success(value) => {
                    return InvocationResult::Succeeded {
                        attempts: attempt,
                        value,
                    }
                }
                CallbackResult::Failure {
                    error,
                    should_retry,
                } => (error, should_retry),
            };
            let will_retry = should_retry && attempt < self.max_attempts;
            if let Some(hook) = &self.on_failure {
                hook(&FailureEvent {
                    attempt,
                    max_attempts: self.max_attempts,
                    error: &error,
                    will_retry,
                });
            }
            if !will_retry {
                return InvocationResult::Failed {
                    attempts: attempt,
                    error,
                };
            }
            let delay = self.backoff_after(attempt);
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "waiting before retry"
            );
            if cancel.wait_timeout(delay) {
                return InvocationResult::Cancelled { attempts: attempt };
            }
        }
    }
}

impl<E: Display + 'static> RetryExecutor<E> {
    /// Log every failed attempt under `area`.
    #[must_use]
    pub fn log_failures(self, area: &'static str) -> Self {
        self.on_failure(move |event| {
            warn!(
                area,
                attempt = event.attempt,
                max_attempts = event.max_attempts,
                will_retry = event.will_retry,
                error = %event.error,
                "request attempt failed"
            );
        })
    }
}

/// Shared flag that interrupts backoff waits.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        signal.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = signal
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn quick<E>(attempts: u32) -> RetryExecutor<E> {
        RetryExecutor::new(attempts).with_backoff(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn retries_until_success() {
        let result = quick::<String>(5).invoke(&CancellationToken::new(), |attempt| {
            if attempt < 3 {
                CallbackResult::retryable(format!("attempt {attempt}"))
            } else {
                CallbackResult::Success(attempt * 10)
            }
        });
        assert!(matches!(
            result,
            InvocationResult::Succeeded {
                attempts: 3,
                value: 30
            }
        ));
    }

    #[test]
    fn stops_on_non_retryable_failure() {
        let seen = Arc::new(AtomicU32::new(0));
        let hook_seen = Arc::clone(&seen);
        let executor = quick::<&str>(5).on_failure(move |event| {
            assert!(!event.will_retry);
            hook_seen.fetch_add(1, Ordering::SeqCst);
        });
        let result = executor.invoke(&CancellationToken::new(), |_| {
            CallbackResult::<(), _>::fatal("malformed")
        });
        assert!(matches!(
            result,
            InvocationResult::Failed {
                attempts: 1,
                error: "malformed"
            }
        ));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result = quick::<&str>(3).invoke(&CancellationToken::new(), |_| {
            calls += 1;
            CallbackResult::<(), _>::retryable("busy")
        });
        assert_eq!(calls, 3);
        assert!(matches!(result, InvocationResult::Failed { attempts: 3, .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let executor = RetryExecutor::<()>::new(10)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(executor.backoff_after(1), Duration::from_millis(100));
        assert_eq!(executor.backoff_after(2), Duration::from_millis(200));
        assert_eq!(executor.backoff_after(3), Duration::from_millis(350));
        assert_eq!(executor.backoff_after(40), Duration::from_millis(350));
    }

    #[test]
    fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let executor = RetryExecutor::<&str>::new(5)
            .with_backoff(Duration::from_secs(30), Duration::from_secs(30));
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let started = Instant::now();
        let result = executor.invoke(&token, |_| CallbackResult::<(), _>::retryable("busy"));
        handle.join().expect("canceller thread");
        assert!(matches!(result, InvocationResult::Cancelled { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancelled_before_start_makes_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let result = quick::<&str>(3).invoke(&token, |_| CallbackResult::Success(()));
        assert!(matches!(result, InvocationResult::Cancelled { attempts: 0 }));
    }
}
