//! Wait-until-condition polling and transient-failure retry.
//!
//! Every readiness gate in the pipeline funnels through [`wait_for`]: the
//! cluster reaching `RUNNING`, the mesh injection webhook appearing,
//! deployment rollouts, the gateway load balancer publishing an address,
//! and the frontend answering over HTTP. The poller owns the three knobs
//! the original shell loops hard-coded per call site: probe interval,
//! overall timeout, and cancellation.
//!
//! [`retry_with_backoff`] is the companion for one-shot operations that
//! fail transiently (a vendor CLI hiccup, an API server mid-upgrade). It
//! backs off exponentially with jitter instead of hammering a fixed
//! interval, and gives up immediately on errors that cannot recover.
//!
//! # Example
//!
//! ```ignore
//! use meshstrap::poll::{wait_for, PollConfig, PollOutcome};
//!
//! let ip = wait_for(
//!     &PollConfig::new(Duration::from_secs(5), Duration::from_secs(300)),
//!     "gateway external IP",
//!     &cancel,
//!     || async {
//!         match k8s.service_external_ip("demo", "frontend-external").await? {
//!             Some(ip) => Ok(PollOutcome::Ready(ip)),
//!             None => Ok(PollOutcome::pending("load balancer not published")),
//!         }
//!     },
//! )
//! .await?;
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// One observation of the condition being waited on
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome<T> {
    /// The condition holds; carries the observed value
    Ready(T),
    /// Not there yet; carries a human-readable reason for the report
    Pending(String),
}

impl<T> PollOutcome<T> {
    /// Shorthand for a pending outcome with a reason
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending(reason.into())
    }
}

/// Interval and budget for a condition poll
#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    /// Delay between probes
    pub interval: Duration,
    /// Overall budget; checked before every probe
    pub timeout: Duration,
}

impl PollConfig {
    /// Create a config with the given interval and timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Repeatedly probe a condition until it is ready, the budget is exhausted,
/// or the token is cancelled.
///
/// The probe is never run concurrently with itself. Transient probe errors
/// (see [`Error::is_transient`]) count as pending observations; anything
/// else aborts the wait. The timeout is checked before each probe, so a
/// zero budget probes zero times.
pub async fn wait_for<F, Fut, T>(
    config: &PollConfig,
    operation: &str,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<PollOutcome<T>>>,
{
    let start = Instant::now();
    let mut last_state = String::from("not yet probed");

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }

        if start.elapsed() >= config.timeout {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                waited: config.timeout,
                last: last_state,
            });
        }

        match probe().await {
            Ok(PollOutcome::Ready(value)) => {
                debug!(
                    operation = %operation,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Condition met"
                );
                return Ok(value);
            }
            Ok(PollOutcome::Pending(reason)) => {
                debug!(operation = %operation, state = %reason, "Still waiting");
                last_state = reason;
            }
            Err(e) if e.is_transient() => {
                warn!(operation = %operation, error = %e, "Probe failed transiently");
                last_state = format!("transient error: {}", e);
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    operation: operation.to_string(),
                });
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

/// Configuration for transient-failure retry with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an operation, retrying transient failures with jittered
/// exponential backoff.
///
/// Errors that are not transient (validation, template, cancellation)
/// propagate immediately; retrying them would only repeat the failure.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt == max_attempts {
                    error!(
                        operation = %operation,
                        attempt = attempt,
                        error = %e,
                        "Giving up after max attempts"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the current delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "Transient failure, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}
