//! Bounded retry of the acquisition step.
//!
//! The policy is data, the decision is [`classify`], and the loop in
//! [`acquire_with_retry`] only sequences the two.

use crate::errors::AcquisitionError;
use crate::model::{AttemptRecord, Output, TestCase};
use crate::providers::{AcquireContext, OutputProvider};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, used where acquisition is a storage read.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `failed_attempts + 1`; capped exponential.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(31) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        let capped = base.min(self.max_backoff_ms as f64);
        let ms = if self.jitter {
            use rand::Rng;
            // 0.8 .. 1.2, never above the cap
            let factor = rand::thread_rng().gen_range(0.8..1.2);
            (capped * factor).min(self.max_backoff_ms as f64)
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { backoff: Duration },
    Terminal,
}

/// Decide what to do after attempt number `attempt` failed with `err`.
pub fn classify(policy: &RetryPolicy, err: &AcquisitionError, attempt: u32) -> RetryDecision {
    if err.is_retryable() && attempt < policy.max_attempts {
        RetryDecision::Retry {
            backoff: policy.backoff_for(attempt),
        }
    } else {
        RetryDecision::Terminal
    }
}

/// Run `provider.acquire` under `policy`, recording every attempt.
///
/// Cancellation is observed before each attempt and during backoff; a hard
/// cancel also aborts the attempt in flight.
pub async fn acquire_with_retry(
    provider: &dyn OutputProvider,
    tc: &TestCase,
    ctx: &AcquireContext,
    policy: &RetryPolicy,
) -> (Result<Output, AcquisitionError>, Vec<AttemptRecord>) {
    let mut attempts = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return (Err(AcquisitionError::Cancelled), attempts);
        }
        attempt += 1;
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.hard_cancelled() => Err(AcquisitionError::Cancelled),
            r = provider.acquire(tc, ctx) => r,
        };

        let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        let err = match result {
            Ok(output) => {
                attempts.push(AttemptRecord {
                    attempt_no: attempt,
                    ok: true,
                    error_kind: None,
                    message: None,
                    duration_ms,
                });
                return (Ok(output), attempts);
            }
            Err(e) => e,
        };

        attempts.push(AttemptRecord {
            attempt_no: attempt,
            ok: false,
            error_kind: Some(err.kind().to_string()),
            message: Some(err.to_string()),
            duration_ms,
        });

        match classify(policy, &err, attempt) {
            RetryDecision::Terminal => {
                debug!(test_case_id = %tc.id, attempt, error = %err, "acquisition failed terminally");
                return (Err(err), attempts);
            }
            RetryDecision::Retry { backoff } => {
                warn!(
                    test_case_id = %tc.id,
                    error = %err,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying acquisition"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return (Err(AcquisitionError::Cancelled), attempts);
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
