use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::{Error, Operation, Result};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

pub(crate) const MINIMUM_DELAY: Duration = Duration::from_secs(2);
pub(crate) const LINEAR_MAXIMUM_RETRY: u32 = 10;
pub(crate) const EXPONENTIAL_MAXIMUM_RETRY: u32 = 6;
pub(crate) const DEFAULT_MAXIMUM_DELAY: Duration = Duration::from_secs(150);

/// Status codes that are never retried unless configured otherwise.
pub(crate) const DEFAULT_NON_RETRYABLE: [u16; 4] = [400, 401, 403, 404];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    None,
    Linear,
    Exponential,
}

/// Reconnection policy for subscribe and heartbeat calls.
///
/// Attempts are 1-based: the first retry after the initial failure is
/// attempt 1.
/// - `Linear`: `min(base_delay * attempt, maximum_delay)`
/// - `Exponential`: `min(base_delay * 2^(attempt-1) * jitter, maximum_delay)`
///   with jitter in `[1.0, 1.25)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfiguration {
    pub policy: RetryPolicyKind,
    pub base_delay: Duration,
    pub maximum_delay: Duration,
    pub maximum_retry: u32,
    pub non_retryable_status_codes: BTreeSet<u16>,
    pub jitter: bool,
    /// Operations that are never retried.
    pub excluded_operations: Vec<Operation>,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self::exponential(MINIMUM_DELAY, DEFAULT_MAXIMUM_DELAY, EXPONENTIAL_MAXIMUM_RETRY)
    }
}

impl RetryConfiguration {
    pub fn none() -> Self {
        Self {
            policy: RetryPolicyKind::None,
            maximum_retry: 0,
            ..Self::exponential(MINIMUM_DELAY, DEFAULT_MAXIMUM_DELAY, 0)
        }
    }

    pub fn linear(delay: Duration, maximum_retry: u32) -> Self {
        Self {
            policy: RetryPolicyKind::Linear,
            base_delay: delay,
            maximum_delay: delay.saturating_mul(maximum_retry.max(1)),
            maximum_retry,
            non_retryable_status_codes: DEFAULT_NON_RETRYABLE.into_iter().collect(),
            jitter: false,
            excluded_operations: Vec::new(),
        }
    }

    pub fn exponential(minimum_delay: Duration, maximum_delay: Duration, maximum_retry: u32) -> Self {
        Self {
            policy: RetryPolicyKind::Exponential,
            base_delay: minimum_delay,
            maximum_delay,
            maximum_retry,
            non_retryable_status_codes: DEFAULT_NON_RETRYABLE.into_iter().collect(),
            jitter: true,
            excluded_operations: Vec::new(),
        }
    }

    pub fn excluding(mut self, operation: Operation) -> Self {
        if !self.excluded_operations.contains(&operation) {
            self.excluded_operations.push(operation);
        }
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.policy {
            RetryPolicyKind::None => Ok(()),
            RetryPolicyKind::Linear => {
                if self.base_delay < MINIMUM_DELAY {
                    return Err(Error::Validation(format!(
                        "linear retry delay must be at least {}s",
                        MINIMUM_DELAY.as_secs()
                    )));
                }
                if self.maximum_retry > LINEAR_MAXIMUM_RETRY {
                    return Err(Error::Validation(format!(
                        "linear retry allows at most {LINEAR_MAXIMUM_RETRY} retries"
                    )));
                }
                Ok(())
            }
            RetryPolicyKind::Exponential => {
                if self.base_delay < MINIMUM_DELAY {
                    return Err(Error::Validation(format!(
                        "exponential retry minimum delay must be at least {}s",
                        MINIMUM_DELAY.as_secs()
                    )));
                }
                if self.maximum_delay < self.base_delay {
                    return Err(Error::Validation(
                        "exponential retry maximum delay is below the minimum delay".into(),
                    ));
                }
                if self.maximum_retry > EXPONENTIAL_MAXIMUM_RETRY {
                    return Err(Error::Validation(format!(
                        "exponential retry allows at most {EXPONENTIAL_MAXIMUM_RETRY} retries"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const GIVE_UP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfiguration,
}

impl RetryPolicy {
    pub fn new(config: RetryConfiguration) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfiguration {
        &self.config
    }

    /// Decide whether the `attempt`-th retry of `operation` should happen
    /// after `error`, and how long to wait before it.
    pub fn decide(&self, operation: Operation, attempt: u32, error: &Error) -> RetryDecision {
        if self.config.policy == RetryPolicyKind::None
            || self.config.excluded_operations.contains(&operation)
            || attempt == 0
            || attempt > self.config.maximum_retry
            || !self.is_retryable(error)
        {
            return RetryDecision::GIVE_UP;
        }

        RetryDecision {
            retry: true,
            delay: self.delay(attempt),
        }
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::Network(_) | Error::Timeout | Error::Decode(_) => true,
            Error::Service { status, .. } => {
                if self.config.non_retryable_status_codes.contains(status) {
                    return false;
                }
                *status >= 500 || *status == 429
            }
            Error::Validation(_) | Error::Listener(_) | Error::ClientStopped => false,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let max = self.config.maximum_delay;
        match self.config.policy {
            RetryPolicyKind::None => Duration::ZERO,
            RetryPolicyKind::Linear => self.config.base_delay.saturating_mul(attempt).min(max),
            RetryPolicyKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(30);
                let raw = self.config.base_delay.saturating_mul(1u32 << exponent).min(max);
                if !self.config.jitter {
                    return raw;
                }
                Duration::try_from_secs_f64(raw.as_secs_f64() * jitter_factor())
                    .unwrap_or(max)
                    .min(max)
            }
        }
    }
}

/// Multiplier in `[1.0, 1.25)` drawn from the clock's sub-second nanos.
fn jitter_factor() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    1.0 + f64::from(nanos % 250) / 1000.0
}

// ---------------------------------------------------------------------------
// Receive recovery
// ---------------------------------------------------------------------------

/// Broad error classes used to pick the recovery action once receive
/// retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Timeout,
    Decode,
    ClientError,
    ServerError,
    Other,
}

impl ErrorClass {
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Network(_) => ErrorClass::Network,
            Error::Timeout => ErrorClass::Timeout,
            Error::Decode(_) => ErrorClass::Decode,
            Error::Service { status, .. } if *status >= 500 => ErrorClass::ServerError,
            Error::Service { .. } => ErrorClass::ClientError,
            _ => ErrorClass::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Start a fresh handshake, keeping the last cursor.
    Rehandshake,
    /// Park in the stopped state until `reconnect`.
    Stop,
}

/// Recovery table applied when a receive failure is not retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveRecovery {
    pub default: RecoveryAction,
    pub overrides: BTreeMap<ErrorClass, RecoveryAction>,
}

impl Default for ReceiveRecovery {
    fn default() -> Self {
        Self {
            default: RecoveryAction::Rehandshake,
            overrides: BTreeMap::new(),
        }
    }
}

impl ReceiveRecovery {
    pub fn with(mut self, class: ErrorClass, action: RecoveryAction) -> Self {
        self.overrides.insert(class, action);
        self
    }

    pub fn action_for(&self, error: &Error) -> RecoveryAction {
        self.overrides
            .get(&ErrorClass::of(error))
            .copied()
            .unwrap_or(self.default)
    }
}
