//! Failure classification and retry timing.
//!
//! The coordinator only decides what a failure means; the engine owns the
//! sleeping and the re-running.

use std::time::Duration;

use uplink_signer::AuthorizationError;

use crate::error::UploadError;

/// What to do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-issue the same call with a fresh authorization.
    Retry,
    /// Discard the transaction and every receipt, then start over.
    Reset,
    Fatal,
    Cancel,
}

/// Failure history of one retry loop.
#[derive(Debug, Clone, Default)]
pub struct FailureLedger {
    /// Whether a 403 discards the transaction for this call.
    forbidden_resets: bool,
    consecutive_auth: u32,
}

impl FailureLedger {
    pub fn new(forbidden_resets: bool) -> Self {
        Self {
            forbidden_resets,
            ..Self::default()
        }
    }
}

/// Maps errors to [`Action`]s.
#[derive(Debug, Clone)]
pub struct Coordinator {
    reset_codes: Vec<String>,
    max_auth_failures: u32,
}

impl Coordinator {
    pub fn new(reset_codes: impl IntoIterator<Item = String>, max_auth_failures: u32) -> Self {
        Self {
            reset_codes: reset_codes.into_iter().collect(),
            max_auth_failures: max_auth_failures.max(1),
        }
    }

    /// Adds codes to the reset set.
    pub fn extend_reset_codes(&mut self, codes: impl IntoIterator<Item = String>) {
        for code in codes {
            if !self.reset_codes.contains(&code) {
                self.reset_codes.push(code);
            }
        }
    }

    pub fn is_reset_code(&self, code: &str) -> bool {
        self.reset_codes.iter().any(|c| c == code)
    }

    /// Classifies `err`, updating the ledger.
    pub fn classify(&self, err: &UploadError, ledger: &mut FailureLedger) -> Action {
        match err {
            UploadError::Cancelled => Action::Cancel,
            UploadError::Transport { .. } => Action::Retry,
            UploadError::Authorization(auth) => {
                ledger.consecutive_auth += 1;
                if ledger.consecutive_auth >= self.max_auth_failures || is_permanent(auth) {
                    Action::Fatal
                } else {
                    Action::Retry
                }
            }
            UploadError::BackendRejection { status, code, .. } => {
                if code.as_deref().is_some_and(|c| self.is_reset_code(c)) {
                    Action::Reset
                } else if *status == 403 && ledger.forbidden_resets {
                    Action::Reset
                } else {
                    Action::Retry
                }
            }
            UploadError::ResetRequested(_) => Action::Reset,
            UploadError::Notification(_) => Action::Retry,
            UploadError::ProtocolMismatch { .. }
            | UploadError::KeyResolution(_)
            | UploadError::Precondition(_)
            | UploadError::SessionNotFound(_)
            | UploadError::Config(_)
            | UploadError::Io(_)
            | UploadError::Transfer(_)
            | UploadError::Protocol(_) => Action::Fatal,
        }
    }

    /// Classifies an error that escaped its retry loop: anything that would
    /// still be retried is treated as fatal.
    pub fn settle(&self, err: &UploadError, forbidden_resets: bool) -> Action {
        let mut ledger = FailureLedger::new(forbidden_resets);
        match self.classify(err, &mut ledger) {
            Action::Retry => Action::Fatal,
            other => other,
        }
    }
}

/// A signing server that answers but marks the request invalid will do so
/// again.
fn is_permanent(err: &AuthorizationError) -> bool {
    matches!(err, AuthorizationError::InvalidResponse(_))
}

/// How many times to try and how long to wait between tries.
pub trait RetryPolicy: Send + Sync {
    /// Whether another try is allowed after `attempt` (1-based) failed.
    fn should_retry(&self, attempt: u32) -> bool;

    /// Delay before the try following `attempt`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with ±25% jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl ExponentialBackoff {
    /// Calculates the delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.delay_for_attempt(attempt)
    }
}
