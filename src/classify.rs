//! Rate-limit classifier: maps adapter and engine errors onto the retry
//! taxonomy used by the executor and coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
   config::Config,
   error::{AdapterError, AdapterErrorKind, Error},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
   /// Upstream quota exhausted. Never retried here; aborts the run.
   RateLimit,
   /// Worth retrying with backoff.
   Transient,
   /// Retrying cannot help.
   Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedError {
   pub class:                ErrorClass,
   pub retryable:            bool,
   pub suggested_backoff_ms: u64,
}

impl ClassifiedError {
   const fn rate_limit(backoff_ms: u64) -> Self {
      Self { class: ErrorClass::RateLimit, retryable: false, suggested_backoff_ms: backoff_ms }
   }

   const fn transient(backoff_ms: u64) -> Self {
      Self { class: ErrorClass::Transient, retryable: true, suggested_backoff_ms: backoff_ms }
   }

   const fn fatal() -> Self {
      Self { class: ErrorClass::Fatal, retryable: false, suggested_backoff_ms: 0 }
   }
}

/// Backoff and attempt limits for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
   pub max_attempts:          u32,
   pub base_backoff_ms:       u64,
   pub max_backoff_ms:        u64,
   pub rate_limit_backoff_ms: u64,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

impl RetryPolicy {
   pub fn from_config(cfg: &Config) -> Self {
      Self {
         max_attempts:          cfg.effective_max_attempts(),
         base_backoff_ms:       cfg.base_backoff_ms,
         max_backoff_ms:        cfg.max_backoff_ms,
         rate_limit_backoff_ms: cfg.rate_limit_backoff_ms,
      }
   }

   /// Exponential backoff for the given zero-based retry number.
   pub fn backoff_ms(&self, retry: u32) -> u64 {
      let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
      self
         .base_backoff_ms
         .saturating_mul(factor)
         .min(self.max_backoff_ms)
   }

   pub fn backoff(&self, retry: u32) -> Duration {
      Duration::from_millis(self.backoff_ms(retry))
   }
}

/// Classifies adapter errors with a specific retry policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
   policy: RetryPolicy,
}

impl Classifier {
   pub const fn new(policy: RetryPolicy) -> Self {
      Self { policy }
   }

   pub const fn policy(&self) -> &RetryPolicy {
      &self.policy
   }

   pub fn classify(&self, err: &AdapterError) -> ClassifiedError {
      classify_with(err, &self.policy)
   }

   pub fn classify_error(&self, err: &Error) -> ClassifiedError {
      match err {
         Error::Adapter(e) => self.classify(e),
         Error::RateLimited(e) => {
            let mut classified = self.classify(e);
            classified.class = ErrorClass::RateLimit;
            classified.retryable = false;
            classified
         },
         Error::Fatal(_) | Error::Config(_) | Error::ClaimLost { .. } => ClassifiedError::fatal(),
         _ => ClassifiedError::transient(self.policy.backoff_ms(0)),
      }
   }

   /// True while another attempt is allowed after `attempts` tries.
   pub const fn should_retry(&self, classified: &ClassifiedError, attempts: u32) -> bool {
      classified.retryable && attempts < self.policy.max_attempts
   }
}

/// Classifies an adapter error with the default retry policy.
pub fn classify(err: &AdapterError) -> ClassifiedError {
   classify_with(err, &RetryPolicy::default())
}

fn classify_with(err: &AdapterError, policy: &RetryPolicy) -> ClassifiedError {
   match err.kind {
      AdapterErrorKind::RateLimited { retry_after_ms } => {
         ClassifiedError::rate_limit(retry_after_ms.unwrap_or(policy.rate_limit_backoff_ms))
      },
      AdapterErrorKind::Status(429) => ClassifiedError::rate_limit(policy.rate_limit_backoff_ms),
      AdapterErrorKind::Status(408) => ClassifiedError::transient(policy.backoff_ms(0)),
      AdapterErrorKind::Status(400..=499) | AdapterErrorKind::Auth => ClassifiedError::fatal(),
      AdapterErrorKind::Status(500..=599)
      | AdapterErrorKind::Timeout
      | AdapterErrorKind::Connection
      | AdapterErrorKind::Internal => ClassifiedError::transient(policy.backoff_ms(0)),
      AdapterErrorKind::Status(_) | AdapterErrorKind::Other => {
         if mentions_rate_limit(&err.message) {
            ClassifiedError::rate_limit(policy.rate_limit_backoff_ms)
         } else {
            ClassifiedError::transient(policy.backoff_ms(0))
         }
      },
   }
}

/// Credentials rejected outright, as opposed to a per-resource permission
/// error.
pub const fn is_auth_failure(err: &AdapterError) -> bool {
   matches!(err.kind, AdapterErrorKind::Auth | AdapterErrorKind::Status(401))
}

fn mentions_rate_limit(message: &str) -> bool {
   let message = message.to_lowercase();
   ["rate limit", "ratelimit", "rate-limit", "too many requests"]
      .iter()
      .any(|needle| message.contains(needle))
}
