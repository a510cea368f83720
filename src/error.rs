use std::{fmt, io};

use thiserror::Error;

/// Main error type for chansync.
///
/// Covers storage I/O, configuration, adapter failures surfaced by the
/// platform collaborator, and the run-level conditions the coordinator
/// reports to its caller (fatal tenant/auth problems, rate-limit aborts,
/// concurrent run rejection).
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error while reading or writing durable state.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML serialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::ser::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Unrecoverable condition for the whole run.
   #[error("fatal: {0}")]
   Fatal(#[from] FatalError),

   /// Error reported by the platform adapter.
   #[error("adapter error: {0}")]
   Adapter(#[from] AdapterError),

   /// The upstream platform rate limited us; the run was aborted.
   #[error("rate limited: {0}")]
   RateLimited(#[source] AdapterError),

   /// A run stopped early; the reason is on the persisted run.
   #[error("sync run {run_id} aborted: {reason}")]
   RunAborted { run_id: uuid::Uuid, reason: String },

   /// Storage operation failed.
   #[error("store error during {op}: {reason}")]
   Store { op: &'static str, reason: String },

   /// Another run for the same tenant holds the run gate.
   #[error("a sync run is already active for tenant {tenant_id}")]
   RunAlreadyActive { tenant_id: String },

   /// The caller no longer owns the channel claim.
   #[error("claim on channel {channel_id} is not held by worker {worker_id}")]
   ClaimLost { channel_id: String, worker_id: String },

   /// A worker task panicked or was cancelled.
   #[error("worker join error: {0}")]
   Join(#[from] tokio::task::JoinError),
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::RunAlreadyActive { .. } => 10,
         Self::RateLimited(_) | Self::RunAborted { .. } => 11,
         Self::Fatal(_) => 2,
         Self::Config(_) => 3,
         _ => 1,
      }
   }
}

/// Conditions that abort a run immediately and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
   #[error("tenant not found: {0}")]
   TenantNotFound(String),

   #[error("channel not found: {0}")]
   ChannelNotFound(String),

   #[error("adapter authentication failed: {0}")]
   AuthFailed(String),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Config value is invalid or exceeds safety caps.
   #[error("invalid config: {0}")]
   Invalid(String),
}

/// What the adapter observed when a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
   /// Platform-specific rate-limit signal (outside of a plain HTTP 429).
   RateLimited { retry_after_ms: Option<u64> },
   /// Non-success HTTP status.
   Status(u16),
   Timeout,
   Connection,
   /// Credentials rejected by the platform.
   Auth,
   /// Failure inside the adapter itself (decode errors, client bugs).
   Internal,
   Other,
}

/// Error surfaced by a [`crate::adapter::PlatformAdapter`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
   pub kind:    AdapterErrorKind,
   pub message: String,
}

impl AdapterError {
   pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
      Self { kind, message: message.into() }
   }

   pub fn status(status: u16, message: impl Into<String>) -> Self {
      Self::new(AdapterErrorKind::Status(status), message)
   }

   pub fn rate_limited(retry_after_ms: Option<u64>) -> Self {
      Self::new(AdapterErrorKind::RateLimited { retry_after_ms }, "rate limited by platform")
   }

   pub fn timeout(message: impl Into<String>) -> Self {
      Self::new(AdapterErrorKind::Timeout, message)
   }

   pub fn auth(message: impl Into<String>) -> Self {
      Self::new(AdapterErrorKind::Auth, message)
   }
}

impl fmt::Display for AdapterError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.kind {
         AdapterErrorKind::Status(code) => write!(f, "HTTP {code}: {}", self.message),
         AdapterErrorKind::RateLimited { retry_after_ms: Some(ms) } => {
            write!(f, "{} (retry after {ms} ms)", self.message)
         },
         _ => f.write_str(&self.message),
      }
   }
}

impl std::error::Error for AdapterError {}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
