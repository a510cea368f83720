//! Configuration for the sync engine: pool sizing, paging, leases and retries.
//!
//! A [`Config`] is built once at startup and handed to the components that
//! need it. Nothing reads the environment after that point.

use std::{
   fs,
   path::{Path, PathBuf},
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const WORKER_CONCURRENCY_CAP: usize = 64;
pub const PAGE_SIZE_CAP: usize = 1000;
pub const ENQUEUE_BATCH_SIZE_CAP: usize = 1000;
pub const MAX_ATTEMPTS_CAP: u32 = 10;

const ENV_PREFIX: &str = "CHANSYNC_";

/// Engine configuration loaded from a config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   /// Root of the durable store. Defaults to `~/.chansync/data`.
   pub data_dir: Option<PathBuf>,

   pub worker_concurrency: usize,
   pub page_size:          usize,
   pub queue_capacity:     usize,
   pub enqueue_batch_size: usize,
   pub progress_interval:  u64,
   pub poll_interval_ms:   u64,

   pub lease_timeout_ms:  u64,
   pub active_run_ttl_ms: u64,

   pub max_attempts:          u32,
   pub base_backoff_ms:       u64,
   pub max_backoff_ms:        u64,
   pub rate_limit_backoff_ms: u64,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         data_dir: None,
         worker_concurrency: 10,
         page_size: 100,
         queue_capacity: 256,
         enqueue_batch_size: 50,
         progress_interval: 200,
         poll_interval_ms: 1000,
         lease_timeout_ms: 300_000,
         active_run_ttl_ms: 6 * 60 * 60 * 1000,
         max_attempts: 3,
         base_backoff_ms: 500,
         max_backoff_ms: 30_000,
         rate_limit_backoff_ms: 60_000,
      }
   }
}

impl Config {
   /// Loads config from the global config file (creating it with defaults if
   /// missing) merged with `CHANSYNC_*` environment variables.
   pub fn load() -> Self {
      let path = ensure_global_config();
      Self::load_from(path.as_deref())
   }

   /// Loads config from an explicit TOML file merged with the environment.
   pub fn load_from(path: Option<&Path>) -> Self {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));
      if let Some(path) = path {
         figment = figment.merge(Toml::file(path));
      }

      figment
         .merge(Env::prefixed(ENV_PREFIX).lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   fn create_default_config(path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let toml = toml::to_string_pretty(&Self::default())?;
      fs::write(path, toml)?;
      Ok(())
   }

   pub fn validate(&self) -> Result<()> {
      fn cap<T: PartialOrd + std::fmt::Display>(name: &str, value: T, cap: T) -> Result<()> {
         if value > cap {
            return Err(
               ConfigError::Invalid(format!("{name} {value} exceeds hard cap {cap}")).into(),
            );
         }
         Ok(())
      }

      cap("worker_concurrency", self.worker_concurrency, WORKER_CONCURRENCY_CAP)?;
      cap("page_size", self.page_size, PAGE_SIZE_CAP)?;
      cap("enqueue_batch_size", self.enqueue_batch_size, ENQUEUE_BATCH_SIZE_CAP)?;
      cap("max_attempts", self.max_attempts, MAX_ATTEMPTS_CAP)?;

      if self.lease_timeout_ms == 0 {
         return Err(ConfigError::Invalid("lease_timeout_ms must be positive".to_string()).into());
      }
      if self.base_backoff_ms > self.max_backoff_ms {
         return Err(
            ConfigError::Invalid(format!(
               "base_backoff_ms {} exceeds max_backoff_ms {}",
               self.base_backoff_ms, self.max_backoff_ms
            ))
            .into(),
         );
      }
      Ok(())
   }

   pub fn data_dir(&self) -> PathBuf {
      self
         .data_dir
         .clone()
         .unwrap_or_else(|| base_dir().join("data"))
   }

   pub fn effective_worker_concurrency(&self) -> usize {
      self.worker_concurrency.clamp(1, WORKER_CONCURRENCY_CAP)
   }

   /// Page size capped by both the configured cap and the adapter's hard limit.
   pub fn effective_page_size(&self, adapter_limit: usize) -> usize {
      self
         .page_size
         .min(PAGE_SIZE_CAP)
         .min(adapter_limit)
         .max(1)
   }

   pub fn effective_enqueue_batch_size(&self) -> usize {
      self.enqueue_batch_size.clamp(1, ENQUEUE_BATCH_SIZE_CAP)
   }

   pub fn effective_queue_capacity(&self) -> usize {
      self.queue_capacity.max(1)
   }

   pub fn effective_max_attempts(&self) -> u32 {
      self.max_attempts.clamp(1, MAX_ATTEMPTS_CAP)
   }

   pub fn progress_interval(&self) -> u64 {
      self.progress_interval.max(1)
   }

   pub const fn poll_interval(&self) -> Duration {
      Duration::from_millis(self.poll_interval_ms)
   }

   pub const fn lease_timeout(&self) -> Duration {
      Duration::from_millis(self.lease_timeout_ms)
   }

   pub const fn active_run_ttl(&self) -> Duration {
      Duration::from_millis(self.active_run_ttl_ms)
   }
}

/// Returns the base directory for chansync data and configuration
pub fn base_dir() -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(".chansync"))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".chansync"))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".chansync")
      })
}

pub fn config_file_path() -> PathBuf {
   base_dir().join("config.toml")
}

fn ensure_global_config() -> Option<PathBuf> {
   let path = config_file_path();
   if !path.exists()
      && let Err(e) = Config::create_default_config(&path)
   {
      tracing::warn!("failed to write default config to {}: {e}", path.display());
      return None;
   }
   Some(path)
}
