//! Work distribution for a run: a bounded channel-job queue and the
//! tenant-scoped run gate that keeps a tenant to one active run.

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
   Result,
   error::Error,
   store::{FileLock, Store},
   types::ChannelJob,
   util::{hostname, path_component, pid_is_alive, read_json, write_json_atomic},
};

/// Bounded in-process queue feeding channel jobs to the worker pool.
///
/// Dropping the queue closes it; workers drain what is left and stop.
pub struct WorkQueue {
   tx:         flume::Sender<ChannelJob>,
   batch_size: usize,
}

impl WorkQueue {
   pub fn bounded(capacity: usize, batch_size: usize) -> (Self, flume::Receiver<ChannelJob>) {
      let (tx, rx) = flume::bounded(capacity.max(1));
      (Self { tx, batch_size: batch_size.max(1) }, rx)
   }

   /// Pushes `jobs` in batches of `batch_size`, yielding between batches.
   ///
   /// Stops early once `cancel` fires and returns how many jobs were queued.
   pub async fn enqueue_all(self, jobs: Vec<ChannelJob>, cancel: &CancellationToken) -> usize {
      let mut queued = 0;
      for (batch_no, batch) in jobs.chunks(self.batch_size).enumerate() {
         for job in batch {
            tokio::select! {
               biased;
               () = cancel.cancelled() => {
                  tracing::debug!(queued, "enqueue stopped by cancellation");
                  return queued;
               }
               sent = self.tx.send_async(job.clone()) => {
                  if sent.is_err() {
                     tracing::debug!(queued, "work queue closed by workers");
                     return queued;
                  }
                  queued += 1;
               }
            }
         }
         tracing::debug!(batch = batch_no, size = batch.len(), "enqueued job batch");
         tokio::task::yield_now().await;
      }
      queued
   }
}

/// Marker recorded while a tenant has an active run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveRun {
   pub run_id:     Uuid,
   pub tenant_id:  String,
   pub pid:        u32,
   pub hostname:   String,
   pub started_at: DateTime<Utc>,
}

impl ActiveRun {
   fn new(tenant_id: &str, run_id: Uuid) -> Self {
      Self {
         run_id,
         tenant_id: tenant_id.to_string(),
         pid: std::process::id(),
         hostname: hostname(),
         started_at: Utc::now(),
      }
   }

   /// Abandoned if older than `ttl` or left behind by a dead local process.
   pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
      let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
      if now.signed_duration_since(self.started_at) > ttl {
         return true;
      }
      self.hostname == hostname() && !pid_is_alive(self.pid)
   }
}

/// Tenant-scoped dedup key: at most one active run per tenant.
pub struct RunGate {
   dir: PathBuf,
   ttl: Duration,
}

impl RunGate {
   pub fn new(store: &Store, ttl: Duration) -> Self {
      Self { dir: store.active_dir(), ttl }
   }

   fn marker_path(&self, tenant_id: &str) -> PathBuf {
      self.dir.join(format!("{}.json", path_component(tenant_id)))
   }

   fn lock_path(&self, tenant_id: &str) -> PathBuf {
      self.dir.join(format!("{}.lock", path_component(tenant_id)))
   }

   /// Registers `run_id` as the tenant's active run.
   ///
   /// Fails with [`Error::RunAlreadyActive`] while another live run holds
   /// the gate; stale markers are taken over.
   pub fn acquire(&self, tenant_id: &str, run_id: Uuid) -> Result<ActiveRunGuard> {
      let _lock = FileLock::acquire(self.lock_path(tenant_id))?;
      let path = self.marker_path(tenant_id);

      if let Some(existing) = read_json::<ActiveRun>(&path)? {
         if !existing.is_stale(Utc::now(), self.ttl) {
            return Err(Error::RunAlreadyActive { tenant_id: tenant_id.to_string() });
         }
         tracing::warn!(
            tenant_id,
            stale_run_id = %existing.run_id,
            pid = existing.pid,
            "taking over stale active-run marker"
         );
      }

      write_json_atomic(&path, &ActiveRun::new(tenant_id, run_id))?;
      Ok(ActiveRunGuard { path, lock_path: self.lock_path(tenant_id), run_id })
   }

   pub fn active(&self, tenant_id: &str) -> Result<Option<ActiveRun>> {
      read_json(&self.marker_path(tenant_id))
   }
}

/// Holds a tenant's run gate; removes the marker on drop if it is still ours.
#[derive(Debug)]
pub struct ActiveRunGuard {
   path:      PathBuf,
   lock_path: PathBuf,
   run_id:    Uuid,
}

impl Drop for ActiveRunGuard {
   fn drop(&mut self) {
      let Ok(_lock) = FileLock::acquire(self.lock_path.clone()) else {
         return;
      };
      if let Ok(Some(marker)) = read_json::<ActiveRun>(&self.path)
         && marker.run_id == self.run_id
      {
         let _ = std::fs::remove_file(&self.path);
      }
   }
}
