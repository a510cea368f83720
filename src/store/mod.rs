//! Durable file-backed storage for tenants, channels, runs, tasks,
//! checkpoints and synced records.
//!
//! Every document is JSON written with write-then-rename, so readers never see
//! a partial row and state survives process restarts. Cross-worker exclusivity
//! lives in [`checkpoint`]; idempotent record writes in [`records`].

pub mod checkpoint;
pub mod records;

use std::{
   fs::{self, File, OpenOptions},
   io,
   path::{Path, PathBuf},
   time::Duration,
};

use fs4::FileExt;
use uuid::Uuid;

pub use self::records::UpsertOutcome;
use crate::{
   Result,
   config::Config,
   error::Error,
   types::{Channel, ChannelTask, RunStatus, SyncRun, Tenant},
   util::{path_component, read_json, read_json_dir, write_json_atomic},
};

/// Exclusive advisory lock on a lock file, released on drop.
pub(crate) struct FileLock {
   file: File,
}

impl FileLock {
   pub(crate) fn acquire(path: PathBuf) -> Result<Self> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let file = OpenOptions::new()
         .create(true)
         .read(true)
         .write(true)
         .truncate(false)
         .open(&path)?;
      file.lock_exclusive()?;
      Ok(Self { file })
   }
}

impl Drop for FileLock {
   fn drop(&mut self) {
      let _ = FileExt::unlock(&self.file);
   }
}

const INTERRUPTED: &str = "interrupted";

pub struct Store {
   root:          PathBuf,
   lease_timeout: Duration,
}

impl Store {
   /// Opens the store under the configured data directory.
   pub fn open(cfg: &Config) -> Result<Self> {
      Self::with_root(cfg.data_dir(), cfg.lease_timeout())
   }

   pub fn with_root(root: impl Into<PathBuf>, lease_timeout: Duration) -> Result<Self> {
      let root = root.into();
      fs::create_dir_all(&root)?;
      Ok(Self { root, lease_timeout })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   pub const fn lease_timeout(&self) -> Duration {
      self.lease_timeout
   }

   fn tenant_path(&self, tenant_id: &str) -> PathBuf {
      self
         .root
         .join("tenants")
         .join(format!("{}.json", path_component(tenant_id)))
   }

   fn channels_dir(&self, tenant_id: &str) -> PathBuf {
      self.root.join("channels").join(path_component(tenant_id))
   }

   fn channel_path(&self, tenant_id: &str, channel_id: &str) -> PathBuf {
      self
         .channels_dir(tenant_id)
         .join(format!("{}.json", path_component(channel_id)))
   }

   fn runs_dir(&self) -> PathBuf {
      self.root.join("runs")
   }

   fn run_path(&self, run_id: Uuid) -> PathBuf {
      self.runs_dir().join(format!("{run_id}.json"))
   }

   fn tasks_dir(&self, run_id: Uuid) -> PathBuf {
      self.root.join("tasks").join(run_id.to_string())
   }

   fn task_path(&self, run_id: Uuid, task_id: Uuid) -> PathBuf {
      self.tasks_dir(run_id).join(format!("{task_id}.json"))
   }

   pub(crate) fn active_dir(&self) -> PathBuf {
      self.root.join("active")
   }

   // Tenants

   pub fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
      write_json_atomic(&self.tenant_path(&tenant.id), tenant)
   }

   pub fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
      read_json(&self.tenant_path(tenant_id))
   }

   // Channels

   pub fn put_channel(&self, channel: &Channel) -> Result<()> {
      write_json_atomic(&self.channel_path(&channel.tenant_id, &channel.id), channel)
   }

   pub fn channel(&self, tenant_id: &str, channel_id: &str) -> Result<Option<Channel>> {
      read_json(&self.channel_path(tenant_id, channel_id))
   }

   /// Channels of a tenant ordered by external id.
   pub fn channels(&self, tenant_id: &str) -> Result<Vec<Channel>> {
      let mut channels: Vec<Channel> = read_json_dir(&self.channels_dir(tenant_id))?;
      channels.sort_by(|a, b| a.external_id.cmp(&b.external_id));
      Ok(channels)
   }

   /// Removes a channel together with its checkpoint and synced records.
   ///
   /// Refuses while a worker holds a live claim on the channel.
   pub fn remove_channel(&self, tenant_id: &str, channel_id: &str) -> Result<()> {
      self.remove_checkpoint_with(channel_id, || {
         match fs::remove_file(self.channel_path(tenant_id, channel_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
         }
      })?;
      self.remove_records(channel_id)
   }

   // Runs

   pub fn put_run(&self, run: &SyncRun) -> Result<()> {
      write_json_atomic(&self.run_path(run.id), run)
   }

   pub fn run(&self, run_id: Uuid) -> Result<Option<SyncRun>> {
      read_json(&self.run_path(run_id))
   }

   /// Runs, newest first, optionally restricted to one tenant.
   pub fn runs(&self, tenant_id: Option<&str>) -> Result<Vec<SyncRun>> {
      let mut runs: Vec<SyncRun> = read_json_dir(&self.runs_dir())?;
      if let Some(tenant_id) = tenant_id {
         runs.retain(|r| r.tenant_id == tenant_id);
      }
      runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
      Ok(runs)
   }

   /// Marks runs of a tenant that are still `running` as failed, together
   /// with the tasks their workers still owned, whose claims are dropped.
   ///
   /// Only valid while holding the tenant's run gate: any such run belongs to
   /// a process that died without finishing it.
   pub fn fail_interrupted_runs(&self, tenant_id: &str, except: Uuid) -> Result<usize> {
      let mut count = 0;
      for mut run in self.runs(Some(tenant_id))? {
         if run.id == except || run.status.is_terminal() {
            continue;
         }
         for mut task in self.tasks(run.id)? {
            if !task.status.is_owned() {
               continue;
            }
            if let Some(owner) = task.owner_worker_id.as_deref() {
               self.release(&task.channel_id, owner)?;
            }
            task.fail(INTERRUPTED);
            self.put_task(&task)?;
         }
         run.abort_reason = Some(INTERRUPTED.to_string());
         run.finish(RunStatus::Failed);
         self.put_run(&run)?;
         tracing::warn!(run_id = %run.id, tenant_id, "marked interrupted run as failed");
         count += 1;
      }
      Ok(count)
   }

   // Tasks

   pub fn put_task(&self, task: &ChannelTask) -> Result<()> {
      write_json_atomic(&self.task_path(task.parent_run_id, task.id), task)
   }

   pub fn task(&self, run_id: Uuid, task_id: Uuid) -> Result<ChannelTask> {
      read_json(&self.task_path(run_id, task_id))?.ok_or_else(|| Error::Store {
         op:     "task",
         reason: format!("task {task_id} of run {run_id} not found"),
      })
   }

   /// Tasks of a run ordered by external channel id.
   pub fn tasks(&self, run_id: Uuid) -> Result<Vec<ChannelTask>> {
      let mut tasks: Vec<ChannelTask> = read_json_dir(&self.tasks_dir(run_id))?;
      tasks.sort_by(|a, b| a.external_channel_id.cmp(&b.external_channel_id));
      Ok(tasks)
   }
}
