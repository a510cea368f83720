//! Sync coordinator: turns a tenant-level request into channel tasks, runs
//! them on a bounded worker pool and reports the outcome of every channel.

use std::{
   any::Any,
   collections::{HashMap, HashSet},
   future::Future,
   panic::AssertUnwindSafe,
   sync::Arc,
};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{task::JoinSet, time};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
   Result,
   adapter::PlatformAdapter,
   classify::{Classifier, ErrorClass, RetryPolicy, is_auth_failure},
   config::Config,
   error::{AdapterError, AdapterErrorKind, Error, FatalError},
   executor::{ChannelExecutor, ExecutionOutcome},
   progress::{AggregateProgress, ProgressAggregator, ProgressCallback},
   queue::{RunGate, WorkQueue},
   store::Store,
   types::{
      Channel, ChannelJob, ChannelOutcome, ChannelTask, ErrorRecord, RunJob, RunStatus, SyncRun,
      SyncRunResult, TaskStatus, Tenant,
   },
   util::hostname,
};

/// Condition raised by a worker that stops the whole run
#[derive(Debug, Clone)]
enum AbortCause {
   RateLimited { channel_id: String, external_channel_id: String, error: AdapterError },
   AuthFailed { channel_id: String, external_channel_id: String, error: AdapterError },
}

impl AbortCause {
   fn channel_id(&self) -> &str {
      match self {
         Self::RateLimited { channel_id, .. } | Self::AuthFailed { channel_id, .. } => channel_id,
      }
   }

   fn reason(&self) -> String {
      match self {
         Self::RateLimited { external_channel_id, error, .. } => {
            format!("rate limited while syncing channel {external_channel_id}: {error}")
         },
         Self::AuthFailed { external_channel_id, error, .. } => {
            format!("authentication failed while syncing channel {external_channel_id}: {error}")
         },
      }
   }
}

type AbortSlot = Arc<Mutex<Option<AbortCause>>>;

pub struct SyncCoordinator<A: PlatformAdapter + ?Sized + 'static> {
   adapter:    Arc<A>,
   store:      Arc<Store>,
   cfg:        Config,
   classifier: Classifier,
}

impl<A: PlatformAdapter + ?Sized + 'static> SyncCoordinator<A> {
   pub fn new(adapter: Arc<A>, store: Arc<Store>, cfg: Config) -> Self {
      let classifier = Classifier::new(RetryPolicy::from_config(&cfg));
      Self { adapter, store, cfg, classifier }
   }

   /// Runs one sync for `job.tenant_id` and reports every channel's outcome.
   ///
   /// A rate-limit signal stops the run early; the result then carries
   /// status `aborted` and the abort reason. Fatal conditions are persisted
   /// on the run and returned as errors.
   pub async fn run_sync(
      &self,
      job: RunJob,
      progress: &mut dyn ProgressCallback,
   ) -> Result<SyncRunResult> {
      let tenant = self
         .store
         .tenant(&job.tenant_id)?
         .ok_or_else(|| FatalError::TenantNotFound(job.tenant_id.clone()))?;

      let mut run = SyncRun::new(&tenant.id, job.sync_type);
      let _gate = RunGate::new(&self.store, self.cfg.active_run_ttl()).acquire(&tenant.id, run.id)?;
      let interrupted = self.store.fail_interrupted_runs(&tenant.id, run.id)?;

      run.status = RunStatus::Running;
      run.started_at = Some(Utc::now());
      self.store.put_run(&run)?;
      tracing::info!(
         run_id = %run.id,
         tenant_id = %tenant.id,
         sync_type = %job.sync_type,
         interrupted,
         "sync run started"
      );

      let channels = match self.prepare(&tenant, &job, &mut run).await {
         Ok(channels) => channels,
         Err(err) => return self.stop(run, err),
      };
      let abort = match self.run_channels(&job, &run, &channels, progress).await {
         Ok(abort) => abort,
         Err(err) => return self.stop(run, err),
      };
      let outcomes = match self.finish(&mut run, abort.as_ref()) {
         Ok(outcomes) => outcomes,
         Err(err) => return self.stop(run, err),
      };

      if let Some(AbortCause::AuthFailed { error, .. }) = abort {
         return Err(FatalError::AuthFailed(error.to_string()).into());
      }
      Ok(result_of(&run, outcomes))
   }

   /// Creates one task per channel and runs them on the worker pool.
   async fn run_channels(
      &self,
      job: &RunJob,
      run: &SyncRun,
      channels: &[Channel],
      progress: &mut dyn ProgressCallback,
   ) -> Result<Option<AbortCause>> {
      let tasks: Vec<ChannelTask> = channels
         .iter()
         .map(|channel| ChannelTask::pending(run.id, channel))
         .collect();
      for task in &tasks {
         self.store.put_task(task)?;
      }
      if tasks.is_empty() {
         return Ok(None);
      }
      let jobs: Vec<ChannelJob> = tasks
         .iter()
         .map(|task| ChannelJob::for_task(task, job.sync_type, job.date_range()))
         .collect();

      let mut live = LiveRun { run: run.clone(), store: &self.store, inner: progress };
      self.fan_out(run.id, jobs, &mut live).await
   }

   async fn prepare(&self, tenant: &Tenant, job: &RunJob, run: &mut SyncRun) -> Result<Vec<Channel>> {
      let reachable = self
         .call_adapter("verify_connection", || {
            self.adapter.verify_connection(&tenant.workspace_id)
         })
         .await?;
      if !reachable {
         return Err(FatalError::TenantNotFound(format!(
            "{} (workspace {} unreachable)",
            tenant.id, tenant.workspace_id
         ))
         .into());
      }

      let channels = self.reconcile_channels(tenant, &mut run.errors).await?;
      select_channels(channels, job.channel_ids.as_deref())
   }

   /// Brings the stored channel list in line with the platform.
   ///
   /// Returns the tenant's current channels ordered by external id. Channels
   /// that cannot be removed are reported in `errors` and skipped.
   pub async fn reconcile_channels(
      &self,
      tenant: &Tenant,
      errors: &mut Vec<ErrorRecord>,
   ) -> Result<Vec<Channel>> {
      let external = self
         .call_adapter("fetch_channels", || self.adapter.fetch_channels(&tenant.workspace_id))
         .await
         .map_err(|err| match err {
            Error::Adapter(e) if e.kind == AdapterErrorKind::Status(404) => {
               FatalError::TenantNotFound(format!("{} ({e})", tenant.id)).into()
            },
            err => err,
         })?;

      let mut stored: HashMap<String, Channel> = self
         .store
         .channels(&tenant.id)?
         .into_iter()
         .map(|c| (c.external_id.clone(), c))
         .collect();

      let (mut created, mut updated, mut removed) = (0usize, 0usize, 0usize);
      let mut seen = HashSet::new();
      let mut current = Vec::with_capacity(external.len());
      for ext in external {
         if !seen.insert(ext.external_id.clone()) {
            continue;
         }
         let channel = match stored.remove(&ext.external_id) {
            Some(mut existing) => {
               if existing.name != ext.name || existing.kind != ext.kind {
                  existing.name = ext.name;
                  existing.kind = ext.kind;
                  existing.updated_at = Utc::now();
                  self.store.put_channel(&existing)?;
                  updated += 1;
               }
               existing
            },
            None => {
               let channel = Channel {
                  id:          Uuid::new_v4().to_string(),
                  tenant_id:   tenant.id.clone(),
                  external_id: ext.external_id,
                  name:        ext.name,
                  kind:        ext.kind,
                  updated_at:  Utc::now(),
               };
               self.store.put_channel(&channel)?;
               created += 1;
               channel
            },
         };
         current.push(channel);
      }

      for gone in stored.into_values() {
         match self.store.remove_channel(&tenant.id, &gone.id) {
            Ok(()) => removed += 1,
            Err(err) => {
               tracing::warn!(
                  tenant_id = %tenant.id,
                  channel_id = %gone.id,
                  "failed to remove channel: {err}"
               );
               errors.push(ErrorRecord::channel(
                  &gone.id,
                  format!("failed to remove channel {}: {err}", gone.external_id),
               ));
            },
         }
      }

      current.sort_by(|a, b| a.external_id.cmp(&b.external_id));
      tracing::info!(tenant_id = %tenant.id, created, updated, removed, "reconciled channels");
      Ok(current)
   }

   /// Calls the adapter outside of channel work, retrying transient errors.
   async fn call_adapter<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
   where
      F: FnMut() -> Fut,
      Fut: Future<Output = std::result::Result<T, AdapterError>>,
   {
      let mut attempts = 0u32;
      loop {
         attempts += 1;
         let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
         };
         let classified = self.classifier.classify(&err);
         match classified.class {
            ErrorClass::RateLimit => return Err(Error::RateLimited(err)),
            ErrorClass::Fatal if is_auth_failure(&err) => {
               return Err(FatalError::AuthFailed(err.to_string()).into());
            },
            _ if self.classifier.should_retry(&classified, attempts) => {
               let backoff = self.classifier.policy().backoff(attempts - 1);
               tracing::warn!(op, attempt = attempts, "transient adapter error, retrying: {err}");
               time::sleep(backoff).await;
            },
            _ => return Err(Error::Adapter(err)),
         }
      }
   }

   /// Ends a running run on an error that escaped channel work. Rate limits
   /// abort it with a result; anything else fails it and is returned.
   fn stop(&self, mut run: SyncRun, err: Error) -> Result<SyncRunResult> {
      let reason = err.to_string();
      run.errors.push(ErrorRecord::run(&reason));
      run.abort_reason = Some(reason);

      if self.classifier.classify_error(&err).class == ErrorClass::RateLimit {
         tracing::warn!(run_id = %run.id, "sync run aborted: {err}");
         run.finish(RunStatus::Aborted);
         self.store.put_run(&run)?;
         let outcomes = self.outcomes(&run, None)?.0;
         return Ok(result_of(&run, outcomes));
      }

      tracing::warn!(run_id = %run.id, "sync run failed: {err}");
      run.finish(RunStatus::Failed);
      if let Err(e) = self.store.put_run(&run) {
         tracing::error!(run_id = %run.id, "failed to persist failed run: {e}");
      }
      Err(err)
   }

   /// Runs the jobs on the worker pool while feeding the queue and
   /// reporting progress. Returns what stopped the run early, if anything.
   async fn fan_out(
      &self,
      run_id: Uuid,
      jobs: Vec<ChannelJob>,
      progress: &mut dyn ProgressCallback,
   ) -> Result<Option<AbortCause>> {
      let cancel = CancellationToken::new();
      let abort: AbortSlot = Arc::default();
      let (queue, rx) = WorkQueue::bounded(
         self.cfg.effective_queue_capacity(),
         self.cfg.effective_enqueue_batch_size(),
      );

      let workers = self.cfg.effective_worker_concurrency().min(jobs.len()).max(1);
      let mut pool = JoinSet::new();
      for n in 0..workers {
         let executor = ChannelExecutor::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.store),
            &self.cfg,
            worker_id(run_id, n),
         );
         pool.spawn(worker_loop(executor, rx.clone(), cancel.clone(), Arc::clone(&abort)));
      }
      drop(rx);
      tracing::debug!(%run_id, workers, jobs = jobs.len(), "worker pool started");

      let stop = CancellationToken::new();
      let aggregator = ProgressAggregator::new(Arc::clone(&self.store), self.cfg.poll_interval());
      let drain = async {
         let mut joined = Ok(());
         while let Some(res) = pool.join_next().await {
            if let Err(e) = res
               && joined.is_ok()
            {
               joined = Err(Error::Join(e));
            }
         }
         stop.cancel();
         joined
      };

      let (queued, aggregated, joined) = tokio::join!(
         queue.enqueue_all(jobs, &cancel),
         aggregator.aggregate(run_id, &stop, progress),
         drain
      );
      tracing::debug!(%run_id, queued, "work queue drained");
      if let Err(err) = aggregated {
         tracing::warn!(%run_id, "progress aggregation failed: {err}");
      }
      joined?;

      Ok(abort.lock().take())
   }

   /// Terminal view of every task of `run`, plus the totals over them.
   fn outcomes(
      &self,
      run: &SyncRun,
      trigger: Option<&str>,
   ) -> Result<(Vec<ChannelOutcome>, AggregateProgress)> {
      let tasks = self.store.tasks(run.id)?;
      let channels = tasks
         .iter()
         .map(|task| ChannelOutcome {
            channel_id: task.channel_id.clone(),
            external_channel_id: task.external_channel_id.clone(),
            status: task.status,
            messages_processed: task.messages_processed,
            error: task.error_details.clone(),
            abort_trigger: trigger == Some(task.channel_id.as_str()),
         })
         .collect();
      Ok((channels, AggregateProgress::from_tasks(&tasks)))
   }

   /// Records the run's terminal state and returns every channel's outcome.
   fn finish(&self, run: &mut SyncRun, abort: Option<&AbortCause>) -> Result<Vec<ChannelOutcome>> {
      let (channels, totals) = self.outcomes(run, abort.map(AbortCause::channel_id))?;
      for channel in &channels {
         if channel.status == TaskStatus::Failed
            && !channel.abort_trigger
            && let Some(error) = &channel.error
         {
            run.errors.push(ErrorRecord::channel(&channel.channel_id, error));
         }
      }

      run.channels_processed = totals.completed as u64;
      run.messages_processed = totals.messages_processed;

      let status = match abort {
         None => RunStatus::Completed,
         Some(AbortCause::RateLimited { .. }) => RunStatus::Aborted,
         Some(AbortCause::AuthFailed { .. }) => RunStatus::Failed,
      };
      if let Some(cause) = abort {
         let reason = cause.reason();
         run.errors.push(ErrorRecord {
            at:         Utc::now(),
            channel_id: Some(cause.channel_id().to_string()),
            message:    reason.clone(),
         });
         run.abort_reason = Some(reason);
      }
      run.finish(status);
      self.store.put_run(run)?;

      tracing::info!(
         run_id = %run.id,
         status = %run.status,
         channels = run.channels_processed,
         messages = run.messages_processed,
         failed = totals.failed,
         "sync run finished"
      );
      Ok(channels)
   }
}

async fn worker_loop<A: PlatformAdapter + ?Sized>(
   executor: ChannelExecutor<A>,
   rx: flume::Receiver<ChannelJob>,
   cancel: CancellationToken,
   abort: AbortSlot,
) {
   loop {
      let job = tokio::select! {
         biased;
         () = cancel.cancelled() => break,
         job = rx.recv_async() => match job {
            Ok(job) => job,
            Err(_) => break,
         },
      };

      let outcome = match AssertUnwindSafe(executor.run(&job, &cancel)).catch_unwind().await {
         Ok(outcome) => outcome,
         Err(panic) => {
            let message = format!("worker panicked: {}", panic_message(&*panic));
            tracing::error!(
               worker_id = executor.worker_id(),
               channel_id = %job.channel_id,
               "{message}"
            );
            executor.record_failure(&job, message);
            continue;
         },
      };
      let cause = match outcome {
         ExecutionOutcome::RateLimited(error) => AbortCause::RateLimited {
            channel_id: job.channel_id,
            external_channel_id: job.external_channel_id,
            error,
         },
         ExecutionOutcome::AuthFailed(error) => AbortCause::AuthFailed {
            channel_id: job.channel_id,
            external_channel_id: job.external_channel_id,
            error,
         },
         _ => continue,
      };

      tracing::warn!(worker_id = executor.worker_id(), "aborting run: {}", cause.reason());
      {
         let mut slot = abort.lock();
         if slot.is_none() {
            *slot = Some(cause);
         }
      }
      cancel.cancel();
   }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
   if let Some(message) = panic.downcast_ref::<&str>() {
      message
   } else if let Some(message) = panic.downcast_ref::<String>() {
      message
   } else {
      "unknown panic"
   }
}

fn worker_id(run_id: Uuid, n: usize) -> String {
   let run = run_id.simple().to_string();
   format!("{}-{}-{}-w{n}", hostname(), std::process::id(), &run[..8])
}

/// Restricts `channels` to the requested local or external ids, in request
/// order.
fn select_channels(channels: Vec<Channel>, filter: Option<&[String]>) -> Result<Vec<Channel>> {
   let Some(filter) = filter.filter(|f| !f.is_empty()) else {
      return Ok(channels);
   };
   let mut selected: Vec<Channel> = Vec::with_capacity(filter.len());
   for wanted in filter {
      let Some(channel) = channels
         .iter()
         .find(|c| c.id == *wanted || c.external_id == *wanted)
      else {
         return Err(FatalError::ChannelNotFound(wanted.clone()).into());
      };
      if !selected.iter().any(|s| s.id == channel.id) {
         selected.push(channel.clone());
      }
   }
   Ok(selected)
}

fn result_of(run: &SyncRun, channels: Vec<ChannelOutcome>) -> SyncRunResult {
   SyncRunResult {
      run_id: run.id,
      tenant_id: run.tenant_id.clone(),
      sync_type: run.sync_type,
      status: run.status,
      channels_processed: run.channels_processed,
      messages_processed: run.messages_processed,
      channels,
      errors: run.errors.clone(),
      abort_reason: run.abort_reason.clone(),
   }
}

/// Mirrors aggregated counters onto the persisted run while forwarding
/// snapshots to the caller's callback.
struct LiveRun<'a> {
   run:   SyncRun,
   store: &'a Store,
   inner: &'a mut dyn ProgressCallback,
}

impl ProgressCallback for LiveRun<'_> {
   fn progress(&mut self, progress: AggregateProgress) {
      self.run.channels_processed = progress.completed as u64;
      self.run.messages_processed = progress.messages_processed;
      if let Err(err) = self.store.put_run(&self.run) {
         tracing::warn!(run_id = %self.run.id, "failed to persist run progress: {err}");
      }
      self.inner.progress(progress);
   }
}
