//! Channel sync executor: the per-channel unit of work.
//!
//! One execution claims the channel, walks the adapter's pages strictly in
//! cursor order, persists each page through the upsert layer, advances the
//! checkpoint and finally marks the channel completed or failed. Rate-limit
//! and auth signals are handed back to the coordinator instead of being
//! recorded as channel failures.

use std::sync::Arc;

use chrono::Utc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   adapter::{ExternalMessage, FetchMessagesOptions, MessagePage, PlatformAdapter},
   classify::{Classifier, ErrorClass, RetryPolicy, is_auth_failure},
   config::Config,
   error::AdapterError,
   store::Store,
   types::{ChannelCheckpoint, ChannelJob, ChannelTask, Record, SyncType},
   util::{compare_external_ids, newer_external_id, older_external_id},
};

pub const CLAIM_CONTENDED: &str = "channel already being processed";
pub const RUN_ABORTED: &str = "run aborted";

/// How one channel execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
   Completed { messages_processed: u64 },
   /// Confined to this channel; siblings are unaffected.
   Failed { error: String },
   /// The platform rate limited us; the run must stop.
   RateLimited(AdapterError),
   /// Credentials were rejected; the run must stop.
   AuthFailed(AdapterError),
   /// The run was cancelled while this channel was in flight.
   Aborted,
}

impl ExecutionOutcome {
   /// True for conditions that end the whole run.
   pub const fn aborts_run(&self) -> bool {
      matches!(self, Self::RateLimited(_) | Self::AuthFailed(_))
   }
}

enum Fetched {
   Page(MessagePage),
   Stop(ExecutionOutcome),
}

pub struct ChannelExecutor<A: PlatformAdapter + ?Sized> {
   adapter:           Arc<A>,
   store:             Arc<Store>,
   classifier:        Classifier,
   page_size:         usize,
   progress_interval: u64,
   worker_id:         String,
}

impl<A: PlatformAdapter + ?Sized> ChannelExecutor<A> {
   pub fn new(adapter: Arc<A>, store: Arc<Store>, cfg: &Config, worker_id: impl Into<String>) -> Self {
      let page_size = cfg.effective_page_size(adapter.max_page_size());
      Self {
         adapter,
         store,
         classifier: Classifier::new(RetryPolicy::from_config(cfg)),
         page_size,
         progress_interval: cfg.progress_interval(),
         worker_id: worker_id.into(),
      }
   }

   pub fn worker_id(&self) -> &str {
      &self.worker_id
   }

   /// Executes `job`, turning storage errors into a failed channel.
   ///
   /// Never returns an error: whatever happens is recorded on the task.
   pub async fn run(&self, job: &ChannelJob, cancel: &CancellationToken) -> ExecutionOutcome {
      match self.execute(job, cancel).await {
         Ok(outcome) => outcome,
         Err(err) => {
            tracing::warn!(
               channel_id = %job.channel_id,
               worker_id = %self.worker_id,
               "channel sync failed: {err}"
            );
            self.record_failure(job, err.to_string())
         },
      }
   }

   /// Fails `job`'s task with `message` after an execution that could not
   /// finish its own bookkeeping, and drops this worker's claim.
   pub fn record_failure(&self, job: &ChannelJob, message: String) -> ExecutionOutcome {
      if let Err(e) = self.store.release(&job.channel_id, &self.worker_id) {
         tracing::warn!(channel_id = %job.channel_id, "failed to release claim: {e}");
      }
      match self.store.task(job.parent_run_id, job.task_id) {
         Ok(mut task) if !task.status.is_terminal() => {
            task.fail(&message);
            if let Err(e) = self.store.put_task(&task) {
               tracing::warn!(task_id = %task.id, "failed to record task failure: {e}");
            }
         },
         Ok(_) => {},
         Err(e) => tracing::warn!(task_id = %job.task_id, "failed to load task: {e}"),
      }
      ExecutionOutcome::Failed { error: message }
   }

   /// Executes `job` to completion or failure.
   pub async fn execute(&self, job: &ChannelJob, cancel: &CancellationToken) -> Result<ExecutionOutcome> {
      let mut task = self.store.task(job.parent_run_id, job.task_id)?;
      let channel_id = job.channel_id.as_str();

      if !self.store.claim(channel_id, &self.worker_id)? {
         tracing::info!(channel_id, worker_id = %self.worker_id, "{CLAIM_CONTENDED}");
         task.fail(CLAIM_CONTENDED);
         self.store.put_task(&task)?;
         return Ok(ExecutionOutcome::Failed { error: CLAIM_CONTENDED.to_string() });
      }
      task.claimed_by(&self.worker_id);
      self.store.put_task(&task)?;
      task.start();
      self.store.put_task(&task)?;

      let checkpoint = match job.sync_type {
         SyncType::Full => None,
         SyncType::Incremental => self.store.checkpoint(channel_id)?,
      };
      let legs = plan_legs(job.sync_type, checkpoint.as_ref());
      let start_cursor = legs
         .iter()
         .find(|leg| leg.walk == Walk::Forward)
         .and_then(|leg| leg.from.clone());
      tracing::debug!(
         channel_id,
         sync_type = %job.sync_type,
         cursor = start_cursor.as_deref().unwrap_or("-"),
         legs = legs.len(),
         "starting channel sync"
      );

      let mut state = WalkState::default();
      let last_leg = legs.len().saturating_sub(1);
      for (n, leg) in legs.into_iter().enumerate() {
         let walk = leg.walk;
         if let Some(outcome) = self.walk(job, &mut task, leg, &mut state, cancel).await? {
            return Ok(outcome);
         }
         if walk == Walk::Backward && n < last_leg {
            self.store.complete_history(channel_id, &self.worker_id)?;
         }
      }

      // Full syncs keep the oldest id seen; incremental ones the newest.
      let cursor = match job.sync_type {
         SyncType::Full => state.oldest,
         SyncType::Incremental => match (start_cursor, state.newest) {
            (Some(start), Some(newest)) => Some(newer_external_id(&start, &newest).to_string()),
            (start, newest) => newest.or(start),
         },
      };
      self
         .store
         .mark_completed(channel_id, &self.worker_id, cursor.as_deref(), Utc::now())?;
      task.complete(state.processed);
      self.store.put_task(&task)?;
      tracing::info!(channel_id, messages = state.processed, "channel sync completed");
      Ok(ExecutionOutcome::Completed { messages_processed: state.processed })
   }

   /// Pages through one leg until the adapter runs out. Returns the outcome
   /// that stopped the channel early, if any.
   async fn walk(
      &self,
      job: &ChannelJob,
      task: &mut ChannelTask,
      leg: Leg,
      state: &mut WalkState,
      cancel: &CancellationToken,
   ) -> Result<Option<ExecutionOutcome>> {
      let channel_id = job.channel_id.as_str();
      let range = job.date_range();
      let mut page_cursor = leg.from.clone();
      let mut mark = leg.from;

      loop {
         if cancel.is_cancelled() {
            return self.abandon(task, state.processed).map(Some);
         }

         let options = FetchMessagesOptions {
            before:           page_cursor.clone().filter(|_| leg.walk == Walk::Backward),
            after:            page_cursor.clone().filter(|_| leg.walk == Walk::Forward),
            after_timestamp:  range.start,
            before_timestamp: range.end,
            limit:            self.page_size,
         };

         let page = match self.fetch_page(job, &options, task, state.processed, cancel).await? {
            Fetched::Page(page) => page,
            Fetched::Stop(outcome) => return Ok(Some(outcome)),
         };
         if page.messages.is_empty() {
            return Ok(None);
         }

         let count = page.messages.len() as u64;
         let next = page_cursor_of(&page, leg.walk);
         let newest = page
            .messages
            .iter()
            .map(|m| m.external_id.as_str())
            .max_by(|a, b| compare_external_ids(a, b))
            .map(str::to_string);
         let records: Vec<Record> = page
            .messages
            .into_iter()
            .map(|m| to_record(channel_id, m))
            .collect();
         let upserted = self.store.upsert(&records)?;
         state.processed += count;
         state.since_progress += count;
         if let Some(newest) = newest {
            state.newest = Some(merge(state.newest.take(), &newest, newer_external_id));
         }
         tracing::debug!(
            channel_id,
            created = upserted.created,
            skipped = upserted.skipped,
            "persisted page"
         );

         let Some(next) = next else {
            return Ok(None);
         };
         let merged = match leg.walk {
            Walk::Backward => merge(mark.take(), &next, older_external_id),
            Walk::Forward => merge(mark.take(), &next, newer_external_id),
         };
         match leg.walk {
            Walk::Backward => {
               state.oldest = Some(merge(state.oldest.take(), &merged, older_external_id));
               let cursor = (job.sync_type == SyncType::Full).then_some(merged.as_str());
               self.store.advance_history(
                  channel_id,
                  &self.worker_id,
                  &merged,
                  state.newest.as_deref(),
                  cursor,
                  Utc::now(),
               )?;
            },
            Walk::Forward => {
               self
                  .store
                  .advance(channel_id, &self.worker_id, &merged, Utc::now())?;
            },
         }
         mark = Some(merged);

         if state.since_progress >= self.progress_interval {
            task.messages_processed = state.processed;
            self.store.put_task(task)?;
            state.since_progress = 0;
         }

         if !page.has_more {
            return Ok(None);
         }
         if page_cursor.as_deref() == Some(next.as_str()) {
            tracing::warn!(channel_id, cursor = %next, "adapter returned the same cursor twice");
            return Ok(None);
         }
         page_cursor = Some(next);
      }
   }

   async fn fetch_page(
      &self,
      job: &ChannelJob,
      options: &FetchMessagesOptions,
      task: &mut ChannelTask,
      processed: u64,
      cancel: &CancellationToken,
   ) -> Result<Fetched> {
      let channel_id = job.channel_id.as_str();
      let mut attempts = 0u32;
      loop {
         attempts += 1;
         let err = match self
            .adapter
            .fetch_messages(&job.external_channel_id, options)
            .await
         {
            Ok(page) => return Ok(Fetched::Page(page)),
            Err(err) => err,
         };

         let classified = self.classifier.classify(&err);
         match classified.class {
            ErrorClass::RateLimit => {
               tracing::warn!(channel_id, "rate limited by platform: {err}");
               self.store.release(channel_id, &self.worker_id)?;
               task.messages_processed = processed;
               task.fail(format!("rate limited: {err}"));
               self.store.put_task(task)?;
               return Ok(Fetched::Stop(ExecutionOutcome::RateLimited(err)));
            },
            ErrorClass::Fatal if is_auth_failure(&err) => {
               tracing::warn!(channel_id, "platform rejected credentials: {err}");
               self.fail(task, processed, &err.to_string())?;
               return Ok(Fetched::Stop(ExecutionOutcome::AuthFailed(err)));
            },
            _ if self.classifier.should_retry(&classified, attempts) => {
               let backoff = self.classifier.policy().backoff(attempts - 1);
               task.retry_count += 1;
               self.store.put_task(task)?;
               tracing::warn!(
                  channel_id,
                  attempt = attempts,
                  backoff_ms = backoff.as_millis() as u64,
                  "transient adapter error, retrying: {err}"
               );
               tokio::select! {
                  () = cancel.cancelled() => {
                     return self.abandon(task, processed).map(Fetched::Stop);
                  }
                  () = time::sleep(backoff) => {}
               }
            },
            _ => {
               let message = err.to_string();
               tracing::warn!(channel_id, attempts, "channel sync failed: {message}");
               self.fail(task, processed, &message)?;
               return Ok(Fetched::Stop(ExecutionOutcome::Failed { error: message }));
            },
         }
      }
   }

   fn fail(&self, task: &mut ChannelTask, processed: u64, message: &str) -> Result<()> {
      self
         .store
         .mark_failed(&task.channel_id, &self.worker_id, message)?;
      task.messages_processed = processed;
      task.fail(message);
      self.store.put_task(task)
   }

   /// Leaves the channel for a later run: the claim is released with the
   /// cursor at the last advanced page.
   fn abandon(&self, task: &mut ChannelTask, processed: u64) -> Result<ExecutionOutcome> {
      self.store.release(&task.channel_id, &self.worker_id)?;
      task.messages_processed = processed;
      task.fail(RUN_ABORTED);
      self.store.put_task(task)?;
      tracing::info!(channel_id = %task.channel_id, "channel sync abandoned");
      Ok(ExecutionOutcome::Aborted)
   }
}

/// Direction a channel's history is paged in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
   /// Newest first, `before` the cursor.
   Backward,
   /// Oldest first, `after` the cursor.
   Forward,
}

/// One pass over a channel, starting at `from`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Leg {
   walk: Walk,
   from: Option<String>,
}

#[derive(Debug, Default)]
struct WalkState {
   processed:      u64,
   since_progress: u64,
   oldest:         Option<String>,
   newest:         Option<String>,
}

/// Legs a sync takes for the channel's current checkpoint.
///
/// A full sync walks all history newest-first. An incremental sync first
/// finishes any interrupted history walk, then follows new messages from the
/// newest id it knows. Without any cursor it walks history newest-first.
fn plan_legs(sync_type: SyncType, checkpoint: Option<&ChannelCheckpoint>) -> Vec<Leg> {
   let backward = |from: Option<String>| Leg { walk: Walk::Backward, from };
   if sync_type == SyncType::Full {
      return vec![backward(None)];
   }

   let Some(checkpoint) = checkpoint else {
      return vec![backward(None)];
   };
   let forward_from = match (
      checkpoint.last_synced_external_message_id.as_deref(),
      checkpoint.newest_external_message_id.as_deref(),
   ) {
      (Some(cursor), Some(newest)) => Some(newer_external_id(cursor, newest).to_string()),
      (cursor, newest) => cursor.or(newest).map(str::to_string),
   };

   let mut legs = Vec::with_capacity(2);
   if let Some(before) = &checkpoint.history_before {
      legs.push(backward(Some(before.clone())));
   }
   match forward_from {
      Some(from) => legs.push(Leg { walk: Walk::Forward, from: Some(from) }),
      None if legs.is_empty() => legs.push(backward(None)),
      None => {},
   }
   legs
}

fn merge(current: Option<String>, id: &str, pick: for<'a> fn(&'a str, &'a str) -> &'a str) -> String {
   match current {
      Some(current) => pick(current.as_str(), id).to_string(),
      None => id.to_string(),
   }
}

/// Cursor for the next request: the oldest id of a historical page, the
/// newest of a forward page.
fn page_cursor_of(page: &MessagePage, walk: Walk) -> Option<String> {
   if let Some(cp) = &page.checkpoint {
      return Some(cp.last_message_id.clone());
   }
   let ids = page.messages.iter().map(|m| m.external_id.as_str());
   match walk {
      Walk::Backward => ids.min_by(|a, b| compare_external_ids(a, b)),
      Walk::Forward => ids.max_by(|a, b| compare_external_ids(a, b)),
   }
   .map(str::to_string)
}

fn to_record(channel_id: &str, message: ExternalMessage) -> Record {
   Record {
      external_id: message.external_id,
      channel_id:  channel_id.to_string(),
      payload:     message.payload,
      created_at:  message.created_at,
   }
}
