//! Progress aggregation over the channel tasks of a run.
//!
//! The aggregator only reads task state; executors own every write.

use std::{sync::Arc, time::Duration};

use indicatif::ProgressBar;
use serde::Serialize;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
   Result,
   store::Store,
   types::{ChannelTask, TaskStatus},
};

/// Live totals for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateProgress {
   pub total:              usize,
   pub pending:            usize,
   pub claimed:            usize,
   pub in_progress:        usize,
   pub completed:          usize,
   pub failed:             usize,
   pub messages_processed: u64,
}

impl AggregateProgress {
   pub fn from_tasks(tasks: &[ChannelTask]) -> Self {
      let mut progress = Self { total: tasks.len(), ..Self::default() };
      for task in tasks {
         progress.messages_processed += task.messages_processed;
         match task.status {
            TaskStatus::Pending => progress.pending += 1,
            TaskStatus::Claimed => progress.claimed += 1,
            TaskStatus::InProgress => progress.in_progress += 1,
            TaskStatus::Completed => progress.completed += 1,
            TaskStatus::Failed => progress.failed += 1,
         }
      }
      progress
   }

   pub const fn finished(&self) -> usize {
      self.completed + self.failed
   }

   /// Every task reached a terminal status.
   pub const fn is_done(&self) -> bool {
      self.finished() == self.total
   }
}

/// Receiver of progress snapshots
pub trait ProgressCallback: Send {
   fn progress(&mut self, progress: AggregateProgress);
}

impl<F: FnMut(AggregateProgress) + Send> ProgressCallback for F {
   fn progress(&mut self, progress: AggregateProgress) {
      self(progress);
   }
}

impl ProgressCallback for () {
   fn progress(&mut self, _progress: AggregateProgress) {}
}

impl ProgressCallback for ProgressBar {
   fn progress(&mut self, progress: AggregateProgress) {
      self.update(|state| {
         state.set_len(progress.total as u64);
         state.set_pos(progress.finished() as u64);
      });
      self.set_message(format!(
         "{} messages, {} in flight, {} failed",
         progress.messages_processed,
         progress.claimed + progress.in_progress,
         progress.failed
      ));
   }
}

/// Polls a run's tasks on a fixed interval.
pub struct ProgressAggregator {
   store:    Arc<Store>,
   interval: Duration,
}

impl ProgressAggregator {
   pub fn new(store: Arc<Store>, interval: Duration) -> Self {
      Self { store, interval: interval.max(Duration::from_millis(10)) }
   }

   pub fn snapshot(&self, run_id: Uuid) -> Result<AggregateProgress> {
      Ok(AggregateProgress::from_tasks(&self.store.tasks(run_id)?))
   }

   /// Reports snapshots until every task is terminal or `stop` fires, then
   /// returns the last one.
   pub async fn aggregate(
      &self,
      run_id: Uuid,
      stop: &CancellationToken,
      callback: &mut dyn ProgressCallback,
   ) -> Result<AggregateProgress> {
      let mut last = None;
      let mut stopped = false;
      loop {
         let snapshot = self.snapshot(run_id)?;
         if last != Some(snapshot) {
            callback.progress(snapshot);
            last = Some(snapshot);
         }
         if stopped || snapshot.is_done() {
            return Ok(snapshot);
         }
         // One more snapshot after `stop` so the caller sees the final state.
         stopped = tokio::select! {
            () = stop.cancelled() => true,
            () = time::sleep(self.interval) => false,
         };
      }
   }
}
