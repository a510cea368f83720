//! Channel executor behaviour against a scripted platform.

mod support;

use std::sync::Arc;

use chansync::{
   adapter::{MessagePage, PageCheckpoint},
   config::Config,
   error::AdapterError,
   executor::{CLAIM_CONTENDED, ChannelExecutor, ExecutionOutcome, RUN_ABORTED},
   store::Store,
   types::{CheckpointStatus, SyncType, TaskStatus},
   util::compare_external_ids,
};
use chrono::{Duration, Utc};
use proptest::{
   collection::vec,
   prelude::*,
   test_runner::{Config as ProptestConfig, RngAlgorithm, TestRng, TestRunner},
};
use support::{ScriptedAdapter, base_time, channel_job, message, messages, page};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
   _dir:    TempDir,
   cfg:     Config,
   store:   Arc<Store>,
   adapter: Arc<ScriptedAdapter>,
}

impl Harness {
   fn new() -> Self {
      let dir = TempDir::new().expect("temp dir");
      let cfg = support::test_config(&dir);
      let store = support::open_store(&cfg);
      support::add_tenant(&store);
      Self { _dir: dir, cfg, store, adapter: Arc::new(ScriptedAdapter::new()) }
   }

   fn executor(&self, worker_id: &str) -> ChannelExecutor<ScriptedAdapter> {
      ChannelExecutor::new(Arc::clone(&self.adapter), Arc::clone(&self.store), &self.cfg, worker_id)
   }

   /// Leaves `cursor` on the channel's checkpoint as a finished earlier run would.
   fn seed_cursor(&self, channel_id: &str, cursor: &str) {
      assert!(self.store.claim(channel_id, "seed").expect("claim"));
      self
         .store
         .mark_completed(channel_id, "seed", Some(cursor), Utc::now())
         .expect("complete");
   }

   fn cursor(&self, channel_id: &str) -> Option<String> {
      self
         .store
         .checkpoint(channel_id)
         .expect("read checkpoint")
         .and_then(|cp| cp.last_synced_external_message_id)
   }
}

#[tokio::test]
async fn full_sync_walks_history_backwards_page_by_page() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=240));
   let job = channel_job(&h.store, "100", SyncType::Full);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 240 });

   let befores: Vec<_> = h
      .adapter
      .calls_for("100")
      .into_iter()
      .map(|opts| opts.before)
      .collect();
   assert_eq!(befores, [None, Some("141".to_string()), Some("41".to_string())]);

   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_eq!(checkpoint.last_synced_external_message_id.as_deref(), Some("1"));
   assert_eq!(checkpoint.status, CheckpointStatus::Completed);
   assert!(checkpoint.claim_owner_id.is_none());

   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Completed);
   assert_eq!(task.messages_processed, 240);
   assert!(task.owner_worker_id.is_none());
   assert_eq!(h.store.record_count(&job.channel_id).expect("count"), 240);
}

#[tokio::test]
async fn incremental_sync_without_new_messages_keeps_the_cursor() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=50));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   h.seed_cursor(&job.channel_id, "50");

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 0 });

   let calls = h.adapter.calls_for("100");
   assert_eq!(calls.len(), 1);
   assert_eq!(calls[0].after.as_deref(), Some("50"));
   assert!(calls[0].before.is_none());

   assert_eq!(h.cursor(&job.channel_id).as_deref(), Some("50"));
   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Completed);
   assert_eq!(task.messages_processed, 0);
}

#[tokio::test]
async fn incremental_sync_resumes_after_the_checkpoint() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=60));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   h.seed_cursor(&job.channel_id, "50");

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 10 });
   assert_eq!(h.cursor(&job.channel_id).as_deref(), Some("60"));
   assert_eq!(h.store.record_count(&job.channel_id).expect("count"), 10);
   assert!(h.store.record(&job.channel_id, "50").expect("read").is_none());
   assert!(h.store.record(&job.channel_id, "51").expect("read").is_some());
}

#[tokio::test]
async fn first_incremental_sync_backfills_and_resumes_from_the_newest_id() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=240));
   let job = channel_job(&h.store, "100", SyncType::Incremental);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 240 });
   assert_eq!(h.cursor(&job.channel_id).as_deref(), Some("240"));
   assert!(h.adapter.calls_for("100").iter().all(|opts| opts.after.is_none()));

   h.adapter.extend_history("100", messages(241..=250));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 10 });
   assert_eq!(h.cursor(&job.channel_id).as_deref(), Some("250"));
   assert_eq!(h.store.record_count(&job.channel_id).expect("count"), 250);
}

#[tokio::test]
async fn claimed_channel_is_reported_as_contended() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=10));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   assert!(h.store.claim(&job.channel_id, "other-worker").expect("claim"));

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Failed { error: CLAIM_CONTENDED.to_string() });
   assert!(h.adapter.calls_for("100").is_empty());

   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Failed);
   assert_eq!(task.error_details.as_deref(), Some(CLAIM_CONTENDED));

   // The other worker's claim is untouched.
   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_eq!(checkpoint.claim_owner_id.as_deref(), Some("other-worker"));
}

#[tokio::test]
async fn transient_errors_are_retried_and_counted() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=30));
   h.adapter.fail_next("100", AdapterError::status(503, "unavailable"));
   h.adapter.fail_next("100", AdapterError::timeout("read timed out"));
   let job = channel_job(&h.store, "100", SyncType::Full);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 30 });
   assert_eq!(h.adapter.calls_for("100").len(), 3);

   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Completed);
   assert_eq!(task.retry_count, 2);
}

#[tokio::test]
async fn exhausted_retries_fail_only_this_channel() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=30));
   for _ in 0..h.cfg.max_attempts {
      h.adapter.fail_next("100", AdapterError::status(503, "unavailable"));
   }
   let job = channel_job(&h.store, "100", SyncType::Full);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   let ExecutionOutcome::Failed { error } = &outcome else {
      panic!("expected failure, got {outcome:?}");
   };
   assert!(error.contains("503"), "{error}");

   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_eq!(checkpoint.status, CheckpointStatus::Failed);
   assert!(checkpoint.last_error.as_deref().is_some_and(|e| e.contains("503")));
   assert!(checkpoint.claim_owner_id.is_none());

   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Failed);
   assert_eq!(task.retry_count, h.cfg.max_attempts - 1);
}

#[tokio::test]
async fn client_errors_fail_without_retrying() {
   let h = Harness::new();
   h.adapter.fail_next("100", AdapterError::status(404, "unknown channel"));
   let job = channel_job(&h.store, "100", SyncType::Incremental);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert!(matches!(outcome, ExecutionOutcome::Failed { .. }), "{outcome:?}");
   assert_eq!(h.adapter.calls_for("100").len(), 1);

   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_eq!(checkpoint.status, CheckpointStatus::Failed);
   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn rate_limit_releases_the_claim_and_keeps_progress() {
   let h = Harness::new();
   h.adapter.push_page("100", page(141..=240, true));
   h.adapter.fail_next("100", AdapterError::status(429, "too many requests"));
   let job = channel_job(&h.store, "100", SyncType::Full);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert!(matches!(outcome, ExecutionOutcome::RateLimited(_)), "{outcome:?}");
   assert!(outcome.aborts_run());

   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_ne!(checkpoint.status, CheckpointStatus::Failed);
   assert_eq!(checkpoint.last_synced_external_message_id.as_deref(), Some("141"));
   assert_eq!(checkpoint.history_before.as_deref(), Some("141"));
   assert_eq!(checkpoint.newest_external_message_id.as_deref(), Some("240"));
   assert!(checkpoint.claim_owner_id.is_none());

   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Failed);
   assert_eq!(task.messages_processed, 100);
   assert!(task.error_details.as_deref().is_some_and(|e| e.starts_with("rate limited")));
   assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn incremental_run_finishes_a_rate_limited_full_sync() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=240));
   h.adapter.push_page("100", page(141..=240, true));
   h.adapter.fail_next("100", AdapterError::status(429, "too many requests"));
   let job = channel_job(&h.store, "100", SyncType::Full);
   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert!(matches!(outcome, ExecutionOutcome::RateLimited(_)), "{outcome:?}");

   h.adapter.extend_history("100", messages(241..=245));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   let outcome = h.executor("w2").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 145 });

   let calls = h.adapter.calls_for("100");
   let resumed: Vec<_> = calls[calls.len() - 3..]
      .iter()
      .map(|opts| (opts.before.clone(), opts.after.clone()))
      .collect();
   assert_eq!(resumed, [
      (Some("141".to_string()), None),
      (Some("41".to_string()), None),
      (None, Some("240".to_string())),
   ]);

   assert_eq!(h.store.record_count(&job.channel_id).expect("count"), 245);
   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_eq!(checkpoint.status, CheckpointStatus::Completed);
   assert_eq!(checkpoint.last_synced_external_message_id.as_deref(), Some("245"));
   assert!(checkpoint.history_before.is_none());

   let job = channel_job(&h.store, "100", SyncType::Incremental);
   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 0 });
}

#[tokio::test]
async fn interrupted_backfill_resumes_below_the_oldest_page() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=150));
   h.adapter.push_page("100", page(51..=150, true));
   h.adapter.fail_next("100", AdapterError::status(429, "too many requests"));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert!(matches!(outcome, ExecutionOutcome::RateLimited(_)), "{outcome:?}");
   assert_eq!(h.cursor(&job.channel_id), None);

   let job = channel_job(&h.store, "100", SyncType::Incremental);
   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 50 });
   assert_eq!(h.cursor(&job.channel_id).as_deref(), Some("150"));
   assert_eq!(h.store.record_count(&job.channel_id).expect("count"), 150);
}

#[tokio::test]
async fn rejected_credentials_abort_and_fail_the_channel() {
   let h = Harness::new();
   h.adapter.fail_next("100", AdapterError::auth("token revoked"));
   let job = channel_job(&h.store, "100", SyncType::Incremental);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert!(matches!(outcome, ExecutionOutcome::AuthFailed(_)), "{outcome:?}");

   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert_eq!(checkpoint.status, CheckpointStatus::Failed);
   assert!(checkpoint.claim_owner_id.is_none());
}

#[tokio::test]
async fn cancelled_run_abandons_the_channel() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=10));
   let job = channel_job(&h.store, "100", SyncType::Incremental);
   let cancel = CancellationToken::new();
   cancel.cancel();

   let outcome = h.executor("w1").run(&job, &cancel).await;
   assert_eq!(outcome, ExecutionOutcome::Aborted);
   assert!(h.adapter.calls_for("100").is_empty());

   let task = h.store.task(job.parent_run_id, job.task_id).expect("task");
   assert_eq!(task.status, TaskStatus::Failed);
   assert_eq!(task.error_details.as_deref(), Some(RUN_ABORTED));
   let checkpoint = h.store.checkpoint(&job.channel_id).expect("read").expect("present");
   assert!(checkpoint.claim_owner_id.is_none());

   // Another worker can pick it up right away.
   assert!(h.store.claim(&job.channel_id, "w2").expect("claim"));
}

#[tokio::test]
async fn adapter_checkpoint_drives_the_next_request() {
   let h = Harness::new();
   let mut first = page(901..=1000, true);
   first.checkpoint = Some(PageCheckpoint {
      last_message_id:        "900".to_string(),
      last_message_timestamp: None,
      messages_processed:     100,
      has_more_messages:      true,
   });
   h.adapter.push_page("100", first);
   h.adapter.push_page("100", page(1..=10, false));
   let job = channel_job(&h.store, "100", SyncType::Full);

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 110 });

   let calls = h.adapter.calls_for("100");
   assert_eq!(calls.len(), 2);
   assert_eq!(calls[1].before.as_deref(), Some("900"));
   assert_eq!(h.cursor(&job.channel_id).as_deref(), Some("1"));
}

#[tokio::test]
async fn date_range_is_forwarded_to_the_adapter() {
   let h = Harness::new();
   h.adapter.set_history("100", messages(1..=240));
   let mut job = channel_job(&h.store, "100", SyncType::Full);
   job.start_date = Some(base_time() + Duration::minutes(100));
   job.end_date = Some(base_time() + Duration::minutes(110));

   let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
   assert_eq!(outcome, ExecutionOutcome::Completed { messages_processed: 10 });

   let calls = h.adapter.calls_for("100");
   assert_eq!(calls[0].after_timestamp, job.start_date);
   assert_eq!(calls[0].before_timestamp, job.end_date);
   assert!(h.store.record(&job.channel_id, "100").expect("read").is_some());
   assert!(h.store.record(&job.channel_id, "110").expect("read").is_none());
}

#[test]
fn incremental_cursor_never_moves_backwards() {
   let mut runner = TestRunner::new_with_rng(
      ProptestConfig { cases: 16, max_shrink_iters: 0, ..ProptestConfig::default() },
      TestRng::from_seed(RngAlgorithm::ChaCha, &[42u8; 32]),
   );
   // Each inner vec is the page one run receives; ids may be older than the
   // cursor, as platforms occasionally redeliver.
   let strategy = vec(vec(1u64..5_000, 1..8), 1..6);

   runner
      .run(&strategy, |runs| {
         let rt = tokio::runtime::Runtime::new().expect("runtime");
         rt.block_on(async {
            let h = Harness::new();
            let mut newest: Option<u64> = None;

            for ids in &runs {
               h.adapter.push_page("100", MessagePage {
                  messages:   ids.iter().map(|id| message(*id)).collect(),
                  has_more:   false,
                  checkpoint: None,
               });

               let job = channel_job(&h.store, "100", SyncType::Incremental);
               let before = h.cursor(&job.channel_id);
               let outcome = h.executor("w1").run(&job, &CancellationToken::new()).await;
               prop_assert!(
                  matches!(outcome, ExecutionOutcome::Completed { .. }),
                  "{:?}",
                  outcome
               );

               let after = h.cursor(&job.channel_id).expect("cursor after sync");
               if let Some(before) = before {
                  prop_assert!(compare_external_ids(&after, &before).is_ge());
               }
               let page_max = ids.iter().copied().max();
               newest = newest.max(page_max);
               prop_assert_eq!(after, newest.map(|n| n.to_string()).unwrap_or_default());
            }
            Ok(())
         })
      })
      .expect("monotonic cursor");
}
