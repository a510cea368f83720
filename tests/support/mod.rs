#![allow(dead_code)]

use std::{
   collections::{HashMap, HashSet, VecDeque},
   ops::RangeInclusive,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use chansync::{
   adapter::{
      ExternalChannel, ExternalMessage, FetchMessagesOptions, MessagePage, PlatformAdapter,
      paginate,
   },
   config::Config,
   error::AdapterError,
   store::Store,
   types::{Channel, ChannelJob, ChannelTask, SyncType, Tenant},
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

pub const TENANT: &str = "acme";
pub const WORKSPACE: &str = "ws-acme";

/// One scripted response for a channel
pub enum Step {
   Page(MessagePage),
   Fail(AdapterError),
}

/// In-memory adapter with per-channel history and scripted failures.
///
/// Scripted steps are consumed first; once a channel's script is empty its
/// history is paginated like a real platform would.
#[derive(Default)]
pub struct ScriptedAdapter {
   channels:       Mutex<HashMap<String, Vec<ExternalChannel>>>,
   history:        Mutex<HashMap<String, Vec<ExternalMessage>>>,
   steps:          Mutex<HashMap<String, VecDeque<Step>>>,
   channel_errors: Mutex<VecDeque<AdapterError>>,
   verify_errors:  Mutex<VecDeque<AdapterError>>,
   calls:          Mutex<Vec<(String, FetchMessagesOptions)>>,
   unreachable:    AtomicBool,
   delay:          Mutex<Option<Duration>>,
   panics:         Mutex<HashSet<String>>,
}

impl ScriptedAdapter {
   pub fn new() -> Self {
      Self::default()
   }

   /// Adapter serving `WORKSPACE` with channels named after their ids.
   pub fn with_channels(external_ids: &[&str]) -> Self {
      let adapter = Self::new();
      adapter.set_channels(external_ids);
      adapter
   }

   pub fn set_channels(&self, external_ids: &[&str]) {
      let channels = external_ids
         .iter()
         .map(|id| ExternalChannel {
            external_id: (*id).to_string(),
            name:        format!("channel-{id}"),
            kind:        Some("text".to_string()),
         })
         .collect();
      self.channels.lock().insert(WORKSPACE.to_string(), channels);
   }

   pub fn rename_channel(&self, external_id: &str, name: &str) {
      if let Some(channels) = self.channels.lock().get_mut(WORKSPACE) {
         for channel in channels.iter_mut().filter(|c| c.external_id == external_id) {
            channel.name = name.to_string();
         }
      }
   }

   pub fn set_history(&self, external_channel_id: &str, messages: Vec<ExternalMessage>) {
      self
         .history
         .lock()
         .insert(external_channel_id.to_string(), messages);
   }

   pub fn extend_history(&self, external_channel_id: &str, messages: Vec<ExternalMessage>) {
      self
         .history
         .lock()
         .entry(external_channel_id.to_string())
         .or_default()
         .extend(messages);
   }

   pub fn push_page(&self, external_channel_id: &str, page: MessagePage) {
      self.push(external_channel_id, Step::Page(page));
   }

   pub fn fail_next(&self, external_channel_id: &str, err: AdapterError) {
      self.push(external_channel_id, Step::Fail(err));
   }

   fn push(&self, external_channel_id: &str, step: Step) {
      self
         .steps
         .lock()
         .entry(external_channel_id.to_string())
         .or_default()
         .push_back(step);
   }

   pub fn fail_fetch_channels(&self, err: AdapterError) {
      self.channel_errors.lock().push_back(err);
   }

   pub fn fail_verify(&self, err: AdapterError) {
      self.verify_errors.lock().push_back(err);
   }

   pub fn set_unreachable(&self, unreachable: bool) {
      self.unreachable.store(unreachable, Ordering::SeqCst);
   }

   pub fn set_delay(&self, delay: Duration) {
      *self.delay.lock() = Some(delay);
   }

   /// Makes every message fetch for the channel panic.
   pub fn panic_on(&self, external_channel_id: &str) {
      self.panics.lock().insert(external_channel_id.to_string());
   }

   pub fn calls_for(&self, external_channel_id: &str) -> Vec<FetchMessagesOptions> {
      self
         .calls
         .lock()
         .iter()
         .filter(|(id, _)| id == external_channel_id)
         .map(|(_, opts)| opts.clone())
         .collect()
   }

   pub fn fetched_channels(&self) -> Vec<String> {
      let mut ids: Vec<String> = self.calls.lock().iter().map(|(id, _)| id.clone()).collect();
      ids.dedup();
      ids
   }
}

#[async_trait::async_trait]
impl PlatformAdapter for ScriptedAdapter {
   async fn fetch_channels(&self, workspace_id: &str) -> Result<Vec<ExternalChannel>, AdapterError> {
      if let Some(err) = self.channel_errors.lock().pop_front() {
         return Err(err);
      }
      self
         .channels
         .lock()
         .get(workspace_id)
         .cloned()
         .ok_or_else(|| AdapterError::status(404, "unknown workspace"))
   }

   async fn fetch_messages(
      &self,
      external_channel_id: &str,
      options: &FetchMessagesOptions,
   ) -> Result<MessagePage, AdapterError> {
      self
         .calls
         .lock()
         .push((external_channel_id.to_string(), options.clone()));
      let delay = *self.delay.lock();
      if let Some(delay) = delay {
         tokio::time::sleep(delay).await;
      }

      let panics = self.panics.lock().contains(external_channel_id);
      if panics {
         panic!("scripted adapter panic on channel {external_channel_id}");
      }

      let step = self
         .steps
         .lock()
         .get_mut(external_channel_id)
         .and_then(VecDeque::pop_front);
      match step {
         Some(Step::Page(page)) => Ok(page),
         Some(Step::Fail(err)) => Err(err),
         None => {
            let mut messages = self
               .history
               .lock()
               .get(external_channel_id)
               .cloned()
               .unwrap_or_default();
            messages.sort_by(|a, b| {
               chansync::util::compare_external_ids(&a.external_id, &b.external_id)
            });
            Ok(paginate(messages, options))
         },
      }
   }

   async fn verify_connection(&self, _workspace_id: &str) -> Result<bool, AdapterError> {
      if let Some(err) = self.verify_errors.lock().pop_front() {
         return Err(err);
      }
      Ok(!self.unreachable.load(Ordering::SeqCst))
   }
}

pub fn base_time() -> DateTime<Utc> {
   Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn message(id: u64) -> ExternalMessage {
   ExternalMessage {
      external_id: id.to_string(),
      created_at:  base_time() + chrono::Duration::minutes(id as i64),
      payload:     serde_json::json!({ "content": format!("message {id}") }),
   }
}

pub fn messages(ids: RangeInclusive<u64>) -> Vec<ExternalMessage> {
   ids.map(message).collect()
}

/// Page holding exactly `ids`, without an adapter checkpoint.
pub fn page(ids: RangeInclusive<u64>, has_more: bool) -> MessagePage {
   MessagePage { messages: messages(ids), has_more, checkpoint: None }
}

/// Fast-retrying config rooted in `dir`.
pub fn test_config(dir: &TempDir) -> Config {
   Config {
      data_dir: Some(dir.path().join("data")),
      worker_concurrency: 4,
      page_size: 100,
      poll_interval_ms: 10,
      progress_interval: 50,
      base_backoff_ms: 1,
      max_backoff_ms: 5,
      ..Config::default()
   }
}

pub fn open_store(cfg: &Config) -> Arc<Store> {
   Arc::new(Store::open(cfg).expect("open store"))
}

pub fn add_tenant(store: &Store) -> Tenant {
   let tenant = Tenant {
      id:           TENANT.to_string(),
      workspace_id: WORKSPACE.to_string(),
      name:         Some("Acme".to_string()),
      created_at:   Utc::now(),
   };
   store.put_tenant(&tenant).expect("put tenant");
   tenant
}

/// Stores a channel plus a pending task for it and returns the matching job.
pub fn channel_job(store: &Store, external_id: &str, sync_type: SyncType) -> ChannelJob {
   let channel = Channel {
      id:          format!("local-{external_id}"),
      tenant_id:   TENANT.to_string(),
      external_id: external_id.to_string(),
      name:        format!("channel-{external_id}"),
      kind:        None,
      updated_at:  Utc::now(),
   };
   store.put_channel(&channel).expect("put channel");
   let task = ChannelTask::pending(Uuid::new_v4(), &channel);
   store.put_task(&task).expect("put task");
   ChannelJob::for_task(&task, sync_type, Default::default())
}
