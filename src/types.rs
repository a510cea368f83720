use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a run replays history or only fetches what is new since the
/// channel's checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
   Full,
   Incremental,
}

impl SyncType {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Full => "full",
         Self::Incremental => "incremental",
      }
   }
}

impl fmt::Display for SyncType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
   Pending,
   Running,
   Completed,
   /// Stopped early by a rate-limit signal.
   Aborted,
   Failed,
}

impl RunStatus {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Completed | Self::Aborted | Self::Failed)
   }

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Pending => "pending",
         Self::Running => "running",
         Self::Completed => "completed",
         Self::Aborted => "aborted",
         Self::Failed => "failed",
      }
   }
}

impl fmt::Display for RunStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// `pending → claimed → in_progress → {completed | failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
   Pending,
   Claimed,
   InProgress,
   Completed,
   Failed,
}

impl TaskStatus {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Completed | Self::Failed)
   }

   pub const fn is_owned(self) -> bool {
      matches!(self, Self::Claimed | Self::InProgress)
   }

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Pending => "pending",
         Self::Claimed => "claimed",
         Self::InProgress => "in_progress",
         Self::Completed => "completed",
         Self::Failed => "failed",
      }
   }
}

impl fmt::Display for TaskStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
   Idle,
   Claimed,
   Completed,
   Failed,
}

/// A tenant and the platform workspace it mirrors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
   pub id:           String,
   pub workspace_id: String,
   pub name:         Option<String>,
   pub created_at:   DateTime<Utc>,
}

/// Locally known channel of a tenant's workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
   pub id:          String,
   pub tenant_id:   String,
   pub external_id: String,
   pub name:        String,
   pub kind:        Option<String>,
   pub updated_at:  DateTime<Utc>,
}

/// Synced item, unique on `(channel_id, external_id)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
   pub external_id: String,
   pub channel_id:  String,
   pub payload:     serde_json::Value,
   pub created_at:  DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
   pub start: Option<DateTime<Utc>>,
   pub end:   Option<DateTime<Utc>>,
}

/// Run-level or channel-level error kept on the run, in occurrence order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
   pub at:         DateTime<Utc>,
   pub channel_id: Option<String>,
   pub message:    String,
}

impl ErrorRecord {
   pub fn run(message: impl Into<String>) -> Self {
      Self { at: Utc::now(), channel_id: None, message: message.into() }
   }

   pub fn channel(channel_id: impl Into<String>, message: impl Into<String>) -> Self {
      Self { at: Utc::now(), channel_id: Some(channel_id.into()), message: message.into() }
   }
}

/// One tenant-level sync request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
   pub id:                 Uuid,
   pub tenant_id:          String,
   pub sync_type:          SyncType,
   pub status:             RunStatus,
   pub started_at:         Option<DateTime<Utc>>,
   pub completed_at:       Option<DateTime<Utc>>,
   pub channels_processed: u64,
   pub messages_processed: u64,
   #[serde(default)]
   pub errors:             Vec<ErrorRecord>,
   #[serde(default)]
   pub abort_reason:       Option<String>,
}

impl SyncRun {
   pub fn new(tenant_id: impl Into<String>, sync_type: SyncType) -> Self {
      Self {
         id: Uuid::new_v4(),
         tenant_id: tenant_id.into(),
         sync_type,
         status: RunStatus::Pending,
         started_at: None,
         completed_at: None,
         channels_processed: 0,
         messages_processed: 0,
         errors: Vec::new(),
         abort_reason: None,
      }
   }

   pub fn finish(&mut self, status: RunStatus) {
      self.status = status;
      self.completed_at = Some(Utc::now());
   }
}

/// One channel's unit of work within a run.
///
/// `owner_worker_id` is set exactly while the status is `claimed` or
/// `in_progress`; the transition methods keep that invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTask {
   pub id:                  Uuid,
   pub parent_run_id:       Uuid,
   pub channel_id:          String,
   pub external_channel_id: String,
   pub status:              TaskStatus,
   pub owner_worker_id:     Option<String>,
   pub started_at:          Option<DateTime<Utc>>,
   pub completed_at:        Option<DateTime<Utc>>,
   pub messages_processed:  u64,
   pub retry_count:         u32,
   pub error_details:       Option<String>,
}

impl ChannelTask {
   pub fn pending(parent_run_id: Uuid, channel: &Channel) -> Self {
      Self {
         id: Uuid::new_v4(),
         parent_run_id,
         channel_id: channel.id.clone(),
         external_channel_id: channel.external_id.clone(),
         status: TaskStatus::Pending,
         owner_worker_id: None,
         started_at: None,
         completed_at: None,
         messages_processed: 0,
         retry_count: 0,
         error_details: None,
      }
   }

   pub fn claimed_by(&mut self, worker_id: &str) {
      self.status = TaskStatus::Claimed;
      self.owner_worker_id = Some(worker_id.to_string());
   }

   pub fn start(&mut self) {
      debug_assert!(self.owner_worker_id.is_some());
      self.status = TaskStatus::InProgress;
      self.started_at = Some(Utc::now());
   }

   pub fn complete(&mut self, messages_processed: u64) {
      self.status = TaskStatus::Completed;
      self.messages_processed = messages_processed;
      self.owner_worker_id = None;
      self.completed_at = Some(Utc::now());
   }

   pub fn fail(&mut self, error: impl Into<String>) {
      self.status = TaskStatus::Failed;
      self.error_details = Some(error.into());
      self.owner_worker_id = None;
      self.completed_at = Some(Utc::now());
   }
}

/// Durable per-channel cursor and claim (lease) state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelCheckpoint {
   pub channel_id:                      String,
   pub last_synced_external_message_id: Option<String>,
   pub last_synced_at:                  Option<DateTime<Utc>>,
   pub status:                          CheckpointStatus,
   pub claim_owner_id:                  Option<String>,
   pub claimed_at:                      Option<DateTime<Utc>>,
   #[serde(default)]
   pub last_error:                      Option<String>,
   /// Oldest id reached by a newest-first walk that has not yet hit the
   /// start of the channel's history. A later incremental run resumes
   /// `before` it.
   #[serde(default)]
   pub history_before:                  Option<String>,
   /// Newest id ever persisted for the channel, whatever the walk direction.
   #[serde(default)]
   pub newest_external_message_id:      Option<String>,
   pub updated_at:                      DateTime<Utc>,
}

impl ChannelCheckpoint {
   pub fn new(channel_id: impl Into<String>, now: DateTime<Utc>) -> Self {
      Self {
         channel_id: channel_id.into(),
         last_synced_external_message_id: None,
         last_synced_at: None,
         status: CheckpointStatus::Idle,
         claim_owner_id: None,
         claimed_at: None,
         last_error: None,
         history_before: None,
         newest_external_message_id: None,
         updated_at: now,
      }
   }
}

/// Run-level job as submitted by a scheduler or the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
   pub tenant_id:   String,
   pub sync_type:   SyncType,
   #[serde(default)]
   pub channel_ids: Option<Vec<String>>,
   #[serde(default)]
   pub start_date:  Option<DateTime<Utc>>,
   #[serde(default)]
   pub end_date:    Option<DateTime<Utc>>,
}

impl RunJob {
   pub fn new(tenant_id: impl Into<String>, sync_type: SyncType) -> Self {
      Self {
         tenant_id: tenant_id.into(),
         sync_type,
         channel_ids: None,
         start_date: None,
         end_date: None,
      }
   }

   pub const fn date_range(&self) -> DateRange {
      DateRange { start: self.start_date, end: self.end_date }
   }
}

/// Channel-level job derived from a [`RunJob`], one per [`ChannelTask`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelJob {
   pub task_id:             Uuid,
   pub parent_run_id:       Uuid,
   pub channel_id:          String,
   pub external_channel_id: String,
   pub sync_type:           SyncType,
   #[serde(default)]
   pub start_date:          Option<DateTime<Utc>>,
   #[serde(default)]
   pub end_date:            Option<DateTime<Utc>>,
}

impl ChannelJob {
   pub fn for_task(task: &ChannelTask, sync_type: SyncType, range: DateRange) -> Self {
      Self {
         task_id: task.id,
         parent_run_id: task.parent_run_id,
         channel_id: task.channel_id.clone(),
         external_channel_id: task.external_channel_id.clone(),
         sync_type,
         start_date: range.start,
         end_date: range.end,
      }
   }

   pub const fn date_range(&self) -> DateRange {
      DateRange { start: self.start_date, end: self.end_date }
   }
}

/// Terminal view of one channel in a finished run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelOutcome {
   pub channel_id:          String,
   pub external_channel_id: String,
   pub status:              TaskStatus,
   pub messages_processed:  u64,
   pub error:               Option<String>,
   /// This channel surfaced the condition that stopped the run.
   #[serde(default)]
   pub abort_trigger:       bool,
}

/// Final report produced by the coordinator for every run, including early
/// stops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunResult {
   pub run_id:             Uuid,
   pub tenant_id:          String,
   pub sync_type:          SyncType,
   pub status:             RunStatus,
   pub channels_processed: u64,
   pub messages_processed: u64,
   pub channels:           Vec<ChannelOutcome>,
   pub errors:             Vec<ErrorRecord>,
   pub abort_reason:       Option<String>,
}

impl SyncRunResult {
   pub fn channel(&self, channel_id: &str) -> Option<&ChannelOutcome> {
      self.channels.iter().find(|c| c.channel_id == channel_id)
   }
}
