//! Contract between the sync engine and a platform-specific client.
//!
//! Implementations own their connection/session state; they are constructed
//! explicitly at startup and handed to the coordinator, never reached through
//! process-wide globals.

mod export;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::export::ExportAdapter;
use crate::{error::AdapterError, util::compare_external_ids};

/// Largest page most chat platforms will serve per request.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

/// Channel as listed by the platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalChannel {
   pub external_id: String,
   pub name:        String,
   #[serde(default)]
   pub kind:        Option<String>,
}

/// Message as returned by the platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalMessage {
   pub external_id: String,
   pub created_at:  DateTime<Utc>,
   #[serde(default)]
   pub payload:     serde_json::Value,
}

/// Pagination and filtering for one `fetch_messages` call.
///
/// `before` walks history backwards (full sync), `after` walks forward from a
/// checkpoint (incremental sync). At most one of them is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMessagesOptions {
   pub before:           Option<String>,
   pub after:            Option<String>,
   pub after_timestamp:  Option<DateTime<Utc>>,
   pub before_timestamp: Option<DateTime<Utc>>,
   pub limit:            usize,
}

/// Cursor state the adapter reports with each page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCheckpoint {
   pub last_message_id:        String,
   pub last_message_timestamp: Option<DateTime<Utc>>,
   pub messages_processed:     u64,
   pub has_more_messages:      bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
   pub messages:   Vec<ExternalMessage>,
   pub has_more:   bool,
   pub checkpoint: Option<PageCheckpoint>,
}

#[async_trait::async_trait]
pub trait PlatformAdapter: Send + Sync {
   async fn fetch_channels(&self, workspace_id: &str) -> Result<Vec<ExternalChannel>, AdapterError>;

   async fn fetch_messages(
      &self,
      external_channel_id: &str,
      options: &FetchMessagesOptions,
   ) -> Result<MessagePage, AdapterError>;

   async fn verify_connection(&self, workspace_id: &str) -> Result<bool, AdapterError>;

   /// Hard per-request limit imposed by the platform.
   fn max_page_size(&self) -> usize {
      DEFAULT_MAX_PAGE_SIZE
   }
}

/// Applies cursor, time window and limit to `messages` sorted oldest first.
///
/// Shared by adapters that hold a channel's history locally.
pub fn paginate(messages: Vec<ExternalMessage>, options: &FetchMessagesOptions) -> MessagePage {
   let limit = options.limit.max(1);
   let in_window = |m: &ExternalMessage| {
      options.after_timestamp.is_none_or(|start| m.created_at >= start)
         && options.before_timestamp.is_none_or(|end| m.created_at < end)
   };

   let (page, has_more, cursor) = if let Some(after) = options.after.as_deref() {
      let candidates: Vec<ExternalMessage> = messages
         .into_iter()
         .filter(|m| compare_external_ids(&m.external_id, after).is_gt() && in_window(m))
         .collect();
      let has_more = candidates.len() > limit;
      let page: Vec<ExternalMessage> = candidates.into_iter().take(limit).collect();
      let cursor = page.last().cloned();
      (page, has_more, cursor)
   } else {
      let before = options.before.as_deref();
      let mut candidates: Vec<ExternalMessage> = messages
         .into_iter()
         .filter(|m| {
            before.is_none_or(|b| compare_external_ids(&m.external_id, b).is_lt()) && in_window(m)
         })
         .collect();
      let has_more = candidates.len() > limit;
      let page = candidates.split_off(candidates.len().saturating_sub(limit));
      let cursor = page.first().cloned();
      (page, has_more, cursor)
   };

   let checkpoint = cursor.map(|m| PageCheckpoint {
      last_message_id:        m.external_id,
      last_message_timestamp: Some(m.created_at),
      messages_processed:     page.len() as u64,
      has_more_messages:      has_more,
   });

   MessagePage { messages: page, has_more, checkpoint }
}
