//! Adapter over a workspace export on disk.
//!
//! Layout:
//! ```text
//! <root>/<workspace_id>/channels.json        [ExternalChannel]
//! <root>/messages/<external_channel_id>.json [ExternalMessage]
//! ```

use std::{
   io,
   path::{Path, PathBuf},
};

use serde::de::DeserializeOwned;

use super::{
   DEFAULT_MAX_PAGE_SIZE, ExternalChannel, ExternalMessage, FetchMessagesOptions, MessagePage,
   PlatformAdapter, paginate,
};
use crate::{
   error::{AdapterError, AdapterErrorKind},
   util::{compare_external_ids, path_component},
};

pub struct ExportAdapter {
   root: PathBuf,
}

impl ExportAdapter {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into() }
   }

   fn channels_path(&self, workspace_id: &str) -> PathBuf {
      self
         .root
         .join(path_component(workspace_id))
         .join("channels.json")
   }

   fn messages_path(&self, external_channel_id: &str) -> PathBuf {
      self
         .root
         .join("messages")
         .join(format!("{}.json", path_component(external_channel_id)))
   }

   async fn load_messages(&self, external_channel_id: &str) -> Result<Vec<ExternalMessage>, AdapterError> {
      let mut messages: Vec<ExternalMessage> =
         read_export(&self.messages_path(external_channel_id))
            .await?
            .unwrap_or_default();
      messages.sort_by(|a, b| compare_external_ids(&a.external_id, &b.external_id));
      messages.dedup_by(|a, b| a.external_id == b.external_id);
      Ok(messages)
   }
}

#[async_trait::async_trait]
impl PlatformAdapter for ExportAdapter {
   async fn fetch_channels(&self, workspace_id: &str) -> Result<Vec<ExternalChannel>, AdapterError> {
      read_export(&self.channels_path(workspace_id))
         .await?
         .ok_or_else(|| AdapterError::status(404, format!("workspace {workspace_id} not exported")))
   }

   async fn fetch_messages(
      &self,
      external_channel_id: &str,
      options: &FetchMessagesOptions,
   ) -> Result<MessagePage, AdapterError> {
      let messages = self.load_messages(external_channel_id).await?;
      Ok(paginate(messages, options))
   }

   async fn verify_connection(&self, workspace_id: &str) -> Result<bool, AdapterError> {
      Ok(tokio::fs::try_exists(self.channels_path(workspace_id))
         .await
         .unwrap_or(false))
   }

   fn max_page_size(&self) -> usize {
      DEFAULT_MAX_PAGE_SIZE
   }
}

async fn read_export<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AdapterError> {
   let raw = match tokio::fs::read(path).await {
      Ok(raw) => raw,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
         return Err(AdapterError::new(
            AdapterErrorKind::Connection,
            format!("failed to read {}: {e}", path.display()),
         ));
      },
   };
   serde_json::from_slice(&raw).map(Some).map_err(|e| {
      AdapterError::new(AdapterErrorKind::Internal, format!("malformed {}: {e}", path.display()))
   })
}
