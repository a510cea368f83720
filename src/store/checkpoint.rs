//! Channel checkpoints: durable cursor plus a lease-style claim.
//!
//! Every read-compare-write of a checkpoint runs under an exclusive OS lock
//! on the channel's lock file, which makes `claim` a compare-and-swap across
//! threads and processes. A claim older than the lease timeout is abandoned
//! and may be taken over by any worker; `advance` refreshes it.

use std::{fs, io, path::PathBuf};

use chrono::{DateTime, TimeDelta, Utc};

use super::{FileLock, Store};
use crate::{
   Result,
   error::Error,
   types::{ChannelCheckpoint, CheckpointStatus},
   util::{newer_external_id, path_component, read_json, write_json_atomic},
};

impl Store {
   fn checkpoint_path(&self, channel_id: &str) -> PathBuf {
      self
         .root
         .join("checkpoints")
         .join(format!("{}.json", path_component(channel_id)))
   }

   fn checkpoint_lock_path(&self, channel_id: &str) -> PathBuf {
      self
         .root
         .join("checkpoints")
         .join(format!("{}.lock", path_component(channel_id)))
   }

   fn lease(&self) -> TimeDelta {
      TimeDelta::from_std(self.lease_timeout).unwrap_or(TimeDelta::MAX)
   }

   /// Runs `f` on the current checkpoint while holding the channel lock and
   /// persists the checkpoint it hands back, if any.
   fn update_checkpoint<T>(
      &self,
      channel_id: &str,
      f: impl FnOnce(Option<ChannelCheckpoint>) -> Result<(Option<ChannelCheckpoint>, T)>,
   ) -> Result<T> {
      let _lock = FileLock::acquire(self.checkpoint_lock_path(channel_id))?;
      let path = self.checkpoint_path(channel_id);
      let current = read_json(&path)?;
      let (next, out) = f(current)?;
      if let Some(next) = next {
         write_json_atomic(&path, &next)?;
      }
      Ok(out)
   }

   pub fn checkpoint(&self, channel_id: &str) -> Result<Option<ChannelCheckpoint>> {
      read_json(&self.checkpoint_path(channel_id))
   }

   /// True if the checkpoint carries a claim younger than the lease timeout.
   pub fn has_live_claim(&self, checkpoint: &ChannelCheckpoint, now: DateTime<Utc>) -> bool {
      checkpoint.claim_owner_id.is_some() && !self.claim_is_stale(checkpoint, now)
   }

   fn claim_is_stale(&self, checkpoint: &ChannelCheckpoint, now: DateTime<Utc>) -> bool {
      checkpoint
         .claimed_at
         .is_none_or(|at| now.signed_duration_since(at) > self.lease())
   }

   /// Claims `channel_id` for `worker_id`.
   ///
   /// Returns `false` when another worker holds a live claim. Re-claiming by
   /// the current owner refreshes the lease.
   pub fn claim(&self, channel_id: &str, worker_id: &str) -> Result<bool> {
      self.claim_at(channel_id, worker_id, Utc::now())
   }

   pub fn claim_at(&self, channel_id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
      self.update_checkpoint(channel_id, |current| {
         let mut checkpoint = current.unwrap_or_else(|| ChannelCheckpoint::new(channel_id, now));
         if let Some(owner) = checkpoint.claim_owner_id.as_deref()
            && owner != worker_id
         {
            if !self.claim_is_stale(&checkpoint, now) {
               return Ok((None, false));
            }
            tracing::warn!(
               channel_id,
               previous_owner = owner,
               worker_id,
               "taking over stale channel claim"
            );
         }

         checkpoint.claim_owner_id = Some(worker_id.to_string());
         checkpoint.claimed_at = Some(now);
         checkpoint.status = CheckpointStatus::Claimed;
         checkpoint.updated_at = now;
         Ok((Some(checkpoint), true))
      })
   }

   /// Clears the claim if `worker_id` still owns it; otherwise does nothing.
   pub fn release(&self, channel_id: &str, worker_id: &str) -> Result<bool> {
      self.update_checkpoint(channel_id, |current| {
         let Some(mut checkpoint) = current else {
            tracing::warn!(channel_id, worker_id, "release of unknown channel ignored");
            return Ok((None, false));
         };
         if checkpoint.claim_owner_id.as_deref() != Some(worker_id) {
            tracing::warn!(
               channel_id,
               worker_id,
               owner = checkpoint.claim_owner_id.as_deref().unwrap_or("-"),
               "release by non-owner ignored"
            );
            return Ok((None, false));
         }

         clear_claim(&mut checkpoint);
         if checkpoint.status == CheckpointStatus::Claimed {
            checkpoint.status = CheckpointStatus::Idle;
         }
         Ok((Some(checkpoint), true))
      })
   }

   /// Moves the cursor forward mid-run without releasing the claim.
   pub fn advance(
      &self,
      channel_id: &str,
      worker_id: &str,
      last_external_id: &str,
      at: DateTime<Utc>,
   ) -> Result<()> {
      self.update_checkpoint(channel_id, |current| {
         let mut checkpoint = owned(current, channel_id, worker_id)?;
         checkpoint.last_synced_external_message_id = Some(last_external_id.to_string());
         note_newest(&mut checkpoint, Some(last_external_id));
         checkpoint.last_synced_at = Some(at);
         refresh_claim(&mut checkpoint);
         Ok((Some(checkpoint), ()))
      })
   }

   /// Records a page of a newest-first walk that has not reached the start of
   /// history yet. `cursor`, when given, also becomes the sync cursor.
   pub fn advance_history(
      &self,
      channel_id: &str,
      worker_id: &str,
      before: &str,
      newest: Option<&str>,
      cursor: Option<&str>,
      at: DateTime<Utc>,
   ) -> Result<()> {
      self.update_checkpoint(channel_id, |current| {
         let mut checkpoint = owned(current, channel_id, worker_id)?;
         checkpoint.history_before = Some(before.to_string());
         note_newest(&mut checkpoint, newest);
         if let Some(cursor) = cursor {
            checkpoint.last_synced_external_message_id = Some(cursor.to_string());
         }
         checkpoint.last_synced_at = Some(at);
         refresh_claim(&mut checkpoint);
         Ok((Some(checkpoint), ()))
      })
   }

   /// Marks the channel's history as fully walked while keeping the claim.
   pub fn complete_history(&self, channel_id: &str, worker_id: &str) -> Result<()> {
      self.update_checkpoint(channel_id, |current| {
         let mut checkpoint = owned(current, channel_id, worker_id)?;
         checkpoint.history_before = None;
         refresh_claim(&mut checkpoint);
         Ok((Some(checkpoint), ()))
      })
   }

   /// Records a finished sync and drops the claim. Without a new cursor the
   /// previous one is kept.
   pub fn mark_completed(
      &self,
      channel_id: &str,
      worker_id: &str,
      last_external_id: Option<&str>,
      at: DateTime<Utc>,
   ) -> Result<()> {
      self.update_checkpoint(channel_id, |current| {
         let mut checkpoint = owned(current, channel_id, worker_id)?;
         if let Some(id) = last_external_id {
            checkpoint.last_synced_external_message_id = Some(id.to_string());
         }
         note_newest(&mut checkpoint, last_external_id);
         checkpoint.history_before = None;
         checkpoint.last_synced_at = Some(at);
         checkpoint.status = CheckpointStatus::Completed;
         checkpoint.last_error = None;
         clear_claim(&mut checkpoint);
         Ok((Some(checkpoint), ()))
      })
   }

   pub fn mark_failed(&self, channel_id: &str, worker_id: &str, error: &str) -> Result<()> {
      self.update_checkpoint(channel_id, |current| {
         let mut checkpoint = owned(current, channel_id, worker_id)?;
         checkpoint.status = CheckpointStatus::Failed;
         checkpoint.last_error = Some(error.to_string());
         clear_claim(&mut checkpoint);
         Ok((Some(checkpoint), ()))
      })
   }

   /// Deletes the checkpoint after `remove_owner` has removed whatever it
   /// belongs to, all under the channel lock. Refuses while a worker holds a
   /// live claim.
   pub(crate) fn remove_checkpoint_with(
      &self,
      channel_id: &str,
      remove_owner: impl FnOnce() -> Result<()>,
   ) -> Result<()> {
      self.update_checkpoint(channel_id, |current| {
         if let Some(checkpoint) = &current
            && self.has_live_claim(checkpoint, Utc::now())
         {
            return Err(Error::Store {
               op:     "remove_checkpoint",
               reason: format!(
                  "channel {channel_id} is claimed by {}",
                  checkpoint.claim_owner_id.as_deref().unwrap_or("-")
               ),
            });
         }
         remove_owner()?;
         if current.is_some() {
            match fs::remove_file(self.checkpoint_path(channel_id)) {
               Ok(()) => {},
               Err(e) if e.kind() == io::ErrorKind::NotFound => {},
               Err(e) => return Err(e.into()),
            }
         }
         Ok((None, ()))
      })
   }
}

fn owned(
   current: Option<ChannelCheckpoint>,
   channel_id: &str,
   worker_id: &str,
) -> Result<ChannelCheckpoint> {
   match current {
      Some(checkpoint) if checkpoint.claim_owner_id.as_deref() == Some(worker_id) => Ok(checkpoint),
      _ => Err(Error::ClaimLost {
         channel_id: channel_id.to_string(),
         worker_id:  worker_id.to_string(),
      }),
   }
}

fn note_newest(checkpoint: &mut ChannelCheckpoint, id: Option<&str>) {
   let Some(id) = id else {
      return;
   };
   let newest = match checkpoint.newest_external_message_id.as_deref() {
      Some(current) => newer_external_id(current, id).to_string(),
      None => id.to_string(),
   };
   checkpoint.newest_external_message_id = Some(newest);
}

fn refresh_claim(checkpoint: &mut ChannelCheckpoint) {
   let now = Utc::now();
   checkpoint.claimed_at = Some(now);
   checkpoint.updated_at = now;
}

fn clear_claim(checkpoint: &mut ChannelCheckpoint) {
   checkpoint.claim_owner_id = None;
   checkpoint.claimed_at = None;
   checkpoint.updated_at = Utc::now();
}
