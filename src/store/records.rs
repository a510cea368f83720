//! Idempotent record persistence keyed on `(channel_id, external_id)`.
//!
//! A record is written to a private temp file and then hard-linked onto its
//! key path. Linking fails if the key already exists, so the first writer
//! wins and replays or concurrent writers count as skipped.

use std::{
   fs::{self, File},
   io::{self, Write},
   path::PathBuf,
};

use serde::{Deserialize, Serialize};

use super::Store;
use crate::{
   Result,
   types::Record,
   util::{fsync_dir, key_digest, path_component, read_json, read_json_dir, temp_path},
};

/// Counts from one [`Store::upsert`] batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
   pub created: u64,
   pub skipped: u64,
}

impl Store {
   fn records_dir(&self, channel_id: &str) -> PathBuf {
      self.root.join("records").join(path_component(channel_id))
   }

   fn record_path(&self, channel_id: &str, external_id: &str) -> PathBuf {
      let digest = key_digest(external_id);
      self
         .records_dir(channel_id)
         .join(&digest[..2])
         .join(format!("{digest}.json"))
   }

   /// Inserts records that do not exist yet; existing keys are left untouched.
   pub fn upsert(&self, records: &[Record]) -> Result<UpsertOutcome> {
      let mut outcome = UpsertOutcome::default();
      let mut touched_dirs = Vec::new();

      for record in records {
         let path = self.record_path(&record.channel_id, &record.external_id);
         let Some(dir) = path.parent() else {
            continue;
         };
         if path.exists() {
            outcome.skipped += 1;
            continue;
         }
         fs::create_dir_all(dir)?;

         let tmp_path = temp_path(&path)?;
         {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serde_json::to_vec(record)?)?;
            file.sync_all()?;
         }
         let linked = fs::hard_link(&tmp_path, &path);
         let _ = fs::remove_file(&tmp_path);
         match linked {
            Ok(()) => {
               outcome.created += 1;
               if !touched_dirs.iter().any(|d| d == dir) {
                  touched_dirs.push(dir.to_path_buf());
               }
            },
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => outcome.skipped += 1,
            Err(e) => return Err(e.into()),
         }
      }

      for dir in touched_dirs {
         fsync_dir(&dir)?;
      }
      Ok(outcome)
   }

   pub fn record(&self, channel_id: &str, external_id: &str) -> Result<Option<Record>> {
      read_json(&self.record_path(channel_id, external_id))
   }

   /// All records of a channel in unspecified order.
   pub fn records(&self, channel_id: &str) -> Result<Vec<Record>> {
      let shards = match fs::read_dir(self.records_dir(channel_id)) {
         Ok(shards) => shards,
         Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
         Err(e) => return Err(e.into()),
      };
      let mut out = Vec::new();
      for shard in shards {
         let shard = shard?;
         if shard.file_type()?.is_dir() {
            out.extend(read_json_dir::<Record>(&shard.path())?);
         }
      }
      Ok(out)
   }

   pub fn record_count(&self, channel_id: &str) -> Result<u64> {
      Ok(self.records(channel_id)?.len() as u64)
   }

   /// Drops every record of a channel.
   pub(crate) fn remove_records(&self, channel_id: &str) -> Result<()> {
      match fs::remove_dir_all(self.records_dir(channel_id)) {
         Ok(()) => Ok(()),
         Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
         Err(e) => Err(e.into()),
      }
   }
}
