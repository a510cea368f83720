//! Utility functions for durable file writes and identifier handling

use std::{
   cmp::Ordering,
   fs::{self, File},
   io::{self, Write},
   path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Result, error::Error};

/// Flushes directory metadata so a preceding rename survives a crash.
pub fn fsync_dir(path: &Path) -> Result<()> {
   #[cfg(unix)]
   {
      File::open(path)?.sync_all()?;
   }
   #[cfg(not(unix))]
   {
      let _ = path;
   }
   Ok(())
}

/// Unique sibling path used for write-then-rename.
pub fn temp_path(path: &Path) -> Result<PathBuf> {
   let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| Error::Store { op: "write", reason: format!("invalid path {}", path.display()) })?;
   Ok(path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple())))
}

/// Serializes `value` next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
   }
   let tmp_path = temp_path(path)?;
   let data = serde_json::to_vec_pretty(value)?;
   {
      let mut file = File::create(&tmp_path)?;
      file.write_all(&data)?;
      file.sync_all()?;
   }
   if let Err(e) = fs::rename(&tmp_path, path) {
      let _ = fs::remove_file(&tmp_path);
      return Err(e.into());
   }
   if let Some(parent) = path.parent() {
      fsync_dir(parent)?;
   }
   Ok(())
}

/// Reads a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
   match fs::read(path) {
      Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
   }
}

/// Reads every `*.json` document directly inside `dir`.
pub fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
   let entries = match fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
   };

   let mut out = Vec::new();
   for entry in entries {
      let path = entry?.path();
      if path.extension().is_some_and(|ext| ext == "json")
         && let Some(value) = read_json(&path)?
      {
         out.push(value);
      }
   }
   Ok(out)
}

/// Hex SHA-256 of a key.
pub fn key_digest(key: &str) -> String {
   hex::encode(Sha256::digest(key.as_bytes()))
}

/// Maps an identifier to a file name component.
///
/// Plain identifiers (uuids, snowflakes, slugs) are used verbatim; anything
/// else is replaced by its digest.
pub fn path_component(id: &str) -> String {
   let plain = !id.is_empty()
      && id.len() <= 128
      && !id.starts_with('.')
      && id
         .bytes()
         .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
   if plain { id.to_string() } else { key_digest(id) }
}

/// Orders platform message ids.
///
/// Numeric ids (snowflakes) compare by value regardless of width; anything
/// else falls back to byte order.
pub fn compare_external_ids(a: &str, b: &str) -> Ordering {
   let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
   if numeric(a) && numeric(b) {
      let a = a.trim_start_matches('0');
      let b = b.trim_start_matches('0');
      a.len().cmp(&b.len()).then_with(|| a.cmp(b))
   } else {
      a.cmp(b)
   }
}

/// Returns whichever id sorts later.
pub fn newer_external_id<'a>(a: &'a str, b: &'a str) -> &'a str {
   if compare_external_ids(a, b) == Ordering::Less { b } else { a }
}

/// Returns whichever id sorts earlier.
pub fn older_external_id<'a>(a: &'a str, b: &'a str) -> &'a str {
   if compare_external_ids(a, b) == Ordering::Greater { b } else { a }
}

pub fn hostname() -> String {
   std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(target_os = "linux")]
pub fn pid_is_alive(pid: u32) -> bool {
   let Ok(pid) = libc::pid_t::try_from(pid) else {
      return false;
   };
   if pid <= 0 {
      return false;
   }
   // SAFETY: signal 0 performs only the existence and permission check.
   let rc = unsafe { libc::kill(pid, 0) };
   rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Assumed alive where liveness cannot be probed.
#[cfg(not(target_os = "linux"))]
pub fn pid_is_alive(_pid: u32) -> bool {
   true
}
