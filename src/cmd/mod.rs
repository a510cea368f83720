//! CLI command implementations for chansync.
//!
//! Each module corresponds to one subcommand.

pub mod checkpoints;
pub mod runs;
pub mod sync;
pub mod tenant_add;

use chrono::{DateTime, NaiveDate, Utc};

/// Parses an RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_date(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
   if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
      return Ok(ts.with_timezone(&Utc));
   }
   NaiveDate::parse_from_str(raw, "%Y-%m-%d")
      .ok()
      .and_then(|d| d.and_hms_opt(0, 0, 0))
      .map(|dt| dt.and_utc())
      .ok_or_else(|| format!("invalid date '{raw}': expected RFC 3339 or YYYY-MM-DD"))
}

fn format_time(ts: Option<DateTime<Utc>>) -> String {
   ts.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}
