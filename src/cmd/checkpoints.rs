//! Shows per-channel checkpoints and claims for a tenant.

use chrono::Utc;
use console::style;
use serde::Serialize;

use super::format_time;
use crate::{
   Result,
   config::Config,
   store::Store,
   types::{ChannelCheckpoint, CheckpointStatus},
};

#[derive(Serialize)]
struct ChannelRow {
   channel_id:  String,
   external_id: String,
   name:        String,
   records:     u64,
   checkpoint:  Option<ChannelCheckpoint>,
   live_claim:  bool,
}

pub fn execute(cfg: &Config, tenant_id: String, json: bool) -> Result<()> {
   let store = Store::open(cfg)?;
   let now = Utc::now();

   let mut rows = Vec::new();
   for channel in store.channels(&tenant_id)? {
      let checkpoint = store.checkpoint(&channel.id)?;
      let live_claim = checkpoint
         .as_ref()
         .is_some_and(|cp| store.has_live_claim(cp, now));
      rows.push(ChannelRow {
         records: store.record_count(&channel.id)?,
         channel_id: channel.id,
         external_id: channel.external_id,
         name: channel.name,
         checkpoint,
         live_claim,
      });
   }

   if json {
      println!("{}", serde_json::to_string_pretty(&rows)?);
      return Ok(());
   }
   if rows.is_empty() {
      println!("{}", style(format!("No channels known for tenant {tenant_id}")).dim());
      return Ok(());
   }

   for row in rows {
      let (status, cursor, synced_at, owner, error) = match &row.checkpoint {
         Some(cp) => (
            cp.status,
            cp.last_synced_external_message_id.as_deref().unwrap_or("-"),
            format_time(cp.last_synced_at),
            cp.claim_owner_id.as_deref(),
            cp.last_error.as_deref(),
         ),
         None => (CheckpointStatus::Idle, "-", "-".to_string(), None, None),
      };
      let status = match status {
         CheckpointStatus::Completed => style("completed").green(),
         CheckpointStatus::Claimed => style("claimed").cyan(),
         CheckpointStatus::Failed => style("failed").red(),
         CheckpointStatus::Idle => style("idle").dim(),
      };
      println!(
         "{} {} {status} cursor={cursor} synced={synced_at} records={}",
         style(&row.external_id).bold(),
         row.name,
         row.records
      );
      if let Some(owner) = owner {
         let state = if row.live_claim { "live" } else { "stale" };
         println!("    claimed by {owner} ({state})");
      }
      if let Some(error) = error {
         println!("    {}", style(error).red());
      }
   }
   Ok(())
}
