//! Sync command: runs one sync for a tenant against a workspace export.

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
   Result,
   adapter::ExportAdapter,
   config::Config,
   coordinator::SyncCoordinator,
   error::Error,
   store::Store,
   types::{RunJob, RunStatus, SyncRunResult, SyncType, TaskStatus},
};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
   pub full:     bool,
   pub channels: Vec<String>,
   pub since:    Option<DateTime<Utc>>,
   pub until:    Option<DateTime<Utc>>,
   pub json:     bool,
}

pub async fn execute(cfg: Config, tenant_id: String, export: PathBuf, options: SyncOptions) -> Result<()> {
   cfg.validate()?;
   let store = Arc::new(Store::open(&cfg)?);
   let adapter = Arc::new(ExportAdapter::new(export));
   let coordinator = SyncCoordinator::new(adapter, store, cfg);

   let sync_type = if options.full { SyncType::Full } else { SyncType::Incremental };
   let mut job = RunJob::new(tenant_id, sync_type);
   job.channel_ids = (!options.channels.is_empty()).then_some(options.channels);
   job.start_date = options.since;
   job.end_date = options.until;

   let result = if options.json {
      coordinator.run_sync(job, &mut ()).await?
   } else {
      let mut pb = ProgressBar::new(0);
      if let Ok(bar) = ProgressStyle::default_bar()
         .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} channels")
      {
         pb.set_style(bar.progress_chars("█▓░"));
      }
      pb.set_message("syncing...");
      let result = coordinator.run_sync(job, &mut pb).await;
      pb.finish_and_clear();
      result?
   };

   if options.json {
      println!("{}", serde_json::to_string_pretty(&result)?);
   } else {
      print_summary(&result);
   }

   match result.status {
      RunStatus::Aborted => Err(Error::RunAborted {
         run_id: result.run_id,
         reason: result.abort_reason.unwrap_or_default(),
      }),
      _ => Ok(()),
   }
}

fn print_summary(result: &SyncRunResult) {
   let status = match result.status {
      RunStatus::Completed => style(result.status.as_str()).green(),
      RunStatus::Aborted => style(result.status.as_str()).yellow(),
      _ => style(result.status.as_str()).red(),
   };
   println!(
      "{} {} sync of {}: {}",
      style("●").bold(),
      result.sync_type,
      style(&result.tenant_id).bold(),
      status
   );
   println!(
      "  {} channels, {} messages {}",
      result.channels_processed,
      result.messages_processed,
      style(format!("(run {})", result.run_id)).dim()
   );

   for channel in &result.channels {
      let marker = match channel.status {
         TaskStatus::Completed => style("✓").green(),
         TaskStatus::Failed if channel.abort_trigger => style("!").yellow(),
         TaskStatus::Failed => style("✗").red(),
         _ => style("·").dim(),
      };
      let detail = channel
         .error
         .as_deref()
         .map(|e| format!(" {}", style(e).dim()))
         .unwrap_or_default();
      println!(
         "  {marker} {} {} messages [{}]{detail}",
         channel.external_channel_id, channel.messages_processed, channel.status
      );
   }

   if let Some(reason) = &result.abort_reason {
      println!("{} {reason}", style("aborted:").yellow().bold());
   }
}
