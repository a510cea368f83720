//! Lists recorded sync runs, newest first.

use console::style;

use super::format_time;
use crate::{Result, config::Config, store::Store, types::RunStatus};

pub fn execute(cfg: &Config, tenant_id: Option<String>, limit: usize, json: bool) -> Result<()> {
   let store = Store::open(cfg)?;
   let mut runs = store.runs(tenant_id.as_deref())?;
   runs.truncate(limit);

   if json {
      println!("{}", serde_json::to_string_pretty(&runs)?);
      return Ok(());
   }
   if runs.is_empty() {
      println!("{}", style("No sync runs recorded").dim());
      return Ok(());
   }

   for run in runs {
      let status = match run.status {
         RunStatus::Completed => style(run.status.as_str()).green(),
         RunStatus::Running | RunStatus::Pending => style(run.status.as_str()).cyan(),
         RunStatus::Aborted => style(run.status.as_str()).yellow(),
         RunStatus::Failed => style(run.status.as_str()).red(),
      };
      println!(
         "{} {} {} {} {}",
         style(run.id).dim(),
         run.tenant_id,
         run.sync_type,
         status,
         style(format!(
            "started {} · {} channels · {} messages · {} errors",
            format_time(run.started_at),
            run.channels_processed,
            run.messages_processed,
            run.errors.len()
         ))
         .dim()
      );
      if let Some(reason) = &run.abort_reason {
         println!("    {reason}");
      }
   }
   Ok(())
}
