//! Registers a tenant and the platform workspace it mirrors.

use chrono::Utc;
use console::style;

use crate::{Result, config::Config, store::Store, types::Tenant};

pub fn execute(cfg: &Config, tenant_id: String, workspace_id: String, name: Option<String>) -> Result<()> {
   let store = Store::open(cfg)?;
   let created_at = store
      .tenant(&tenant_id)?
      .map_or_else(Utc::now, |existing| existing.created_at);

   let tenant = Tenant { id: tenant_id, workspace_id, name, created_at };
   store.put_tenant(&tenant)?;

   println!(
      "{} tenant {} {}",
      style("✓").green(),
      style(&tenant.id).bold(),
      style(format!("(workspace {})", tenant.workspace_id)).dim()
   );
   Ok(())
}
