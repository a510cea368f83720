use std::path::PathBuf;

use chansync::{
   Result,
   cmd::{self, parse_date, sync::SyncOptions},
   config::Config,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the chansync application
#[derive(Parser)]
#[command(name = "chansync")]
#[command(about = "Mirror chat workspace history into local storage")]
#[command(version)]
struct Cli {
   #[arg(long, global = true, env = "CHANSYNC_CONFIG", help = "Config file (default: ~/.chansync/config.toml)")]
   config: Option<PathBuf>,

   #[arg(short, long, global = true, help = "Log progress at info level")]
   verbose: bool,

   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for chansync
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Register a tenant and the workspace it mirrors")]
   TenantAdd {
      #[arg(help = "Tenant id")]
      tenant: String,

      #[arg(short, long, help = "Platform workspace id")]
      workspace: String,

      #[arg(short, long, help = "Display name")]
      name: Option<String>,
   },

   #[command(about = "Sync a tenant's channels from a workspace export")]
   Sync {
      #[arg(help = "Tenant id")]
      tenant: String,

      #[arg(short, long, env = "CHANSYNC_EXPORT", help = "Workspace export directory")]
      export: PathBuf,

      #[arg(long, help = "Replay full history instead of resuming from checkpoints")]
      full: bool,

      #[arg(short, long = "channel", help = "Only sync this channel (local or external id, repeatable)")]
      channels: Vec<String>,

      #[arg(long, value_parser = parse_date, help = "Only messages at or after this date")]
      since: Option<DateTime<Utc>>,

      #[arg(long, value_parser = parse_date, help = "Only messages before this date")]
      until: Option<DateTime<Utc>>,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "List recorded sync runs")]
   Runs {
      #[arg(short, long, help = "Only runs of this tenant")]
      tenant: Option<String>,

      #[arg(short = 'm', long, default_value = "20", help = "Maximum runs to show")]
      max: usize,

      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Show channel checkpoints and claims of a tenant")]
   Checkpoints {
      #[arg(help = "Tenant id")]
      tenant: String,

      #[arg(long, help = "JSON output")]
      json: bool,
   },
}

#[tokio::main]
async fn main() {
   let cli = Cli::parse();
   let level = if cli.verbose { Level::INFO } else { Level::WARN };
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
      .with_writer(std::io::stderr)
      .init();

   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   let cfg = match &cli.config {
      Some(path) => Config::load_from(Some(path)),
      None => Config::load(),
   };

   match cli.command {
      Cmd::TenantAdd { tenant, workspace, name } => {
         cmd::tenant_add::execute(&cfg, tenant, workspace, name)
      },
      Cmd::Sync { tenant, export, full, channels, since, until, json } => {
         cmd::sync::execute(cfg, tenant, export, SyncOptions { full, channels, since, until, json }).await
      },
      Cmd::Runs { tenant, max, json } => cmd::runs::execute(&cfg, tenant, max, json),
      Cmd::Checkpoints { tenant, json } => cmd::checkpoints::execute(&cfg, tenant, json),
   }
}
