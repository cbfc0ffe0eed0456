//! Outbox worker - polls the outbox and dispatches events to handlers.

mod app;
mod handlers;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use outbox_config::{init_logging, EventsConfig};

/// Outbox worker command-line interface.
///
/// Everything is configured through environment variables; flags override
/// the matching variable.
#[derive(Parser, Debug)]
#[command(name = "outbox-worker")]
#[command(about = "Dispatch transactional outbox events to handlers")]
#[command(version)]
struct Cli {
    /// Use the SQLite store (overrides EVENTS_WORKER_USE_DATABASE)
    #[arg(long)]
    database: bool,

    /// SQLite database file (overrides OUTBOX_DATABASE_PATH, implies --database)
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Log level (overrides OUTBOX_LOG_LEVEL)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seconds between status log lines
    #[arg(long, env = "OUTBOX_STATUS_INTERVAL_SECS", default_value_t = 30)]
    status_interval_secs: u64,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

impl Cli {
    fn apply(&self, config: &mut EventsConfig) {
        if self.database || self.database_path.is_some() {
            config.use_database = true;
        }
        if let Some(path) = &self.database_path {
            config.database_path = path.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = EventsConfig::from_env()?;
    cli.apply(&mut config);

    init_logging("outbox-worker", &config.log_level, config.log_format);

    let mode = if cli.once {
        app::RunMode::Once
    } else {
        app::RunMode::Continuous {
            status_interval: Duration::from_secs(cli.status_interval_secs.max(1)),
        }
    };
    app::run(config, mode).await
}
