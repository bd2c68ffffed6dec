use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trellis_config::{AppConfig, ConfigLoader};
use trellis_db::{Datasources, MigrationRunner, Version, VersionState, migrations};
use trellis_gateway::bootstrap;

#[derive(Parser)]
#[command(
    name = "trellis",
    version,
    about = "Trellis - demo service with versioned migrations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the config value.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the datastores and start the HTTP server
    Start {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Inspect or apply migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply pending migrations
    Run,
    /// Show the state of every registered migration
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Mark a failed migration as handled so it is skipped from now on
    Resolve { version: Version },
    /// Release a migration lock left behind by a crashed process
    Unlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = ConfigLoader::new();
    let config = config_loader
        .load()
        .with_context(|| format!("loading config from {}", config_loader.config_dir().display()))?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)))
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let server = trellis_gateway::GatewayServer::new(config);
            server.run().await?;
        }
        Commands::Migrate { action } => migrate(&config, action)?,
    }

    Ok(())
}

fn migrate(config: &AppConfig, action: MigrateCommands) -> Result<()> {
    let datasources = Datasources::open(&config.datasources)?;
    let registry = migrations::all()?;
    let runner = MigrationRunner::new(&registry)
        .with_lock_options(bootstrap::lock_options(&config.migrations));

    match action {
        MigrateCommands::Run => {
            let report = runner.run(&datasources)?;
            if report.applied.is_empty() {
                println!("Nothing to apply ({} already applied).", report.skipped);
            } else {
                println!(
                    "Applied {} migration(s) in {}ms:",
                    report.applied.len(),
                    report.elapsed_ms
                );
                for version in &report.applied {
                    println!("  {version}");
                }
            }
        }
        MigrateCommands::Status { json } => {
            let status = runner.status(&datasources)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            for entry in status {
                let state = match &entry.state {
                    VersionState::Pending => "pending".to_string(),
                    VersionState::Applied { at } => format!("applied {at}"),
                    VersionState::Failed { at, error } => format!(
                        "FAILED {at}: {}",
                        error.as_deref().unwrap_or("unknown error")
                    ),
                };
                println!("  {} {:<28} {}", entry.version, entry.name, state);
            }
        }
        MigrateCommands::Resolve { version } => {
            if runner.resolve(&datasources, version)? {
                println!("Migration {version} marked as resolved.");
            } else {
                println!("Migration {version} has no failed record; nothing to resolve.");
            }
        }
        MigrateCommands::Unlock => match MigrationRunner::unlock(&datasources)? {
            Some(holder) => println!(
                "Released migration lock held by {} since {} (lease until {}).",
                holder.owner, holder.acquired_at, holder.expires_at
            ),
            None => println!("Migration lock is not held."),
        },
    }

    Ok(())
}
