use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use triage_engine::db::TenantRepo;
use triage_engine::{Config, Daemon};

/// Triage - conversation session and routing engine for a multi-tenant
/// support desk
#[derive(Parser)]
#[command(name = "triage", version, about)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, env = "TRIAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Register a tenant number
    AddTenant {
        /// Display name
        name: String,
    },
    /// Show all tenants and their session status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,triage_engine=info",
        1 => "info,triage_engine=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(command) = cli.command {
        let daemon = Daemon::new(config)?;
        let tenants = TenantRepo::new(daemon.db());
        return match command {
            Command::AddTenant { name } => {
                let tenant = tenants.create(&name)?;
                println!("tenant {} registered as #{}", tenant.name, tenant.id);
                Ok(())
            }
            Command::Status => {
                for tenant in tenants.list()? {
                    println!(
                        "#{:<4} {:<24} {:<14} paired: {}",
                        tenant.id,
                        tenant.name,
                        tenant.status,
                        if tenant.credentials.is_some() { "yes" } else { "no" },
                    );
                }
                Ok(())
            }
        };
    }

    tracing::info!(data_dir = %config.data_dir.display(), "starting triage engine");
    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}
