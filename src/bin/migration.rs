use clap::{Parser, Subcommand};
use pix_commerce_api::migrator::{migration_status, reset_migrations, run_migration};
use tracing::info;

/// Schema management for the PIX commerce database
#[derive(Debug, Parser)]
#[command(name = "migration", version, about)]
struct Cli {
    /// Database URL; falls back to APP__DATABASE_URL, then DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations (default)
    Up,
    /// Roll back every applied migration
    Reset,
    /// List applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pix_commerce_api::config::init_tracing("info", false);

    let cli = Cli::parse();
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("APP__DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "sqlite://pix_commerce.db?mode=rwc".to_string());

    match cli.command.unwrap_or(Command::Up) {
        Command::Up => run_migration(&database_url).await?,
        Command::Reset => reset_migrations(&database_url).await?,
        Command::Status => {
            let report = migration_status(&database_url).await?;
            info!(
                applied = report.applied.len(),
                pending = report.pending.len(),
                "Migration status"
            );
        }
    }

    info!("Migration command finished");
    Ok(())
}
