//! metrosense service entry point: schema bootstrap, one-shot syncs, and
//! the long-running ingestion schedule.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use metrosense_ingest::{build_pipelines, build_scheduler, load_registry, run_all_once};
use metrosense_store::PgStore;
use tracing_subscriber::EnvFilter;

const USER_AGENT: &str = concat!("metrosense/", env!("CARGO_PKG_VERSION"));

const DB_CONNECT_ATTEMPTS: u32 = 5;
const DB_CONNECT_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "metrosense")]
#[command(about = "Urban mobility sensor ingestion service")]
struct Cli {
    /// Path to the source registry file.
    #[arg(long, default_value = "sources.yaml")]
    sources: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the scheduler and keep ingesting until interrupted.
    Run,
    /// Run every enabled pipeline once, then exit.
    Sync,
    /// Create the database schema if needed, then exit.
    InitSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set in .env or the environment")?;
    let db_pool_max = env_u32("DB_POOL_MAX", 5)?;
    tracing::info!(database_url = %mask_db_url(&database_url), db_pool_max, "configuration loaded");

    let store = PgStore::connect(
        &database_url,
        db_pool_max,
        DB_CONNECT_ATTEMPTS,
        DB_CONNECT_BACKOFF,
    )
    .await?;
    store.ensure_schema().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::InitSchema => {
            tracing::info!("schema is up to date");
        }
        Commands::Sync => {
            let registry = load_registry(&cli.sources)?;
            let pipelines = build_pipelines(&registry, Arc::new(store), USER_AGENT)?;
            run_all_once(&pipelines).await;
        }
        Commands::Run => {
            let registry = load_registry(&cli.sources)?;
            let pipelines = build_pipelines(&registry, Arc::new(store), USER_AGENT)?;
            tracing::info!(pipelines = pipelines.len(), "starting ingestion schedule");

            let mut sched = build_scheduler(&pipelines).await?;
            sched.start().await.context("starting scheduler")?;

            // First pass immediately; the schedule covers everything after.
            run_all_once(&pipelines).await;

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            tracing::info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    Ok(std::env::var(name)
        .ok()
        .map(|value| value.parse::<u32>())
        .transpose()
        .with_context(|| format!("invalid {name}"))?
        .unwrap_or(default))
}

/// Mask the password part of a connection URL before logging it.
fn mask_db_url(url: &str) -> String {
    let Some(at) = url.rfind('@') else {
        return url.to_string();
    };
    match url[..at].rfind(':') {
        Some(colon) => format!("{}:****{}", &url[..colon], &url[at..]),
        None => url.to_string(),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_url_password_is_masked() {
        assert_eq!(
            mask_db_url("postgres://mob:secret@db:5432/mobility"),
            "postgres://mob:****@db:5432/mobility"
        );
        assert_eq!(mask_db_url("postgres://db/mobility"), "postgres://db/mobility");
    }
}
