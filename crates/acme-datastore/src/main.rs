//! Operator tool for Sentinel's shared ACME datastore.
//!
//! Reads the same `SENTINEL_ACME_DATASTORE_*` environment as the proxy.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use sentinel_acme_datastore::{AcmeStorage, DatastoreConfig, DatastoreStorage, LeaseStatus};

/// Inspect and repair shared ACME certificate storage
#[derive(Parser, Debug)]
#[command(name = "sentinel-acme-datastore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// ACME directory URL (overrides SENTINEL_ACME_DATASTORE_CA_URL)
    #[arg(long = "ca-url")]
    ca_url: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the most recently stored account email
    RecentUser,
    /// Check whether a certificate is stored for a domain
    SiteExists { domain: String },
    /// Show the lock lease of a domain
    Lease { domain: String },
    /// Clear a stuck lock lease, whoever holds it
    BreakLease { domain: String },
    /// Delete the stored certificate of a domain
    DeleteSite { domain: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = DatastoreConfig::from_env();
    if let Some(ca_url) = cli.ca_url {
        config.ca_url = ca_url;
    }

    let storage =
        DatastoreStorage::from_config(&config).context("Failed to initialize datastore storage")?;

    match cli.command {
        Commands::RecentUser => {
            let email = storage.most_recent_user_email().await;
            if email.is_empty() {
                info!("No users stored");
            } else {
                println!("{email}");
            }
        }
        Commands::SiteExists { domain } => {
            let exists = storage
                .site_exists(&domain)
                .await
                .with_context(|| format!("Failed to check site {domain}"))?;
            println!("{exists}");
        }
        Commands::Lease { domain } => {
            let status = storage
                .lease_status(&domain)
                .await
                .with_context(|| format!("Failed to read lease for {domain}"))?;
            match status {
                LeaseStatus::Unlocked => println!("unlocked"),
                LeaseStatus::Leased { until } => println!("locked until {}", until.to_rfc3339()),
            }
        }
        Commands::BreakLease { domain } => {
            let cleared = storage
                .break_lease(&domain)
                .await
                .with_context(|| format!("Failed to break lease for {domain}"))?;
            if cleared {
                println!("lease cleared");
            } else {
                println!("no active lease");
            }
        }
        Commands::DeleteSite { domain } => {
            storage
                .delete_site(&domain)
                .await
                .with_context(|| format!("Failed to delete site {domain}"))?;
            println!("deleted");
        }
    }

    Ok(())
}
