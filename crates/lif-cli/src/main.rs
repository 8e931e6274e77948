use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lif_catalog::{maybe_build_sweep_scheduler, CatalogConfig, ProviderCatalog, SearchOptions};
use lif_core::ProviderScope;
use lif_geo::{HttpPostcodeResolver, ResolverConfig};
use lif_store::PgStore;
use lif_web::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lif-cli")]
#[command(about = "Local Instructor Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API, with the priority sweep scheduler if enabled.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Apply database schema migrations.
    Migrate,
    /// Run the priority-expiry sweep once and exit.
    Sweep,
    /// Find the closest providers to a postcode.
    Find {
        postcode: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Restrict to providers listing the area as covered.
        #[arg(long)]
        cover: bool,
        /// Rank providers with an active offer first.
        #[arg(long)]
        offers: bool,
        /// Search tutors only.
        #[arg(long)]
        tutors: bool,
    },
    /// List providers, optionally filtered to one status code.
    List {
        #[arg(long)]
        status: Option<i16>,
    },
}

async fn build_catalog(config: &CatalogConfig) -> Result<Arc<ProviderCatalog>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to provider database")?;
    let resolver = HttpPostcodeResolver::new(ResolverConfig {
        base_url: config.lookup_base_url.clone(),
        timeout: Duration::from_secs(config.lookup_timeout_secs),
        user_agent: Some("lif/0.1".to_string()),
    })
    .context("building postcode resolver")?;
    Ok(Arc::new(ProviderCatalog::new(
        Arc::new(store),
        Arc::new(resolver),
        config.clone(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = CatalogConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: 8000 }) {
        Commands::Serve { port } => {
            let catalog = build_catalog(&config).await?;
            if let Some(mut scheduler) = maybe_build_sweep_scheduler(catalog.clone()).await? {
                scheduler.start().await.context("starting sweep scheduler")?;
                tracing::info!(cron = %config.sweep_cron, "priority sweep scheduled");
            }
            lif_web::serve(AppState::new(catalog), port).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to provider database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations complete");
        }
        Commands::Sweep => {
            let catalog = build_catalog(&config).await?;
            let demoted = catalog.expire_priorities(Utc::now()).await?;
            println!("sweep complete: demoted={demoted}");
        }
        Commands::Find {
            postcode,
            limit,
            cover,
            offers,
            tutors,
        } => {
            let catalog = build_catalog(&config).await?;
            let options = SearchOptions {
                limit,
                cover_only: cover,
                prefer_offers: offers,
                scope: if tutors {
                    ProviderScope::Tutors
                } else {
                    ProviderScope::All
                },
                ..SearchOptions::default()
            };
            match catalog.find_closest(&postcode, &options).await? {
                Some(matches) => {
                    for ranked in &matches {
                        let distance = ranked
                            .distance
                            .map(|miles| format!("{miles:>6.1} mi"))
                            .unwrap_or_else(|| "     -   ".to_string());
                        println!(
                            "{distance}  #{} {} ({})",
                            ranked.profile.id, ranked.profile.name, ranked.profile.coverage_display
                        );
                    }
                }
                None => println!("no matching providers"),
            }
        }
        Commands::List { status } => {
            let catalog = build_catalog(&config).await?;
            match catalog.list_all(status).await? {
                Some(providers) => {
                    for profile in &providers {
                        println!(
                            "#{} {} [{}] ({})",
                            profile.id,
                            profile.name,
                            profile.status_label.as_deref().unwrap_or("unknown"),
                            profile.coverage_display
                        );
                    }
                }
                None => println!("no providers"),
            }
        }
    }

    Ok(())
}
