mod config;
mod feed;
mod models;
mod pipeline;
mod scheduler;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::feed::DataGovClient;
use crate::pipeline::Pipeline;
use crate::storage::{MarketStore, Repository};

#[derive(Parser)]
#[command(name = "mandi-etl", about = "Mandi commodity price ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run one ingestion pass now and exit
    Run,

    /// Run at startup, then daily at the configured trigger time
    Schedule,

    /// Show database statistics and the last run outcome
    Stats,

    /// List all resolved markets
    Markets,

    /// Latest stored price per commodity for a market
    Latest {
        /// Market name as it appears in the feed
        market: String,
    },

    /// List districts with at least one market for the target state
    Districts,

    /// Apply schema migrations without ingesting
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "mandi_price_etl=info,warn",
        1 => "mandi_price_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => {
            let _t = utils::Timer::start("One-shot ingestion");
            let pipeline = build_pipeline(&config)?;
            let summary = pipeline.run().await?;
            info!(
                "Done: {} attempted, {} succeeded, {} failed",
                summary.attempted, summary.succeeded, summary.failed
            );
        }

        Command::Schedule => {
            let pipeline = Arc::new(build_pipeline(&config)?);
            let trigger_at = config.schedule.trigger()?;
            info!(
                "Scheduling daily ingestion at {} (run on start: {})",
                config.schedule.trigger_time, config.schedule.run_on_start
            );
            scheduler::Scheduler::new(pipeline, trigger_at, config.schedule.run_on_start)
                .run()
                .await?;
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            let markets = repo.market_count()?;
            let observations = repo.observation_count()?;
            let (min, max) = repo.observation_date_range().unwrap_or((None, None));
            println!("─────────────────────────────────");
            println!("  Mandi ETL — Database Stats");
            println!("─────────────────────────────────");
            println!("  Markets      : {}", markets);
            println!("  Observations : {}", observations);
            println!("  From         : {}", min.unwrap_or_else(|| "—".into()));
            println!("  To           : {}", max.unwrap_or_else(|| "—".into()));
            match repo.last_run()? {
                Some(run) => println!(
                    "  Last run     : {} ({}/{} ok, {} failed)",
                    run.status, run.succeeded, run.attempted, run.failed
                ),
                None => println!("  Last run     : never"),
            }
            println!("─────────────────────────────────");
        }

        Command::Markets => {
            let repo = Repository::open(&config.storage.db_path)?;
            let markets = repo.list_markets()?;
            if markets.is_empty() {
                println!("No markets — run `mandi-etl run` first.");
            } else {
                println!("{} markets:", markets.len());
                for m in &markets {
                    println!(
                        "  [{}] {} ({}, {}) — last seen {}",
                        m.id, m.market_name, m.district, m.state, m.last_seen_at
                    );
                }
            }
        }

        Command::Latest { market } => {
            let repo = Repository::open(&config.storage.db_path)?;
            let markets = repo.find_markets_by_name(&market)?;
            if markets.is_empty() {
                println!("No market named {:?} — run `mandi-etl run` first.", market);
            }
            for m in &markets {
                println!("{} ({}, {})", m.market_name, m.district, m.state);
                for obs in repo.latest_prices(m.id)? {
                    println!(
                        "  {:<24} {:<14} min {:>9} | modal {:>9} | max {:>9}  on {}",
                        obs.commodity,
                        obs.variety,
                        fmt_price(obs.min_price),
                        fmt_price(obs.modal_price),
                        fmt_price(obs.max_price),
                        obs.observed_on.as_deref().unwrap_or("—"),
                    );
                }
            }
        }

        Command::Districts => {
            let repo = Repository::open(&config.storage.db_path)?;
            let districts = repo.list_districts(&config.pipeline.target_state)?;
            if districts.is_empty() {
                println!(
                    "No districts for {:?} — run `mandi-etl run` first.",
                    config.pipeline.target_state
                );
            } else {
                println!("{} districts in {}:", districts.len(), config.pipeline.target_state);
                for d in &districts {
                    println!("  {}", d);
                }
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    let repo = Arc::new(Repository::open(&config.storage.db_path)?);
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    let feed = DataGovClient::new(&config.feed, &config.pipeline.target_state)?;
    Ok(Pipeline::new(
        Box::new(feed),
        repo as Arc<dyn MarketStore>,
        config.pipeline.target_state.clone(),
    ))
}

fn fmt_price(price: Option<f64>) -> String {
    price
        .map(|p| format!("{:.2}", p))
        .unwrap_or_else(|| "—".into())
}
