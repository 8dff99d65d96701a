//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::Instant;
use xreds_service::config::Config;
use xreds_service::metrics;
use xreds_service::services::{create_ready_service, load_registry};

use crate::endpoints::DatasetSummary;
use crate::logging;
use crate::server;

/// XREDS commands.
#[derive(Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// List the identifiers of all configured datasets.
    Datasets,

    /// Load a single dataset, including its transforms, and print a summary of it.
    Load {
        /// The dataset identifier, as configured in the dataset mapping.
        id: String,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(name = "xreds", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded here, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(statsd) = &config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        };
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Datasets => list_datasets(&config)?,
        Command::Load { id } => load_dataset(config, &id)?,
    }

    Ok(())
}

fn list_datasets(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    for id in registry.ids() {
        println!("{id}");
    }
    Ok(())
}

fn load_dataset(config: Config, id: &str) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("xreds-load")
        .enable_all()
        .build()?;

    let summary = runtime.block_on(async {
        let service = create_ready_service(&config).await?;
        let start = Instant::now();
        let dataset = service.get_dataset(id).await?;
        tracing::info!(
            "Loaded dataset {} in {}",
            id,
            humantime::format_duration(start.elapsed())
        );
        anyhow::Ok(DatasetSummary::new(id, &dataset))
    })?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
