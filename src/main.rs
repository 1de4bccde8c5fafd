pub mod aggregate;
pub mod boundaries;
pub mod catalog;
pub mod config;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod reconcile;
pub mod table;
pub mod tracker;
pub mod types;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
    /// ISO3 codes to update (defaults to every country with boundaries)
    #[arg(long, env = "COUNTRIES", value_delimiter = ',')]
    countries: Vec<String>,
    /// Catalog root directory, overriding the config file
    #[arg(long, env = "CATALOG_ROOT", value_name = "DIR")]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Recount facilities and update the published dataset
    Update {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Recount facilities and write the merged table locally
    Summarize {
        #[command(flatten)]
        args: RunArgs,
        #[arg(short, long, value_name = "FILE", default_value = "subnational_health_facilities.csv")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("##### health facility counts #####");

    match &cli.command {
        Commands::Update { args } => {
            let (app_config, store, report) = summarize(args)?;
            let catalog = catalog::LocalCatalog::new(&app_config.catalog.root, app_config.columns.clone());

            if let Some(table) = pipeline::publish(&catalog, &app_config.inputs.dataset, &store, &report)? {
                info!("Updated {} with {} rows", app_config.inputs.dataset, table.rows.len());
            }
        }
        Commands::Summarize { args, output } => {
            let (app_config, store, report) = summarize(args)?;
            let catalog = catalog::LocalCatalog::new(&app_config.catalog.root, app_config.columns.clone());

            let finalized = pipeline::finalize_levels(&store, &report.tracker);
            let table = pipeline::merge_with_published(&catalog, &app_config.inputs.dataset, &finalized)?;
            let file = File::create(output).with_context(|| format!("Failed to create {:?}", output))?;
            table.write_csv(file)?;
            info!("Wrote {} rows to {:?}", table.rows.len(), output);
        }
    }

    Ok(())
}

/// Loads config and boundaries, then counts facilities for the requested countries.
fn summarize(
    args: &RunArgs,
) -> anyhow::Result<(config::AppConfig, boundaries::BoundaryStore, pipeline::RunReport)> {
    let mut app_config = config::AppConfig::load_from_file(&args.config)?;
    if let Some(root) = &args.catalog {
        app_config.catalog.root = root.clone();
    }

    let catalog = catalog::LocalCatalog::new(&app_config.catalog.root, app_config.columns.clone());
    let loader = loader::FileLayerLoader::new(app_config.catalog.scratch_dir.clone());

    let (store, report) = {
        let mut pipeline = pipeline::Pipeline::new(&app_config.inputs, &catalog, &loader);
        let mut store = pipeline.load_boundaries(&app_config.columns)?;

        let mut countries: BTreeSet<String> = args
            .countries
            .iter()
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        if countries.is_empty() {
            countries = store.countries();
        }
        let countries: Vec<String> = countries.into_iter().collect();
        info!("Processing {} countries", countries.len());

        let report = pipeline.summarize(&mut store, &countries);
        (store, report)
    };

    let skipped = report.skipped().count();
    if skipped > 0 {
        warn!("Skipped {} country/level pairs, see errors above", skipped);
    }

    Ok((app_config, store, report))
}
