//! CLI entry point for the locgov harvest tool.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use locgov_core::{
    ApiClient, ClientOptions, Environment, HarvestOptions, InputSource, LocGovRecords,
};

mod cli;

use cli::{Args, DEMO_SEARCH_URL, EnvKind, InputKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("locgov harvest starting");

    if args.input_type == InputKind::Search && args.input == DEMO_SEARCH_URL {
        warn!(
            "no --input supplied; using the demo search: {}",
            DEMO_SEARCH_URL
        );
    }

    let input = match args.input_type {
        InputKind::Search => InputSource::Search(args.input.clone()),
        InputKind::Csv => InputSource::Csv(PathBuf::from(&args.input)),
    };

    let environment = match args.env {
        EnvKind::Prod => Environment::Prod,
        EnvKind::Test => Environment::Test,
        EnvKind::Dev => Environment::Dev,
    };

    let client = ApiClient::with_options(&ClientOptions {
        user_agent: args.user_agent.clone(),
        pause: Duration::from_secs(args.pause),
        max_attempts: args.max_attempts,
    })?;

    let mut records = LocGovRecords::new(
        client,
        input,
        HarvestOptions {
            output_dir: args.output_dir.clone(),
            output_prefix: args.output_prefix.clone(),
            per_page: args.per_page,
            environment,
        },
    )?;

    // Spinner while the harvest runs; detailed progress goes to the log.
    let spinner = if args.quiet {
        ProgressBar::hidden()
    } else {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message("Harvesting loc.gov records...");
        spinner
    };

    let outcome = records.get_records(args.get_items, args.limit, true).await;
    spinner.finish_and_clear();
    outcome?;

    info!(
        search_results = records.search_metadata.len(),
        items = records.items.len(),
        resources = records.resources.len(),
        segment_files = records.files_segments.len(),
        resource_files = records.files_resources.len(),
        search_errors = records.errors.search.len(),
        item_errors = records.errors.items.len(),
        "harvest finished"
    );
    if records.client().is_blocked() {
        warn!(
            "the session was rate limited by loc.gov (429); rerun later with a longer --pause"
        );
    }

    info!("Done!");
    Ok(())
}
