//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use locgov_core::DEFAULT_MAX_ATTEMPTS;

/// Demo search used when no input is supplied.
pub const DEMO_SEARCH_URL: &str =
    "https://www.loc.gov/newspapers/?dates=1820/1821&fa=location_state:district+of+columbia";

/// Collect loc.gov metadata from a search URL or a CSV of record ids.
///
/// Outputs a set of CSV files (search results, item records, resources, and
/// file listings) plus an errors.json ledger into the output directory.
#[derive(Parser, Debug)]
#[command(name = "locgov")]
#[command(author, version, about)]
pub struct Args {
    /// Whether the input is a loc.gov search URL or a CSV file of ids
    #[arg(short = 't', long, value_enum, default_value_t = InputKind::Search)]
    pub input_type: InputKind,

    /// loc.gov search URL, or path to a CSV with an item_id/resource_id column
    #[arg(short = 'i', long, default_value = DEMO_SEARCH_URL)]
    pub input: String,

    /// For searches, collect only the top n results (0 takes everything)
    #[arg(short = 'n', long, default_value_t = 0)]
    pub limit: usize,

    /// Directory to save outputs into
    #[arg(short = 'd', long, default_value = "./output")]
    pub output_dir: PathBuf,

    /// Prefix added to all output filenames
    #[arg(short = 'x', long, default_value = "")]
    pub output_prefix: String,

    /// Base seconds to pause between requests (0 disables pacing)
    #[arg(short = 'p', long, default_value_t = 15)]
    pub pause: u64,

    /// Search results per page (loc.gov default varies by collection)
    #[arg(short = 'c', long)]
    pub per_page: Option<u32>,

    /// Environment to harvest from; only prod is publicly available
    #[arg(long, value_enum, default_value_t = EnvKind::Prod)]
    pub env: EnvKind,

    /// Email address or app URL used to tag your traffic for loc.gov staff
    #[arg(short = 'u', long)]
    pub user_agent: Option<String>,

    /// Maximum attempts per request, including the first (1-20)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: u32,

    /// Also fetch item-level records (always on for CSV inputs)
    #[arg(short = 'g', long)]
    pub get_items: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Input flavors accepted by `--input-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputKind {
    /// A loc.gov search URL.
    Search,
    /// A CSV of item or resource ids.
    Csv,
}

/// Environments accepted by `--env`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EnvKind {
    /// Public production site.
    Prod,
    /// Staff test environment.
    Test,
    /// Staff dev environment.
    Dev,
}
