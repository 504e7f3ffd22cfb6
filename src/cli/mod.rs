pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::output::OutputField;
use crate::quota::UserType;
use crate::region::CoordinateSystem;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file, the data directory when no path is given
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,
}

/// Region selection, exactly one source
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct RegionArgs {
    /// Rectangle as `lng,lat#lng,lat`, top-left corner first
    #[arg(long)]
    pub rect: Option<String>,

    /// GeoJSON file with a Polygon or MultiPolygon
    #[arg(long)]
    pub geojson: Option<PathBuf>,

    /// Administrative division code, e.g. 420100
    #[arg(long)]
    pub adcode: Option<String>,
}

#[derive(Args, Debug)]
pub struct CrawlArgs {
    #[command(flatten)]
    pub region: RegionArgs,

    /// Coordinate system of the rectangle or GeoJSON input
    #[arg(long, value_enum, default_value = "gcj02")]
    pub crs: CoordinateSystem,

    /// API keys, comma separated
    #[arg(short, long, required = true)]
    pub keys: String,

    /// Keywords, comma separated
    #[arg(long, default_value = "")]
    pub keywords: String,

    /// POI type codes, comma separated
    #[arg(long, default_value = "")]
    pub types: String,

    /// Account tier of the keys
    #[arg(short, long, value_enum, default_value = "individual")]
    pub user_type: UserType,

    /// Concurrent requests
    #[arg(short, long, default_value_t = 4)]
    pub threads: u32,

    /// Largest item count accepted for a single cell
    #[arg(long, default_value_t = 850)]
    pub threshold: u32,

    /// Fields handed to the exporter
    #[arg(long, value_enum, value_delimiter = ',')]
    pub fields: Vec<OutputField>,

    /// Configuration profile to use instead of the default
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Write the collected POIs to this JSON file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new crawl task
    Crawl(CrawlArgs),

    /// Continue a paused or partially failed task
    Resume {
        /// Task ID to resume
        #[arg(required = true)]
        task_id: i64,

        /// Replacement API keys, comma separated
        #[arg(short, long)]
        keys: Option<String>,

        /// Configuration profile to use instead of the default
        #[arg(short, long)]
        profile: Option<String>,

        /// Write the collected POIs to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check status of a task
    Status {
        /// Task ID to check status for
        #[arg(required = true)]
        task_id: i64,

        /// Configuration profile to use instead of the default
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl(args) => {
            info!("Starting a new crawl task");
            commands::crawl(args).await
        }
        Commands::Resume {
            task_id,
            keys,
            profile,
            output,
        } => {
            info!("Resuming task {}", task_id);
            commands::resume(task_id, keys, profile, output).await
        }
        Commands::Status { task_id, profile } => {
            info!("Checking status for task {}", task_id);
            commands::status(task_id, profile).await
        }
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        }
    }
}
