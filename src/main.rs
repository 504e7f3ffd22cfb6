use anyhow::Result;
use tracing::{error, info};

mod api;
mod cli;
mod crawler;
mod output;
mod quota;
mod region;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let log_file = args.log_file.clone().map(|path| path.unwrap_or_else(utils::default_log_file));
    utils::init_logging(args.verbose, log_file)?;

    info!("Starting POI crawler v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
