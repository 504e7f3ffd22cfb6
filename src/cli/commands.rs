use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::cli::CrawlArgs;
use crate::crawler::{CrawlError, CrawlerController, RunReport, StopHandle, Task};
use crate::output::OutputField;
use crate::quota::KeyPool;
use crate::region::{BoundaryResolver, DefaultResolver, RegionSpec};
use crate::utils::ProgressSink;

const KEY_PATTERN: &str = r"^[A-Za-z0-9]+$";

/// Start a new crawl task
pub async fn crawl(args: CrawlArgs) -> Result<()> {
    let config = load_config(args.profile.as_deref())?;

    let keys = parse_keys(&args.keys)?;
    let keywords = join_terms(&args.keywords);
    let types = join_terms(&args.types);
    if keywords.is_empty() && types.is_empty() {
        anyhow::bail!("At least one keyword or type is required");
    }
    if args.threads == 0 {
        anyhow::bail!("--threads must be a positive integer");
    }
    if args.threshold == 0 {
        anyhow::bail!("--threshold must be a positive integer");
    }
    let spec = region_spec(&args)?;
    let fields = if args.fields.is_empty() {
        OutputField::DEFAULT.to_vec()
    } else {
        args.fields
    };

    let resolver = DefaultResolver::new(config.api.boundary_url.clone(), config.api.request_timeout())?;
    let boundary = resolver
        .resolve(&spec)
        .await
        .context("Failed to resolve the crawl region")?;
    info!("Crawl region: {} ({})", boundary.label, boundary.kind.as_str());

    let mut task = Task::new(
        boundary,
        keywords,
        types,
        keys,
        args.user_type,
        args.threads,
        args.threshold,
        fields,
    );

    let controller = connect(config).await?;
    controller.create_task(&mut task).await?;
    println!("Task ID: {}", task.id()?);

    execute(&controller, task, args.output.as_deref()).await
}

/// Continue a stored task, optionally with a new key list
pub async fn resume(
    task_id: i64,
    keys: Option<String>,
    profile: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let keys = keys.as_deref().map(parse_keys).transpose()?;

    let controller = connect(config).await?;
    let mut task = controller.load_task(task_id).await?;
    info!("Task {} was {}", task_id, task.status);
    if let Some(keys) = keys {
        controller.replace_keys(&mut task, keys).await?;
    }

    execute(&controller, task, output.as_deref()).await
}

/// Check the status of a task
pub async fn status(task_id: i64, profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;

    let controller = connect(config).await?;
    let task = controller.load_task(task_id).await?;
    let (total, unfinished) = controller.job_counts(task_id).await?;

    println!("Task ID: {}", task_id);
    println!("Region: {}", task.boundary.label);
    println!("Keywords: {}", task.keywords);
    println!("Types: {}", task.types);
    println!("Status: {}", task.status);
    println!("Jobs: {}/{} done", total - unfinished, total);
    println!(
        "Requests: {} made, {} expected",
        task.request_actual_times, task.request_expected_times
    );
    println!(
        "POIs: {} collected, {} expected",
        task.poi_actual_count, task.poi_expected_count
    );
    println!("Runs: {}", task.total_executed_times);
    println!("Created: {}", task.created_at);
    println!("Last Updated: {}", task.updated_at);

    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}

fn load_config(profile: Option<&str>) -> Result<CrawlerConfig> {
    match profile {
        Some(name) => CrawlerConfig::load_profile(name).context(format!("Failed to load profile: {}", name)),
        None => CrawlerConfig::load_default(),
    }
}

/// Progress events are mirrored to the log, so the terminal needs no receiver
async fn connect(config: CrawlerConfig) -> Result<CrawlerController> {
    let (progress, _) = ProgressSink::channel();
    CrawlerController::connect(config, progress).await
}

/// Run a saved task with Ctrl-C wired to its stop handle
async fn execute(controller: &CrawlerController, mut task: Task, output: Option<&Path>) -> Result<()> {
    let ctx = controller.prepare(&mut task);
    let watcher = watch_interrupt(ctx.stop_handle());

    let result = controller.run(&mut task, ctx).await;
    watcher.abort();

    let report = match result {
        Ok(report) => report,
        Err(CrawlError::Cancelled) => {
            println!(
                "Task {} stopped before its jobs were built; resume it to partition again",
                task.id()?
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    print_report(task.id()?, &report);

    if let Some(path) = output {
        report.handover.write_json(path)?;
        println!("POIs written to: {}", path.display());
    }

    Ok(())
}

fn watch_interrupt(stop: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current requests");
            stop.stop();
        }
    })
}

fn print_report(task_id: i64, report: &RunReport) {
    println!("Task ID: {}", task_id);
    println!("Status: {}", report.status);
    println!(
        "Jobs: {}/{} done",
        report.total_jobs - report.unfinished_jobs,
        report.total_jobs
    );
    println!("POIs: {}", report.handover.pois.len());
    if report.unfinished_jobs > 0 {
        println!("Use `poi-crawler resume {}` to retry the unfinished jobs", task_id);
    }
}

fn region_spec(args: &CrawlArgs) -> Result<RegionSpec> {
    let region = &args.region;
    if let Some(text) = &region.rect {
        Ok(RegionSpec::Rectangle {
            text: text.clone(),
            crs: args.crs,
        })
    } else if let Some(path) = &region.geojson {
        Ok(RegionSpec::GeoJsonFile {
            path: path.clone(),
            crs: args.crs,
        })
    } else if let Some(code) = &region.adcode {
        Ok(RegionSpec::AdCode(code.trim().to_string()))
    } else {
        anyhow::bail!("One of --rect, --geojson or --adcode is required")
    }
}

/// Split a comma separated key list, rejecting anything that is not alphanumeric
pub fn parse_keys(text: &str) -> Result<Vec<String>> {
    let pattern = Regex::new(KEY_PATTERN)?;
    let keys = KeyPool::distinct(text.split([',', '，']).map(str::to_string));

    if keys.is_empty() {
        anyhow::bail!("At least one API key is required");
    }
    if let Some(bad) = keys.iter().find(|key| !pattern.is_match(key)) {
        anyhow::bail!("Invalid API key '{}': only letters and digits are allowed", bad);
    }

    Ok(keys)
}

/// Comma separated input to the `|` separated form the service expects
pub fn join_terms(text: &str) -> String {
    text.split([',', '，', '|'])
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!(parse_keys("abc123, DEF456").unwrap(), vec!["abc123", "DEF456"]);
        assert_eq!(parse_keys("abc，def,").unwrap(), vec!["abc", "def"]);
        assert!(parse_keys("").is_err());
        assert!(parse_keys(" , ").is_err());
        assert!(parse_keys("abc,de-f").is_err());
        assert_eq!(parse_keys("abc,def,abc").unwrap(), vec!["abc", "def"]);
    }

    #[test]
    fn test_join_terms() {
        assert_eq!(join_terms("cafe, tea ,,bar"), "cafe|tea|bar");
        assert_eq!(join_terms("050000|060000"), "050000|060000");
        assert_eq!(join_terms("  "), "");
    }
}
