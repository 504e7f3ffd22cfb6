pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::api::Poi;
use crate::crawler::task::{Job, Task};

// Re-export common types
pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Durable Task, Job and POI records; the source of truth for resume
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new task and assign its id
    async fn save_task(&self, task: &mut Task) -> Result<()>;

    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn load_task(&self, task_id: i64) -> Result<Option<Task>>;

    /// Insert new jobs and assign their ids
    async fn save_jobs(&self, jobs: &mut [Job]) -> Result<()>;

    /// Overwrite the stored state of already saved jobs
    async fn update_jobs(&self, jobs: &[Job]) -> Result<()>;

    /// Store the results carried by successful jobs, keyed on (job, position)
    async fn save_pois(&self, task_id: i64, jobs: &[Job]) -> Result<()>;

    async fn list_unfinished_jobs(&self, task_id: i64) -> Result<Vec<Job>>;

    async fn count_jobs(&self, task_id: i64) -> Result<usize>;

    async fn count_unfinished_jobs(&self, task_id: i64) -> Result<usize>;

    async fn list_pois(&self, task_id: i64) -> Result<Vec<Poi>>;

    /// Drop every job and POI of a task, keeping the task itself
    async fn clear_task_data(&self, task_id: i64) -> Result<()>;

    /// Persist task counters, job states and new POIs together.
    /// Writing the same batch twice leaves the same state as writing it once.
    async fn flush(&self, task: &Task, jobs: &[Job]) -> Result<()> {
        self.update_task(task).await?;
        self.update_jobs(jobs).await?;
        self.save_pois(task.id()?, jobs).await
    }
}

/// Open the store named by a database URL; `memory` keeps everything in process
pub async fn connect(database_url: &str) -> Result<Arc<dyn JobStore>> {
    if database_url == "memory" {
        return Ok(Arc::new(MemoryJobStore::new()));
    }
    if database_url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteJobStore::connect(database_url).await?));
    }
    anyhow::bail!("Unsupported database URL: {}", database_url)
}

/// POIs of successful jobs, paired with their position on the page
pub(crate) fn collected_pois(jobs: &[Job]) -> impl Iterator<Item = (&Job, usize, &Poi)> {
    jobs.iter()
        .filter(|job| job.is_finished())
        .filter_map(|job| job.result.as_ref().map(|page| (job, page)))
        .flat_map(|(job, page)| page.pois.iter().enumerate().map(move |(seq, poi)| (job, seq, poi)))
}
