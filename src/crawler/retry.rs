use std::sync::Arc;

use crate::crawler::context::RunContext;
use crate::crawler::engine::CrawlEngine;
use crate::crawler::error::{CrawlError, Result};
use crate::crawler::task::{Task, TaskStatus};
use crate::storage::JobStore;

/// Outer loop over the unfinished jobs of a task
pub struct RetryCoordinator {
    ctx: Arc<RunContext>,
    engine: CrawlEngine,
    store: Arc<dyn JobStore>,
}

impl RetryCoordinator {
    pub fn new(ctx: Arc<RunContext>, engine: CrawlEngine, store: Arc<dyn JobStore>) -> Self {
        Self { ctx, engine, store }
    }

    /// Crawl until nothing is unfinished or the round budget is spent.
    ///
    /// Returns `Success`, `SomeFailed` or `Paused` and leaves it on the task.
    /// Fatal outcomes propagate as errors.
    pub async fn run(&self, task: &mut Task) -> Result<TaskStatus> {
        let task_id = task.id()?;
        let total = self.store.count_jobs(task_id).await?;
        let rounds = self.ctx.settings.retry_rounds.max(1);
        let mut unfinished = self.store.list_unfinished_jobs(task_id).await?;

        for round in 1..=rounds {
            if unfinished.is_empty() {
                break;
            }
            if round > 1 {
                self.ctx.progress.message(format!(
                    "Retrying {} unfinished jobs, round {} of {}",
                    unfinished.len(),
                    round,
                    rounds
                ));
            }

            match self.engine.crawl(task, unfinished, total).await {
                Ok(_) => {}
                Err(CrawlError::Cancelled) => {
                    task.status = TaskStatus::Paused;
                    return Ok(TaskStatus::Paused);
                }
                Err(e) => return Err(e),
            }

            unfinished = self.store.list_unfinished_jobs(task_id).await?;
            self.ctx.progress.message(format!(
                "Round {}: {} jobs in total, {} done, {} unfinished",
                round,
                total,
                total - unfinished.len(),
                unfinished.len()
            ));
        }

        let status = if unfinished.is_empty() {
            TaskStatus::Success
        } else {
            self.ctx.progress.warning(format!(
                "{} jobs still unfinished after {} rounds",
                unfinished.len(),
                rounds
            ));
            TaskStatus::SomeFailed
        };
        task.status = status;
        Ok(status)
    }
}
