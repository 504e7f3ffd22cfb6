use std::sync::Arc;
use tracing::debug;

use crate::api::{FatalReason, PoiPage, RetryReason};
use crate::crawler::context::RunContext;
use crate::crawler::error::{CrawlError, Result};
use crate::crawler::fetcher::{Fetcher, Outcome};
use crate::crawler::pages::page_count;
use crate::crawler::pool::{Completion, WorkerPool};
use crate::crawler::task::{Job, JobError, Task};

/// Splits the task region into cells whose reported count stays within the threshold.
///
/// Every count query asks for page 1; an accepted cell keeps that result as
/// its first page, so leaves are returned already completed.
pub struct GridPartitioner {
    ctx: Arc<RunContext>,
    fetcher: Arc<Fetcher>,
    page_size: u32,
}

impl GridPartitioner {
    pub fn new(ctx: Arc<RunContext>, fetcher: Arc<Fetcher>, page_size: u32) -> Self {
        Self {
            ctx,
            fetcher,
            page_size,
        }
    }

    /// Partition the task boundary, retrying failed count queries for a bounded number of rounds
    pub async fn partition(&self, task: &mut Task) -> Result<Vec<Job>> {
        let task_id = task.id()?;
        let requests_before = task.request_actual_times;
        let rounds = self.ctx.settings.partition_rounds.max(1);

        let mut leaves = Vec::new();
        let mut frontier = vec![Job::first_page(
            task,
            task_id,
            task.boundary.bbox,
            self.page_size,
            0,
        )];

        for round in 1..=rounds {
            if round > 1 {
                self.ctx.progress.message(format!(
                    "Retrying {} cells, partition round {} of {}",
                    frontier.len(),
                    round,
                    rounds
                ));
            }

            let failed = self.run_round(task, frontier, &mut leaves).await?;
            if failed.is_empty() {
                let split_requests = (task.request_actual_times - requests_before)
                    .saturating_sub(leaves.len() as u64);
                task.request_expected_times += split_requests;
                self.ctx.progress.message(format!(
                    "Partitioned into {} cells, {} extra requests spent on split cells",
                    leaves.len(),
                    split_requests
                ));
                return Ok(leaves);
            }

            self.ctx.progress.warning(format!(
                "{} cells could not be counted in partition round {}",
                failed.len(),
                round
            ));
            frontier = failed;
        }

        Err(CrawlError::PartitionFailed {
            remaining: frontier.len(),
        })
    }

    /// Query a frontier level by level until no cell needs splitting.
    /// Returns the count queries that failed this round.
    async fn run_round(
        &self,
        task: &mut Task,
        mut frontier: Vec<Job>,
        leaves: &mut Vec<Job>,
    ) -> Result<Vec<Job>> {
        let mut failed = Vec::new();

        while !frontier.is_empty() {
            debug!("Probing {} cells", frontier.len());
            let mut pool = WorkerPool::new(self.fetcher.clone(), self.ctx.clone());
            let submitted = frontier.len();
            for job in frontier.drain(..) {
                if !pool.submit(job) {
                    return Err(CrawlError::Cancelled);
                }
            }

            let mut next = Vec::new();
            for _ in 0..submitted {
                match pool.next_completion().await {
                    Completion::Done { mut job, outcome } => {
                        task.count_request();
                        match outcome {
                            Outcome::Success(page) => {
                                if let Some(children) = self.split(task, &mut job, page, leaves)? {
                                    next.extend(children);
                                }
                            }
                            Outcome::Retryable(reason) => {
                                self.ctx
                                    .progress
                                    .warning(format!("Count query for {} failed: {}", job.describe(), reason));
                                job.record_failure(JobError::Retryable(reason));
                                failed.push(job);
                            }
                            Outcome::Fatal(_) if !self.ctx.is_running() => {
                                return Err(CrawlError::Cancelled);
                            }
                            Outcome::Fatal(reason) => {
                                self.ctx
                                    .progress
                                    .warning(format!("Count query for {} failed: {}", job.describe(), reason));
                                return Err(CrawlError::Fatal(reason));
                            }
                        }
                    }
                    Completion::TimedOut => {
                        let unfinished = pool.take_pending();
                        self.ctx.progress.warning(format!(
                            "No count query finished in time, {} cells left for the next round",
                            unfinished.len()
                        ));
                        failed.extend(unfinished.into_iter().map(|mut job| {
                            job.record_failure(JobError::Retryable(RetryReason::Timeout));
                            job
                        }));
                        break;
                    }
                    Completion::Cancelled => return Err(CrawlError::Cancelled),
                }
            }

            frontier = next;
        }

        Ok(failed)
    }

    /// Accept the cell as a leaf, or return its four quadrants
    fn split(
        &self,
        task: &mut Task,
        job: &mut Job,
        page: PoiPage,
        leaves: &mut Vec<Job>,
    ) -> Result<Option<Vec<Job>>> {
        let count = page.count;

        if count > task.threshold {
            if job.depth >= self.ctx.settings.max_split_depth {
                return Err(CrawlError::Fatal(FatalReason::CannotSatisfyThreshold {
                    depth: job.depth,
                    count,
                }));
            }
            self.ctx.progress.message(format!(
                "Cell reports {} items, above the threshold of {}; splitting ({} cells accepted so far)",
                count,
                task.threshold,
                leaves.len()
            ));
            let task_id = task.id()?;
            let parent: &Task = task;
            let (size, depth) = (job.size, job.depth + 1);
            let children = job
                .bounds
                .quadrants()
                .into_iter()
                .map(|bounds| Job::first_page(parent, task_id, bounds, size, depth))
                .collect();
            return Ok(Some(children));
        }

        task.poi_expected_count += count as u64;
        task.request_expected_times += page_count(count, job.size) as u64;
        task.count_pois(page.pois.len());
        job.poi_expected_count = count.min(job.size);
        job.record_success(page);
        leaves.push(job.clone());

        self.ctx
            .progress
            .message(format!("{} cells accepted", leaves.len()));
        Ok(None)
    }
}
