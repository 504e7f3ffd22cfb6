use std::sync::Arc;
use tracing::{debug, error};

use crate::api::RetryReason;
use crate::crawler::context::RunContext;
use crate::crawler::error::{CrawlError, Result};
use crate::crawler::fetcher::{Fetcher, Outcome};
use crate::crawler::pool::{Completion, WorkerPool};
use crate::crawler::task::{Job, JobError, Task, TaskStatus};
use crate::storage::JobStore;

/// Counts for one batch of jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Runs one batch of jobs to completion, buffering results and flushing them
/// to the job store in bounded chunks.
pub struct CrawlEngine {
    ctx: Arc<RunContext>,
    fetcher: Arc<Fetcher>,
    store: Arc<dyn JobStore>,
}

impl CrawlEngine {
    pub fn new(ctx: Arc<RunContext>, fetcher: Arc<Fetcher>, store: Arc<dyn JobStore>) -> Self {
        Self {
            ctx,
            fetcher,
            store,
        }
    }

    /// Execute `jobs`. `total_jobs` is the size of the whole task, for progress lines.
    ///
    /// A timed out batch returns normally with its unobserved jobs failed; a
    /// fatal outcome or a stop request ends the batch with an error after the
    /// buffered results have been written.
    pub async fn crawl(&self, task: &mut Task, jobs: Vec<Job>, total_jobs: usize) -> Result<BatchReport> {
        let finished_before = total_jobs.saturating_sub(jobs.len());
        let batch_size = jobs.len();
        let flush_every = self.ctx.settings.flush_every.max(1);

        let mut report = BatchReport::default();
        let mut cached: Vec<Job> = Vec::new();
        let mut pool = WorkerPool::new(self.fetcher.clone(), self.ctx.clone());

        let mut queued = jobs.into_iter();
        for job in queued.by_ref() {
            if !pool.submit(job) {
                break;
            }
        }
        let never_submitted: Vec<Job> = queued.collect();
        if !never_submitted.is_empty() || !self.ctx.is_running() {
            let mut unfinished = pool.take_pending();
            unfinished.extend(never_submitted);
            return self.pause(task, cached, unfinished).await;
        }

        for observed in 1..=batch_size {
            match pool.next_completion().await {
                Completion::Done { mut job, outcome } => match outcome {
                    Outcome::Success(page) => {
                        task.count_request();
                        task.count_pois(page.pois.len());
                        job.record_success(page);
                        report.succeeded += 1;
                        cached.push(job);
                        self.ctx.progress.message(format!(
                            "{}/{} jobs done",
                            finished_before + report.succeeded,
                            total_jobs
                        ));
                    }
                    Outcome::Retryable(reason) => {
                        self.ctx
                            .progress
                            .warning(format!("{} failed: {}", job.describe(), reason));
                        job.record_failure(JobError::Retryable(reason));
                        report.failed += 1;
                        cached.push(job);
                    }
                    Outcome::Fatal(_) if !self.ctx.is_running() => {
                        let mut unfinished = pool.take_pending();
                        unfinished.push(job);
                        return self.pause(task, cached, unfinished).await;
                    }
                    Outcome::Fatal(reason) => {
                        self.ctx
                            .progress
                            .warning(format!("{} failed: {}", job.describe(), reason));
                        job.record_failure(JobError::Fatal(reason.clone()));
                        cached.push(job);
                        pool.shutdown();
                        self.abort(task, cached, pool.take_pending()).await;
                        return Err(CrawlError::Fatal(reason));
                    }
                },
                Completion::TimedOut => {
                    let unfinished = pool.take_pending();
                    report.timed_out = unfinished.len();
                    self.ctx.progress.warning(format!(
                        "No job finished in time, {} jobs left for the next round",
                        unfinished.len()
                    ));
                    pool.shutdown();
                    cached.extend(interrupted(unfinished, RetryReason::Timeout));
                    self.write(task, &cached).await?;
                    return Ok(report);
                }
                Completion::Cancelled => {
                    let unfinished = pool.take_pending();
                    return self.pause(task, cached, unfinished).await;
                }
            }

            if cached.len() >= flush_every || observed == batch_size {
                if !self.ctx.is_running() {
                    let unfinished = pool.take_pending();
                    return self.pause(task, cached, unfinished).await;
                }
                self.write(task, &cached).await?;
                cached.clear();
            }
        }

        Ok(report)
    }

    async fn write(&self, task: &Task, jobs: &[Job]) -> Result<()> {
        debug!("Flushing {} jobs", jobs.len());
        self.store.flush(task, jobs).await?;
        Ok(())
    }

    /// Single guarded flush on stop; later calls write nothing
    async fn pause(&self, task: &mut Task, mut cached: Vec<Job>, unfinished: Vec<Job>) -> Result<BatchReport> {
        if self.ctx.claim_pause_flush() {
            self.ctx.progress.message("Stopping, saving collected results...");
            cached.extend(interrupted(unfinished, RetryReason::Interrupted));
            task.status = TaskStatus::Paused;
            if let Err(e) = self.store.flush(task, &cached).await {
                error!("Failed to save results while stopping: {:#}", e);
            }
        }
        Err(CrawlError::Cancelled)
    }

    /// Best-effort write before a fatal error propagates
    async fn abort(&self, task: &mut Task, mut cached: Vec<Job>, unfinished: Vec<Job>) {
        cached.extend(interrupted(unfinished, RetryReason::Interrupted));
        if let Err(e) = self.store.flush(task, &cached).await {
            error!("Failed to save results before aborting: {:#}", e);
        }
    }
}

fn interrupted(jobs: Vec<Job>, reason: RetryReason) -> impl Iterator<Item = Job> {
    jobs.into_iter().map(move |mut job| {
        job.record_failure(JobError::Retryable(reason.clone()));
        job
    })
}
