use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

use crate::api::{AMapClient, PoiApi};
use crate::cli::config::CrawlerConfig;
use crate::crawler::context::RunContext;
use crate::crawler::engine::CrawlEngine;
use crate::crawler::error::{CrawlError, Result};
use crate::crawler::fetcher::Fetcher;
use crate::crawler::pages::expand;
use crate::crawler::partition::GridPartitioner;
use crate::crawler::retry::RetryCoordinator;
use crate::crawler::task::{Task, TaskStatus};
use crate::output::Handover;
use crate::storage::{self, JobStore};
use crate::utils::{ProgressSink, TaskSummary};

/// Outcome of one execution of a task
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: TaskStatus,
    pub total_jobs: usize,
    pub unfinished_jobs: usize,
    pub handover: Handover,
}

/// Drives a task through partitioning, page expansion and the crawl rounds
pub struct CrawlerController {
    config: CrawlerConfig,
    store: Arc<dyn JobStore>,
    api: Arc<dyn PoiApi>,
    progress: ProgressSink,
}

impl CrawlerController {
    pub fn new(
        config: CrawlerConfig,
        store: Arc<dyn JobStore>,
        api: Arc<dyn PoiApi>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            config,
            store,
            api,
            progress,
        }
    }

    /// Create a controller backed by the configured job store and the live service
    pub async fn connect(config: CrawlerConfig, progress: ProgressSink) -> anyhow::Result<Self> {
        let store = storage::connect(&config.storage.database_url)
            .await
            .context(format!("Failed to open job store: {}", config.storage.database_url))?;
        let api = AMapClient::new(&config.api.base_url, config.api.request_timeout())
            .context("Failed to build the POI service client")?;

        Ok(Self::new(config, store, Arc::new(api), progress))
    }

    /// Persist a new task and assign its id
    pub async fn create_task(&self, task: &mut Task) -> anyhow::Result<()> {
        self.store.save_task(task).await?;
        info!("Created task {}", task.id()?);
        Ok(())
    }

    pub async fn load_task(&self, task_id: i64) -> anyhow::Result<Task> {
        self.store
            .load_task(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task {} not found", task_id))
    }

    /// Swap the API keys of a stored task before it runs again
    pub async fn replace_keys(&self, task: &mut Task, keys: Vec<String>) -> anyhow::Result<()> {
        task.keys = keys;
        self.store.update_task(task).await?;
        info!("Task {} now uses {} keys", task.id()?, task.keys.len());
        Ok(())
    }

    /// Job totals of a stored task: (all jobs, unfinished jobs)
    pub async fn job_counts(&self, task_id: i64) -> anyhow::Result<(usize, usize)> {
        Ok((
            self.store.count_jobs(task_id).await?,
            self.store.count_unfinished_jobs(task_id).await?,
        ))
    }

    /// Shared state for one execution; its stop handle cancels the run
    pub fn prepare(&self, task: &mut Task) -> Arc<RunContext> {
        Arc::new(RunContext::new(
            task,
            self.config.crawler.clone(),
            self.config.api.extension,
            self.progress.clone(),
        ))
    }

    /// Execute a saved task from wherever its status says it stopped
    pub async fn run(&self, task: &mut Task, ctx: Arc<RunContext>) -> Result<RunReport> {
        task.id()?;
        task.total_executed_times += 1;

        if task.status == TaskStatus::Success {
            self.progress
                .message(format!("Task {} has already finished", task.id()?));
            return self.report(task).await;
        }

        let fetcher = Arc::new(Fetcher::new(self.api.clone(), ctx.clone()));

        if task.status.needs_preprocessing() {
            if let Err(e) = self.preprocess(task, &ctx, fetcher.clone()).await {
                // Partitioning starts over on the next run, so the status stays put
                return Err(self.fail(task, e).await);
            }
        }

        task.status = TaskStatus::Processing;
        self.store.update_task(task).await?;
        self.progress.message(format!(
            "Crawling POIs in {} (keywords: {}, types: {})",
            task.boundary.label, task.keywords, task.types
        ));

        let engine = CrawlEngine::new(ctx.clone(), fetcher, self.store.clone());
        let coordinator = RetryCoordinator::new(ctx.clone(), engine, self.store.clone());

        match coordinator.run(task).await {
            // Written by the flush on stop
            Ok(TaskStatus::Paused) => {}
            Ok(_) => self.store.update_task(task).await?,
            Err(e) => {
                task.status = TaskStatus::SomeFailed;
                return Err(self.fail(task, e).await);
            }
        }

        self.report(task).await
    }

    async fn preprocess(&self, task: &mut Task, ctx: &Arc<RunContext>, fetcher: Arc<Fetcher>) -> Result<()> {
        let task_id = task.id()?;

        self.store.clear_task_data(task_id).await?;
        task.reset_counters();
        task.status = TaskStatus::Preprocessing;
        self.store.update_task(task).await?;

        self.progress.message(format!(
            "Partitioning {} with a threshold of {} per cell",
            task.boundary.label, task.threshold
        ));
        let partitioner = GridPartitioner::new(ctx.clone(), fetcher, self.config.api.page_size);
        let mut leaves = partitioner.partition(task).await?;
        let mut pages = expand(&leaves);

        if !ctx.is_running() {
            return Err(CrawlError::Cancelled);
        }
        self.store.save_jobs(&mut leaves).await?;
        self.store.flush(task, &leaves).await?;
        self.store.save_jobs(&mut pages).await?;

        self.progress.message(format!(
            "{} jobs built, {} still to crawl",
            leaves.len() + pages.len(),
            pages.len()
        ));
        if pages.len() >= self.config.crawler.large_task_warning {
            self.progress.warning(format!(
                "{} page requests are needed; make sure the keys have enough daily quota",
                pages.len()
            ));
        }

        Ok(())
    }

    /// Persist the task state reached and report it before the error propagates
    async fn fail(&self, task: &Task, e: CrawlError) -> CrawlError {
        self.progress.warning(format!("Task {} stopped: {}", task.id.unwrap_or_default(), e));
        if let Err(store_err) = self.store.update_task(task).await {
            error!("Failed to save task state: {:#}", store_err);
        }
        if let Err(report_err) = self.report(task).await {
            error!("Failed to summarize task: {}", report_err);
        }
        e
    }

    async fn report(&self, task: &Task) -> Result<RunReport> {
        let task_id = task.id()?;
        let total_jobs = self.store.count_jobs(task_id).await?;
        let unfinished_jobs = self.store.count_unfinished_jobs(task_id).await?;
        let handover = Handover::build(self.store.list_pois(task_id).await?, task);

        self.progress.summary(TaskSummary {
            task_id,
            status: task.status.to_string(),
            completed_jobs: total_jobs - unfinished_jobs,
            total_jobs,
            pois_collected: handover.pois.len(),
        });

        Ok(RunReport {
            status: task.status,
            total_jobs,
            unfinished_jobs,
            handover,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{error_response, FakeApi};
    use crate::output::OutputField;
    use crate::quota::UserType;
    use crate::region::{Boundary, BoundingBox};
    use crate::storage::{MemoryJobStore, SqliteJobStore};
    use crate::utils::progress::drain;
    use crate::utils::ProgressEvent;
    use std::collections::HashSet;
    use std::time::Duration;

    /// 100 items per unit of area
    fn density(bbox: &BoundingBox) -> u32 {
        (bbox.area() * 100.0).round() as u32
    }

    fn task() -> Task {
        Task::new(
            Boundary::rectangle(BoundingBox::new(0.0, 0.0, 2.0, 2.0), "unit square"),
            "cafe".to_string(),
            String::new(),
            vec!["A".to_string()],
            UserType::Enterprise,
            4,
            150,
            vec![OutputField::Id, OutputField::Name],
        )
    }

    #[tokio::test]
    async fn test_full_run_on_sqlite() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::connect("sqlite::memory:").await.unwrap());
        let api = Arc::new(FakeApi::new(density));
        let (progress, mut rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), api.clone(), progress);

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        let report = controller.run(&mut task, ctx).await.unwrap();

        // 4 leaves of 100 items, 5 pages each
        assert_eq!(report.status, TaskStatus::Success);
        assert_eq!(report.total_jobs, 20);
        assert_eq!(report.unfinished_jobs, 0);
        assert_eq!(report.handover.pois.len(), 400);
        let ids: HashSet<_> = report.handover.pois.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids.len(), 400);

        // 1 split query + 4 leaf queries + 16 further pages
        assert_eq!(api.calls(), 21);
        assert_eq!(task.request_actual_times, 21);

        let stored = controller.load_task(task.id.unwrap()).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.total_executed_times, 1);

        let summaries: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Summary(summary) => Some(summary),
                _ => None,
            })
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].pois_collected, 400);
        assert_eq!(summaries[0].completed_jobs, 20);
    }

    #[tokio::test]
    async fn test_some_failed_task_resumes_to_success() {
        let store = Arc::new(MemoryJobStore::new());
        let broken = Arc::new(
            FakeApi::new(density).with_override(|query, _| (query.page == 5).then(|| error_response(10016))),
        );
        let (progress, _rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), broken, progress.clone());

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        let report = controller.run(&mut task, ctx).await.unwrap();
        assert_eq!(report.status, TaskStatus::SomeFailed);
        assert_eq!(report.unfinished_jobs, 4);

        let healthy = Arc::new(FakeApi::new(density));
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), healthy.clone(), progress);
        let mut resumed = controller.load_task(task.id.unwrap()).await.unwrap();
        let ctx = controller.prepare(&mut resumed);
        let report = controller.run(&mut resumed, ctx).await.unwrap();

        assert_eq!(report.status, TaskStatus::Success);
        // Only the four missing pages are fetched again
        assert_eq!(healthy.calls(), 4);
        assert_eq!(report.handover.pois.len(), 400);
        assert_eq!(resumed.total_executed_times, 2);
    }

    #[tokio::test]
    async fn test_partition_failure_keeps_preprocessing() {
        let store = Arc::new(MemoryJobStore::new());
        let api = Arc::new(FakeApi::uniform(10).with_override(|_, _| Some(error_response(10004))));
        let (progress, _rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), api, progress);

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        let result = controller.run(&mut task, ctx).await;

        assert!(matches!(result, Err(CrawlError::PartitionFailed { remaining: 1 })));
        let stored = controller.load_task(task.id.unwrap()).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Preprocessing);
        assert_eq!(controller.job_counts(task.id.unwrap()).await.unwrap(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_while_partitioning_keeps_preprocessing() {
        let store = Arc::new(MemoryJobStore::new());
        let slow = Arc::new(FakeApi::new(density).with_latency(Duration::from_millis(100)));
        let (progress, _rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), slow.clone(), progress.clone());

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        let stop = ctx.stop_handle();
        tokio::spawn(async move {
            // The root query answers at ~100ms, the quadrant queries at ~200ms
            tokio::time::sleep(Duration::from_millis(150)).await;
            stop.stop();
        });

        let result = controller.run(&mut task, ctx).await;

        assert!(matches!(result, Err(CrawlError::Cancelled)));
        assert!(slow.calls() >= 1);
        let task_id = task.id.unwrap();
        let stored = controller.load_task(task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Preprocessing);
        assert_eq!(controller.job_counts(task_id).await.unwrap(), (0, 0));

        // A later run partitions from scratch and completes
        let healthy = Arc::new(FakeApi::new(density));
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), healthy.clone(), progress);
        let mut resumed = controller.load_task(task_id).await.unwrap();
        let ctx = controller.prepare(&mut resumed);
        let report = controller.run(&mut resumed, ctx).await.unwrap();

        assert_eq!(report.status, TaskStatus::Success);
        assert_eq!(report.total_jobs, 20);
        assert_eq!(report.handover.pois.len(), 400);
        assert_eq!(healthy.calls(), 21);
    }

    #[tokio::test]
    async fn test_fatal_error_marks_some_failed() {
        let store = Arc::new(MemoryJobStore::new());
        let api = Arc::new(
            FakeApi::new(density).with_override(|query, _| (query.page == 2).then(|| error_response(10001))),
        );
        let (progress, _rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), api, progress);

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        let result = controller.run(&mut task, ctx).await;

        assert!(matches!(result, Err(CrawlError::Fatal(_))));
        let stored = controller.load_task(task.id.unwrap()).await.unwrap();
        assert_eq!(stored.status, TaskStatus::SomeFailed);
    }

    #[tokio::test]
    async fn test_resume_with_replacement_keys() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::connect("sqlite::memory:").await.unwrap());
        let revoked = Arc::new(FakeApi::new(density).with_override(|query, _| {
            (query.key == "A" && query.page == 2).then(|| error_response(10001))
        }));
        let (progress, _rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), revoked, progress.clone());

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        assert!(matches!(controller.run(&mut task, ctx).await, Err(CrawlError::Fatal(_))));

        let healthy = Arc::new(FakeApi::new(density));
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), healthy.clone(), progress);
        let mut resumed = controller.load_task(task.id.unwrap()).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::SomeFailed);
        controller
            .replace_keys(&mut resumed, vec!["B".to_string()])
            .await
            .unwrap();

        let ctx = controller.prepare(&mut resumed);
        let report = controller.run(&mut resumed, ctx).await.unwrap();

        assert_eq!(report.status, TaskStatus::Success);
        assert_eq!(report.handover.pois.len(), 400);
        assert!(healthy.keys_used().iter().all(|key| key == "B"));
        let stored = controller.load_task(task.id.unwrap()).await.unwrap();
        assert_eq!(stored.keys, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_finished_task_is_not_rerun() {
        let store = Arc::new(MemoryJobStore::new());
        let api = Arc::new(FakeApi::new(density));
        let (progress, _rx) = ProgressSink::channel();
        let controller = CrawlerController::new(CrawlerConfig::default(), store.clone(), api.clone(), progress);

        let mut task = task();
        controller.create_task(&mut task).await.unwrap();
        let ctx = controller.prepare(&mut task);
        controller.run(&mut task, ctx).await.unwrap();
        let calls = api.calls();

        let ctx = controller.prepare(&mut task);
        let report = controller.run(&mut task, ctx).await.unwrap();

        assert_eq!(report.status, TaskStatus::Success);
        assert_eq!(api.calls(), calls);
    }
}
