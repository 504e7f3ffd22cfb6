use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::Extension;
use crate::cli::config::CrawlerSettings;
use crate::crawler::task::Task;
use crate::quota::{clamp_concurrency, KeyPool, RateGovernor};
use crate::utils::ProgressSink;

/// Clears the shared running flag of a run
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything a single execution of a task shares between its workers
pub struct RunContext {
    running: Arc<AtomicBool>,
    pause_flushed: AtomicBool,
    concurrency: u32,
    pub keys: KeyPool,
    pub governor: RateGovernor,
    pub progress: ProgressSink,
    pub settings: CrawlerSettings,
    pub extension: Extension,
}

impl RunContext {
    /// Build the context for one run of `task`.
    ///
    /// The task's worker count is clamped to what its keys can sustain before
    /// any pool is built, and the reduction is reported.
    pub fn new(
        task: &mut Task,
        settings: CrawlerSettings,
        minimum_extension: Extension,
        progress: ProgressSink,
    ) -> Self {
        let distinct = KeyPool::distinct(task.keys.iter().cloned());
        let key_count = distinct.len();
        let keys = KeyPool::new(distinct);
        let qps = task.user_type.qps();

        let clamped = clamp_concurrency(task.thread_num, qps, key_count).max(1);
        if clamped < task.thread_num {
            progress.warning(format!(
                "Thread count {} exceeds what {} key(s) at {} QPS allow, using {} instead",
                task.thread_num, key_count, qps, clamped
            ));
            task.thread_num = clamped;
        }

        let extension = match minimum_extension {
            Extension::All => Extension::All,
            Extension::Base => task.extension(),
        };

        Self {
            running: Arc::new(AtomicBool::new(true)),
            pause_flushed: AtomicBool::new(false),
            concurrency: task.thread_num.max(1),
            keys,
            governor: RateGovernor::new(qps, task.thread_num.max(1)),
            progress,
            settings,
            extension,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Worker count for pools built from this context
    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// True for the first caller only; guards the single flush on pause
    pub fn claim_pause_flush(&self) -> bool {
        !self.pause_flushed.swap(true, Ordering::SeqCst)
    }
}
