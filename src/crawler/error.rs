use thiserror::Error;

use crate::api::FatalReason;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Crawl aborted: {0}")]
    Fatal(FatalReason),

    #[error("Crawl stopped by user")]
    Cancelled,

    #[error("Partitioning failed: {remaining} cells still unresolved after all retries")]
    PartitionFailed { remaining: usize },

    #[error("Task has not been saved yet")]
    Unsaved,

    #[error("Job store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CrawlError>;
