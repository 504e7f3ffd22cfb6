pub mod context;
pub mod controller;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod pages;
pub mod partition;
pub mod pool;
pub mod retry;
pub mod task;

// Re-export common types
pub use context::{RunContext, StopHandle};
pub use controller::{CrawlerController, RunReport};
pub use error::CrawlError;
pub use task::{Job, JobStatus, Task, TaskStatus};
