use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::api::{Extension, FatalReason, Poi, PoiPage, PoiQuery, RetryReason};
use crate::crawler::error::CrawlError;
use crate::output::OutputField;
use crate::quota::UserType;
use crate::region::{Boundary, BoundingBox};

/// Lifecycle of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    UnStarted,
    Preprocessing,
    Processing,
    Success,
    SomeFailed,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::UnStarted => "un_started",
            TaskStatus::Preprocessing => "preprocessing",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::SomeFailed => "some_failed",
            TaskStatus::Paused => "paused",
        }
    }

    /// Whether partitioning still has to run (again) before crawling
    pub fn needs_preprocessing(&self) -> bool {
        matches!(self, TaskStatus::UnStarted | TaskStatus::Preprocessing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "un_started" => TaskStatus::UnStarted,
            "preprocessing" => TaskStatus::Preprocessing,
            "processing" => TaskStatus::Processing,
            "success" => TaskStatus::Success,
            "some_failed" => TaskStatus::SomeFailed,
            "paused" => TaskStatus::Paused,
            other => anyhow::bail!("Unknown task status: {}", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    UnStarted,
    Processing,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::UnStarted => "un_started",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "un_started" => JobStatus::UnStarted,
            "processing" => JobStatus::Processing,
            "success" => JobStatus::Success,
            "failed" => JobStatus::Failed,
            other => anyhow::bail!("Unknown job status: {}", other),
        })
    }
}

/// Classification attached to a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "reason", rename_all = "snake_case")]
pub enum JobError {
    Retryable(RetryReason),
    Fatal(FatalReason),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Retryable(reason) => write!(f, "{}", reason),
            JobError::Fatal(reason) => write!(f, "fatal: {}", reason),
        }
    }
}

/// One user-initiated crawl over a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the job store on first save
    pub id: Option<i64>,
    pub boundary: Boundary,
    /// `|`-joined keywords
    pub keywords: String,
    /// `|`-joined type codes
    pub types: String,
    pub keys: Vec<String>,
    pub user_type: UserType,
    pub thread_num: u32,
    pub threshold: u32,
    pub output_fields: Vec<OutputField>,
    pub status: TaskStatus,

    pub request_expected_times: u64,
    pub request_actual_times: u64,
    pub poi_expected_count: u64,
    pub poi_actual_count: u64,
    pub total_executed_times: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        boundary: Boundary,
        keywords: String,
        types: String,
        keys: Vec<String>,
        user_type: UserType,
        thread_num: u32,
        threshold: u32,
        output_fields: Vec<OutputField>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            boundary,
            keywords,
            types,
            keys,
            user_type,
            thread_num,
            threshold,
            output_fields,
            status: TaskStatus::UnStarted,
            request_expected_times: 0,
            request_actual_times: 0,
            poi_expected_count: 0,
            poi_actual_count: 0,
            total_executed_times: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Result<i64, CrawlError> {
        self.id.ok_or(CrawlError::Unsaved)
    }

    /// Detail level needed by the requested output fields
    pub fn extension(&self) -> Extension {
        if self.output_fields.iter().any(|f| f.requires_all_extension()) {
            Extension::All
        } else {
            Extension::Base
        }
    }

    /// Containment predicate for collected results
    pub fn filter(&self) -> impl Fn(&Poi) -> bool + '_ {
        move |poi: &Poi| self.boundary.contains_poi(poi)
    }

    pub fn count_request(&mut self) {
        self.request_actual_times += 1;
    }

    pub fn count_pois(&mut self, pois: usize) {
        self.poi_actual_count += pois as u64;
    }

    /// Forget everything measured by a previous preprocessing pass
    pub fn reset_counters(&mut self) {
        self.request_expected_times = 0;
        self.request_actual_times = 0;
        self.poi_expected_count = 0;
        self.poi_actual_count = 0;
    }
}

/// One page-sized query against one rectangular cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the job store on first save
    pub id: Option<i64>,
    pub task_id: i64,
    pub bounds: BoundingBox,
    pub keywords: String,
    pub types: String,
    pub page: u32,
    pub size: u32,
    /// Number of quadrant splits between the task region and this cell
    pub depth: u32,
    pub status: JobStatus,
    pub error: Option<JobError>,
    /// Only present in memory after a successful fetch
    #[serde(skip)]
    pub result: Option<PoiPage>,
    pub request_actual_times: u32,
    pub poi_actual_count: u32,
    pub poi_expected_count: u32,
}

impl Job {
    /// Page-1 count query for a cell
    pub fn first_page(task: &Task, task_id: i64, bounds: BoundingBox, size: u32, depth: u32) -> Self {
        Self {
            id: None,
            task_id,
            bounds,
            keywords: task.keywords.clone(),
            types: task.types.clone(),
            page: 1,
            size,
            depth,
            status: JobStatus::UnStarted,
            error: None,
            result: None,
            request_actual_times: 0,
            poi_actual_count: 0,
            poi_expected_count: 0,
        }
    }

    /// Another page of the same cell
    pub fn page_of(&self, page: u32, poi_expected_count: u32) -> Self {
        Self {
            id: None,
            page,
            status: JobStatus::UnStarted,
            error: None,
            result: None,
            request_actual_times: 0,
            poi_actual_count: 0,
            poi_expected_count,
            ..self.clone()
        }
    }

    pub fn to_query(&self, key: &str, extension: Extension) -> PoiQuery {
        PoiQuery {
            key: key.to_string(),
            polygon: self.bounds.to_polygon_param(),
            keywords: self.keywords.clone(),
            types: self.types.clone(),
            extension,
            page: self.page,
            page_size: self.size,
        }
    }

    /// Total the service reported for this job's cell
    pub fn reported_count(&self) -> Option<u32> {
        self.result.as_ref().map(|page| page.count)
    }

    pub fn record_success(&mut self, page: PoiPage) {
        self.request_actual_times += 1;
        self.poi_actual_count += page.pois.len() as u32;
        self.status = JobStatus::Success;
        self.error = None;
        self.result = Some(page);
    }

    pub fn record_failure(&mut self, error: JobError) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
    }

    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Success
    }

    /// Short label for log lines
    pub fn describe(&self) -> String {
        match self.id {
            Some(id) => format!("job #{} (page {})", id, self.page),
            None => format!("cell {} (page {})", self.bounds.to_polygon_param(), self.page),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Boundary;

    fn task() -> Task {
        Task::new(
            Boundary::rectangle(BoundingBox::new(0.0, 0.0, 1.0, 1.0), "unit"),
            "cafe".to_string(),
            String::new(),
            vec!["k".to_string()],
            UserType::Individual,
            4,
            100,
            vec![OutputField::Id, OutputField::Name],
        )
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            TaskStatus::UnStarted,
            TaskStatus::Preprocessing,
            TaskStatus::Processing,
            TaskStatus::Success,
            TaskStatus::SomeFailed,
            TaskStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_job_error_serialization() {
        let error = JobError::Retryable(RetryReason::TryOtherKey { key: "A".to_string() });
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(serde_json::from_str::<JobError>(&json).unwrap(), error);
    }

    #[test]
    fn test_extension_follows_fields() {
        let mut task = task();
        assert_eq!(task.extension(), Extension::Base);

        task.output_fields.push(OutputField::BizType);
        assert_eq!(task.extension(), Extension::All);
    }

    #[test]
    fn test_success_updates_job_counters() {
        let task = task();
        let mut job = Job::first_page(&task, 1, task.boundary.bbox, 20, 0);
        job.record_success(PoiPage {
            count: 3,
            pois: vec![Poi::default(), Poi::default()],
        });

        assert!(job.is_finished());
        assert_eq!(job.request_actual_times, 1);
        assert_eq!(job.poi_actual_count, 2);
        assert_eq!(job.reported_count(), Some(3));
    }

    #[test]
    fn test_unsaved_task_has_no_id() {
        assert!(matches!(task().id(), Err(CrawlError::Unsaved)));
    }
}
