use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::types::Json;
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::{collected_pois, JobStore};
use crate::api::Poi;
use crate::crawler::task::{Job, JobError, JobStatus, Task, TaskStatus};
use crate::output::OutputField;
use crate::quota::UserType;
use crate::region::{Boundary, BoundingBox};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        boundary TEXT NOT NULL,
        keywords TEXT NOT NULL,
        types TEXT NOT NULL,
        keys TEXT NOT NULL,
        user_type TEXT NOT NULL,
        thread_num INTEGER NOT NULL,
        threshold INTEGER NOT NULL,
        output_fields TEXT NOT NULL,
        status TEXT NOT NULL,
        request_expected_times INTEGER NOT NULL,
        request_actual_times INTEGER NOT NULL,
        poi_expected_count INTEGER NOT NULL,
        poi_actual_count INTEGER NOT NULL,
        total_executed_times INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        min_lng REAL NOT NULL,
        min_lat REAL NOT NULL,
        max_lng REAL NOT NULL,
        max_lat REAL NOT NULL,
        keywords TEXT NOT NULL,
        types TEXT NOT NULL,
        page INTEGER NOT NULL,
        size INTEGER NOT NULL,
        depth INTEGER NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        request_actual_times INTEGER NOT NULL,
        poi_actual_count INTEGER NOT NULL,
        poi_expected_count INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pois (
        task_id INTEGER NOT NULL,
        job_id INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (job_id, seq)
    )",
    "CREATE INDEX IF NOT EXISTS jobs_by_task ON jobs (task_id, status)",
];

/// SQLite implementation of JobStore
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            if let Some(path) = database_url.strip_prefix("sqlite://") {
                if let Some(parent) = Path::new(path).parent() {
                    std::fs::create_dir_all(parent)
                        .context(format!("Failed to create directory: {}", parent.display()))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .context(format!("Invalid SQLite URL: {}", database_url))?
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context(format!("Failed to connect to SQLite: {}", database_url))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        debug!("Connected to SQLite job store at {}", database_url);

        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create job store schema")?;
        }
        Ok(())
    }

    async fn write_task(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
        let id = task.id()?;
        sqlx::query(
            "UPDATE tasks SET
                status = ?, keys = ?, thread_num = ?,
                request_expected_times = ?, request_actual_times = ?,
                poi_expected_count = ?, poi_actual_count = ?,
                total_executed_times = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(task.status.as_str())
        .bind(Json(&task.keys))
        .bind(task.thread_num)
        .bind(task.request_expected_times as i64)
        .bind(task.request_actual_times as i64)
        .bind(task.poi_expected_count as i64)
        .bind(task.poi_actual_count as i64)
        .bind(task.total_executed_times as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await
        .context(format!("Failed to update task {}", id))?;
        Ok(())
    }

    async fn write_jobs(conn: &mut SqliteConnection, jobs: &[Job]) -> Result<()> {
        for job in jobs {
            let id = job.id.context("Cannot update a job that was never saved")?;
            sqlx::query(
                "UPDATE jobs SET
                    status = ?, error = ?, request_actual_times = ?,
                    poi_actual_count = ?, poi_expected_count = ?
                 WHERE id = ?",
            )
            .bind(job.status.as_str())
            .bind(job.error.as_ref().map(Json))
            .bind(job.request_actual_times)
            .bind(job.poi_actual_count)
            .bind(job.poi_expected_count)
            .bind(id)
            .execute(&mut *conn)
            .await
            .context(format!("Failed to update job {}", id))?;
        }
        Ok(())
    }

    async fn write_pois(conn: &mut SqliteConnection, task_id: i64, jobs: &[Job]) -> Result<()> {
        for (job, seq, poi) in collected_pois(jobs) {
            let job_id = job.id.context("Cannot store results of a job that was never saved")?;
            sqlx::query(
                "INSERT INTO pois (task_id, job_id, seq, data) VALUES (?, ?, ?, ?)
                 ON CONFLICT (job_id, seq) DO UPDATE SET data = excluded.data",
            )
            .bind(task_id)
            .bind(job_id)
            .bind(seq as i64)
            .bind(Json(poi))
            .execute(&mut *conn)
            .await
            .context("Failed to store POI")?;
        }
        Ok(())
    }

    fn task_from_row(row: &SqliteRow) -> Result<Task> {
        let boundary: Json<Boundary> = row.try_get("boundary")?;
        let keys: Json<Vec<String>> = row.try_get("keys")?;
        let output_fields: Json<Vec<OutputField>> = row.try_get("output_fields")?;
        let user_type: String = row.try_get("user_type")?;
        let status: String = row.try_get("status")?;

        Ok(Task {
            id: Some(row.try_get("id")?),
            boundary: boundary.0,
            keywords: row.try_get("keywords")?,
            types: row.try_get("types")?,
            keys: keys.0,
            user_type: user_type.parse::<UserType>()?,
            thread_num: row.try_get("thread_num")?,
            threshold: row.try_get("threshold")?,
            output_fields: output_fields.0,
            status: status.parse::<TaskStatus>()?,
            request_expected_times: row.try_get::<i64, _>("request_expected_times")? as u64,
            request_actual_times: row.try_get::<i64, _>("request_actual_times")? as u64,
            poi_expected_count: row.try_get::<i64, _>("poi_expected_count")? as u64,
            poi_actual_count: row.try_get::<i64, _>("poi_actual_count")? as u64,
            total_executed_times: row.try_get::<i64, _>("total_executed_times")? as u64,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn job_from_row(row: &SqliteRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let error: Option<Json<JobError>> = row.try_get("error")?;

        Ok(Job {
            id: Some(row.try_get("id")?),
            task_id: row.try_get("task_id")?,
            bounds: BoundingBox::new(
                row.try_get("min_lng")?,
                row.try_get("min_lat")?,
                row.try_get("max_lng")?,
                row.try_get("max_lat")?,
            ),
            keywords: row.try_get("keywords")?,
            types: row.try_get("types")?,
            page: row.try_get("page")?,
            size: row.try_get("size")?,
            depth: row.try_get("depth")?,
            status: status.parse::<JobStatus>()?,
            error: error.map(|e| e.0),
            result: None,
            request_actual_times: row.try_get("request_actual_times")?,
            poi_actual_count: row.try_get("poi_actual_count")?,
            poi_expected_count: row.try_get("poi_expected_count")?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn save_task(&self, task: &mut Task) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO tasks (
                boundary, keywords, types, keys, user_type, thread_num, threshold,
                output_fields, status, request_expected_times, request_actual_times,
                poi_expected_count, poi_actual_count, total_executed_times, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Json(&task.boundary))
        .bind(&task.keywords)
        .bind(&task.types)
        .bind(Json(&task.keys))
        .bind(task.user_type.as_str())
        .bind(task.thread_num)
        .bind(task.threshold)
        .bind(Json(&task.output_fields))
        .bind(task.status.as_str())
        .bind(task.request_expected_times as i64)
        .bind(task.request_actual_times as i64)
        .bind(task.poi_expected_count as i64)
        .bind(task.poi_actual_count as i64)
        .bind(task.total_executed_times as i64)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to save task")?;

        task.id = Some(result.last_insert_rowid());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::write_task(&mut conn, task).await
    }

    async fn load_task(&self, task_id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to load task {}", task_id))?;

        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn save_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs.iter_mut() {
            let result = sqlx::query(
                "INSERT INTO jobs (
                    task_id, min_lng, min_lat, max_lng, max_lat, keywords, types, page, size,
                    depth, status, error, request_actual_times, poi_actual_count, poi_expected_count
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(job.task_id)
            .bind(job.bounds.left)
            .bind(job.bounds.bottom)
            .bind(job.bounds.right)
            .bind(job.bounds.top)
            .bind(&job.keywords)
            .bind(&job.types)
            .bind(job.page)
            .bind(job.size)
            .bind(job.depth)
            .bind(job.status.as_str())
            .bind(job.error.as_ref().map(Json))
            .bind(job.request_actual_times)
            .bind(job.poi_actual_count)
            .bind(job.poi_expected_count)
            .execute(&mut *tx)
            .await
            .context("Failed to save job")?;

            job.id = Some(result.last_insert_rowid());
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_jobs(&mut tx, jobs).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_pois(&self, task_id: i64, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_pois(&mut tx, task_id, jobs).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_unfinished_jobs(&self, task_id: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE task_id = ? AND status != ? ORDER BY id")
            .bind(task_id)
            .bind(JobStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await
            .context(format!("Failed to list jobs of task {}", task_id))?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn count_jobs(&self, task_id: i64) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn count_unfinished_jobs(&self, task_id: i64) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE task_id = ? AND status != ?")
                .bind(task_id)
                .bind(JobStatus::Success.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn list_pois(&self, task_id: i64) -> Result<Vec<Poi>> {
        let rows: Vec<Json<Poi>> =
            sqlx::query_scalar("SELECT data FROM pois WHERE task_id = ? ORDER BY job_id, seq")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await
                .context(format!("Failed to list POIs of task {}", task_id))?;

        Ok(rows.into_iter().map(|poi| poi.0).collect())
    }

    async fn clear_task_data(&self, task_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pois WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn flush(&self, task: &Task, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_task(&mut tx, task).await?;
        Self::write_jobs(&mut tx, jobs).await?;
        Self::write_pois(&mut tx, task.id()?, jobs).await?;
        tx.commit().await.context("Failed to commit flush")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PoiPage, RetryReason};
    use crate::storage::MemoryJobStore;

    async fn stores() -> Vec<Box<dyn JobStore>> {
        vec![
            Box::new(SqliteJobStore::connect("sqlite::memory:").await.unwrap()),
            Box::new(MemoryJobStore::new()),
        ]
    }

    fn task() -> Task {
        Task::new(
            Boundary::rectangle(BoundingBox::new(116.0, 39.5, 116.5, 40.0), "beijing"),
            "cafe|tea".to_string(),
            "050000".to_string(),
            vec!["A".to_string(), "B".to_string()],
            UserType::CertifiedIndividual,
            8,
            850,
            vec![OutputField::Id, OutputField::Name, OutputField::Location],
        )
    }

    fn poi(id: &str) -> Poi {
        Poi {
            id: Some(id.to_string()),
            name: Some(format!("poi {}", id)),
            location: Some("116.1,39.6".to_string()),
            ..Default::default()
        }
    }

    async fn saved_jobs(store: &dyn JobStore, task: &Task, pages: u32) -> Vec<Job> {
        let task_id = task.id.unwrap();
        let first = Job::first_page(task, task_id, task.boundary.bbox, 20, 2);
        let mut jobs: Vec<Job> = (1..=pages).map(|page| first.page_of(page, 20)).collect();
        store.save_jobs(&mut jobs).await.unwrap();
        jobs
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        for store in stores().await {
            let mut task = task();
            store.save_task(&mut task).await.unwrap();
            assert!(task.id.is_some());

            task.status = TaskStatus::Processing;
            task.request_actual_times = 12;
            task.keys = vec!["REPLACED".to_string()];
            store.update_task(&task).await.unwrap();

            let loaded = store.load_task(task.id.unwrap()).await.unwrap().unwrap();
            assert_eq!(loaded.status, TaskStatus::Processing);
            assert_eq!(loaded.request_actual_times, 12);
            assert_eq!(loaded.boundary, task.boundary);
            assert_eq!(loaded.keys, vec!["REPLACED".to_string()]);
            assert_eq!(loaded.output_fields, task.output_fields);
            assert_eq!(loaded.user_type, UserType::CertifiedIndividual);

            assert!(store.load_task(999).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_unfinished_jobs_and_counts() {
        for store in stores().await {
            let mut task = task();
            store.save_task(&mut task).await.unwrap();
            let task_id = task.id.unwrap();

            let mut jobs = saved_jobs(store.as_ref(), &task, 3).await;
            jobs[0].record_success(PoiPage { count: 45, pois: vec![poi("a")] });
            jobs[1].record_failure(JobError::Retryable(RetryReason::Timeout));
            store.flush(&task, &jobs).await.unwrap();

            assert_eq!(store.count_jobs(task_id).await.unwrap(), 3);
            assert_eq!(store.count_unfinished_jobs(task_id).await.unwrap(), 2);

            let unfinished = store.list_unfinished_jobs(task_id).await.unwrap();
            assert_eq!(unfinished.len(), 2);
            assert_eq!(unfinished[0].page, 2);
            assert_eq!(unfinished[0].error, Some(JobError::Retryable(RetryReason::Timeout)));
            assert_eq!(unfinished[0].bounds, task.boundary.bbox);
            assert_eq!(unfinished[0].depth, 2);
        }
    }

    #[tokio::test]
    async fn test_repeated_flush_is_idempotent() {
        for store in stores().await {
            let mut task = task();
            store.save_task(&mut task).await.unwrap();
            let task_id = task.id.unwrap();

            let mut jobs = saved_jobs(store.as_ref(), &task, 2).await;
            jobs[0].record_success(PoiPage { count: 22, pois: vec![poi("a"), poi("b")] });
            jobs[1].record_success(PoiPage { count: 22, pois: vec![poi("c")] });

            store.flush(&task, &jobs).await.unwrap();
            let once = (
                store.count_unfinished_jobs(task_id).await.unwrap(),
                store.list_pois(task_id).await.unwrap(),
            );

            // A crash between the write and its acknowledgement replays the same batch
            store.flush(&task, &jobs).await.unwrap();
            let twice = (
                store.count_unfinished_jobs(task_id).await.unwrap(),
                store.list_pois(task_id).await.unwrap(),
            );

            assert_eq!(once, twice);
            assert_eq!(twice.1.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_clear_task_data_keeps_other_tasks() {
        for store in stores().await {
            let mut first = task();
            let mut second = task();
            store.save_task(&mut first).await.unwrap();
            store.save_task(&mut second).await.unwrap();

            let mut jobs = saved_jobs(store.as_ref(), &first, 1).await;
            jobs[0].record_success(PoiPage { count: 1, pois: vec![poi("a")] });
            store.flush(&first, &jobs).await.unwrap();
            saved_jobs(store.as_ref(), &second, 2).await;

            store.clear_task_data(first.id.unwrap()).await.unwrap();

            assert_eq!(store.count_jobs(first.id.unwrap()).await.unwrap(), 0);
            assert!(store.list_pois(first.id.unwrap()).await.unwrap().is_empty());
            assert_eq!(store.count_jobs(second.id.unwrap()).await.unwrap(), 2);
            assert!(store.load_task(first.id.unwrap()).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_unsaved_jobs_cannot_be_updated() {
        for store in stores().await {
            let mut task = task();
            store.save_task(&mut task).await.unwrap();
            let job = Job::first_page(&task, task.id.unwrap(), task.boundary.bbox, 20, 0);

            assert!(store.update_jobs(&[job]).await.is_err());
        }
    }
}
