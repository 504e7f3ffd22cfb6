use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{collected_pois, JobStore};
use crate::api::Poi;
use crate::crawler::task::{Job, Task};

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<i64, Task>,
    jobs: BTreeMap<i64, Job>,
    /// Keyed on (job id, position on page)
    pois: BTreeMap<(i64, usize), (i64, Poi)>,
    next_task_id: i64,
    next_job_id: i64,
}

/// Process-local job store
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    flushes: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `flush` calls so far
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory job store lock poisoned"))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_task(&self, task: &mut Task) -> Result<()> {
        let mut state = self.state()?;
        state.next_task_id += 1;
        let id = state.next_task_id;
        task.id = Some(id);
        state.tasks.insert(id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let id = task.id()?;
        let mut state = self.state()?;
        let mut stored = task.clone();
        stored.updated_at = Utc::now();
        state.tasks.insert(id, stored);
        Ok(())
    }

    async fn load_task(&self, task_id: i64) -> Result<Option<Task>> {
        Ok(self.state()?.tasks.get(&task_id).cloned())
    }

    async fn save_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        let mut state = self.state()?;
        for job in jobs.iter_mut() {
            state.next_job_id += 1;
            let id = state.next_job_id;
            job.id = Some(id);
            let mut stored = job.clone();
            stored.result = None;
            state.jobs.insert(id, stored);
        }
        Ok(())
    }

    async fn update_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut state = self.state()?;
        for job in jobs {
            let id = job.id.context("Cannot update a job that was never saved")?;
            let mut stored = job.clone();
            stored.result = None;
            state.jobs.insert(id, stored);
        }
        Ok(())
    }

    async fn save_pois(&self, task_id: i64, jobs: &[Job]) -> Result<()> {
        let mut state = self.state()?;
        for (job, seq, poi) in collected_pois(jobs) {
            let job_id = job.id.context("Cannot store results of a job that was never saved")?;
            state.pois.insert((job_id, seq), (task_id, poi.clone()));
        }
        Ok(())
    }

    async fn list_unfinished_jobs(&self, task_id: i64) -> Result<Vec<Job>> {
        Ok(self
            .state()?
            .jobs
            .values()
            .filter(|job| job.task_id == task_id && !job.is_finished())
            .cloned()
            .collect())
    }

    async fn count_jobs(&self, task_id: i64) -> Result<usize> {
        Ok(self.state()?.jobs.values().filter(|job| job.task_id == task_id).count())
    }

    async fn count_unfinished_jobs(&self, task_id: i64) -> Result<usize> {
        Ok(self.list_unfinished_jobs(task_id).await?.len())
    }

    async fn list_pois(&self, task_id: i64) -> Result<Vec<Poi>> {
        Ok(self
            .state()?
            .pois
            .values()
            .filter(|(owner, _)| *owner == task_id)
            .map(|(_, poi)| poi.clone())
            .collect())
    }

    async fn clear_task_data(&self, task_id: i64) -> Result<()> {
        let mut state = self.state()?;
        state.jobs.retain(|_, job| job.task_id != task_id);
        state.pois.retain(|_, (owner, _)| *owner != task_id);
        Ok(())
    }

    async fn flush(&self, task: &Task, jobs: &[Job]) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.update_task(task).await?;
        self.update_jobs(jobs).await?;
        self.save_pois(task.id()?, jobs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputField;
    use crate::quota::UserType;
    use crate::region::{Boundary, BoundingBox};

    fn task() -> Task {
        Task::new(
            Boundary::rectangle(BoundingBox::new(0.0, 0.0, 1.0, 1.0), "unit"),
            "cafe".to_string(),
            String::new(),
            vec!["A".to_string()],
            UserType::Individual,
            1,
            100,
            vec![OutputField::Id],
        )
    }

    #[tokio::test]
    async fn test_ids_are_assigned_in_sequence() {
        let store = MemoryJobStore::new();
        let mut first = task();
        let mut second = task();
        store.save_task(&mut first).await.unwrap();
        store.save_task(&mut second).await.unwrap();
        assert_eq!((first.id, second.id), (Some(1), Some(2)));

        let leaf = Job::first_page(&first, 1, first.boundary.bbox, 20, 0);
        let mut jobs = vec![leaf.page_of(1, 20), leaf.page_of(2, 20)];
        store.save_jobs(&mut jobs).await.unwrap();

        assert_eq!(jobs.iter().map(|job| job.id).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
        assert_eq!(store.load_task(2).await.unwrap().unwrap().id, Some(2));
        assert_eq!(store.count_jobs(1).await.unwrap(), 2);
    }
}
