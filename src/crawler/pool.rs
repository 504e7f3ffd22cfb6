use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::api::PoiPage;
use crate::crawler::context::RunContext;
use crate::crawler::fetcher::{Fetcher, Outcome};
use crate::crawler::task::Job;

type Delivery = (usize, Job, Outcome<PoiPage>);

/// What the control loop observed when asking for the next result
#[derive(Debug)]
pub enum Completion {
    Done { job: Job, outcome: Outcome<PoiPage> },
    /// No result arrived within the whole polling window
    TimedOut,
    /// The run was stopped while waiting
    Cancelled,
}

/// Bounded set of workers executing jobs through a shared fetcher.
///
/// Results come back in completion order through a single queue, so the
/// owner of the pool is the only place that mutates job and task state.
pub struct WorkerPool {
    fetcher: Arc<Fetcher>,
    ctx: Arc<RunContext>,
    permits: Arc<Semaphore>,
    tx: UnboundedSender<Delivery>,
    rx: UnboundedReceiver<Delivery>,
    /// Submitted jobs whose result has not been observed yet, by submission order
    pending: BTreeMap<usize, Job>,
    next_slot: usize,
}

impl WorkerPool {
    pub fn new(fetcher: Arc<Fetcher>, ctx: Arc<RunContext>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(ctx.concurrency() as usize)),
            fetcher,
            ctx,
            tx,
            rx,
            pending: BTreeMap::new(),
            next_slot: 0,
        }
    }

    /// Queue a job; refused once the run has been stopped
    pub fn submit(&mut self, job: Job) -> bool {
        if !self.ctx.is_running() || self.permits.is_closed() {
            return false;
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        self.pending.insert(slot, job.clone());

        let permits = self.permits.clone();
        let fetcher = self.fetcher.clone();
        let ctx = self.ctx.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if !ctx.is_running() {
                return;
            }
            let outcome = fetcher.fetch(&job).await;
            let _ = tx.send((slot, job, outcome));
        });

        true
    }

    /// Wait for the next result in slices of the poll interval
    pub async fn next_completion(&mut self) -> Completion {
        let interval = self.ctx.settings.poll_interval();

        for attempt in 0..self.ctx.settings.poll_attempts {
            if !self.ctx.is_running() {
                self.shutdown();
                return Completion::Cancelled;
            }

            match timeout(interval, self.rx.recv()).await {
                Ok(Some((slot, job, outcome))) => {
                    self.pending.remove(&slot);
                    return Completion::Done { job, outcome };
                }
                // The pool holds a sender, so the queue never closes while it lives
                Ok(None) => break,
                Err(_) => debug!("No completion yet (attempt {})", attempt + 1),
            }
        }

        Completion::TimedOut
    }

    /// Jobs submitted but never observed, in submission order
    pub fn take_pending(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stop accepting work; queued jobs that never got a worker are dropped
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.permits.close();
    }
}
