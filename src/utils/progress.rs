use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

/// Final accounting of a task run, emitted once per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: i64,
    pub status: String,
    pub completed_jobs: usize,
    pub total_jobs: usize,
    pub pois_collected: usize,
}

/// Events written by the crawl engine for whatever front end is listening
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Message(String),
    Warning(String),
    Summary(TaskSummary),
}

/// Append-only progress stream.
///
/// Sending never blocks and never fails the caller: if the receiving side is
/// gone the event is still mirrored to `tracing` and otherwise dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    /// Create a sink together with the receiver a front end drains
    pub fn channel() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn message(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        let _ = self.tx.send(ProgressEvent::Message(text));
    }

    pub fn warning(&self, text: impl Into<String>) {
        let text = text.into();
        warn!("{}", text);
        let _ = self.tx.send(ProgressEvent::Warning(text));
    }

    pub fn summary(&self, summary: TaskSummary) {
        info!(
            task_id = summary.task_id,
            status = %summary.status,
            "Task finished: {}/{} jobs done, {} POIs",
            summary.completed_jobs,
            summary.total_jobs,
            summary.pois_collected
        );
        let _ = self.tx.send(ProgressEvent::Summary(summary));
    }
}

/// Collect everything currently buffered in a receiver
#[cfg(test)]
pub fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
