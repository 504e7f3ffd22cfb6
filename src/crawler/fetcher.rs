use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::api::{classify, Classification, FatalReason, PoiApi, PoiPage, RetryReason};
use crate::crawler::context::RunContext;
use crate::crawler::task::Job;

/// Result of executing one job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Retryable(RetryReason),
    Fatal(FatalReason),
}

/// Executes one page query: key rotation, pacing and classification
pub struct Fetcher {
    api: Arc<dyn PoiApi>,
    ctx: Arc<RunContext>,
}

impl Fetcher {
    pub fn new(api: Arc<dyn PoiApi>, ctx: Arc<RunContext>) -> Self {
        Self { api, ctx }
    }

    /// Issue exactly one request for `job` and classify the response.
    ///
    /// Returns only after the pacing delay owed for this request has elapsed.
    pub async fn fetch(&self, job: &Job) -> Outcome<PoiPage> {
        if !self.ctx.is_running() {
            return Outcome::Fatal(FatalReason::Stopped);
        }

        let key = match self.ctx.keys.acquire().await {
            Ok(key) => key,
            Err(_) => return Outcome::Fatal(FatalReason::KeyPoolExhausted),
        };

        let query = job.to_query(&key, self.ctx.extension);
        let started = Instant::now();
        let response = self.api.query(&query).await;
        let elapsed = started.elapsed();

        let classification = match response {
            Ok(response) => classify(response),
            Err(e) => Classification::Retryable {
                reason: RetryReason::Transport { message: e.to_string() },
                backoff: false,
            },
        };

        if let Classification::Retryable { backoff: true, .. } = &classification {
            self.ctx.keys.record_throttle().await;
        }

        self.pace(elapsed).await;
        self.resolve(classification, key).await
    }

    async fn pace(&self, elapsed: std::time::Duration) {
        let snapshot = self.ctx.keys.snapshot().await;
        if let Some(delay) =
            self.ctx
                .governor
                .pacing_delay(elapsed, snapshot.live_keys, snapshot.throttle_hits)
        {
            debug!("Pacing for {:?}", delay);
            sleep(delay).await;
        }
    }

    async fn resolve(&self, classification: Classification, key: String) -> Outcome<PoiPage> {
        match classification {
            Classification::Success(page) => Outcome::Success(page),
            Classification::Retryable { reason, .. } => Outcome::Retryable(reason),
            Classification::Fatal(reason) => Outcome::Fatal(reason),
            Classification::KeyExhausted => {
                if self.ctx.keys.evict(&key).await {
                    self.ctx
                        .progress
                        .warning(format!("Key {} has used up its daily quota and was removed", key));
                }
                if self.ctx.keys.is_empty().await {
                    Outcome::Fatal(FatalReason::KeyPoolExhausted)
                } else {
                    Outcome::Retryable(RetryReason::TryOtherKey { key })
                }
            }
        }
    }
}
