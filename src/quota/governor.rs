use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Account tier, which fixes the per-key QPS the service grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum UserType {
    Individual,
    CertifiedIndividual,
    Enterprise,
}

impl UserType {
    pub fn qps(&self) -> u32 {
        match self {
            UserType::Individual => 20,
            UserType::CertifiedIndividual => 50,
            UserType::Enterprise => 300,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Individual => "individual",
            UserType::CertifiedIndividual => "certified_individual",
            UserType::Enterprise => "enterprise",
        }
    }
}

impl std::str::FromStr for UserType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "individual" => Ok(UserType::Individual),
            "certified_individual" => Ok(UserType::CertifiedIndividual),
            "enterprise" => Ok(UserType::Enterprise),
            other => anyhow::bail!("Unknown user type: {}", other),
        }
    }
}

/// Upper bound on useful concurrency for the given quota
pub fn clamp_concurrency(configured: u32, qps: u32, keys: usize) -> u32 {
    let ceiling = qps.saturating_mul(keys as u32);
    configured.min(ceiling)
}

/// Computes how long each request must occupy its worker so that the pool
/// as a whole stays under `qps × live keys`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateGovernor {
    qps: u32,
    concurrency: u32,
}

impl RateGovernor {
    /// `concurrency` is the already clamped worker count
    pub fn new(qps: u32, concurrency: u32) -> Self {
        Self { qps, concurrency }
    }

    pub fn qps(&self) -> u32 {
        self.qps
    }

    /// `1000 × workers / (qps × live keys)` milliseconds.
    ///
    /// The pool keeps its size for the whole run, so after an eviction each
    /// worker slows down instead.
    pub fn target_interval(&self, live_keys: usize) -> Duration {
        let capacity = self.qps as f64 * live_keys as f64;
        if capacity <= 0.0 {
            return Duration::ZERO;
        }
        let millis = 1000.0 * (self.concurrency as f64 / capacity);
        Duration::from_secs_f64(millis / 1000.0)
    }

    /// `ln(hits) × 50` milliseconds, nothing until the counter passes 1
    pub fn backoff_penalty(throttle_hits: u32) -> Duration {
        if throttle_hits <= 1 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((throttle_hits as f64).ln() * 50.0 / 1000.0)
    }

    /// Extra sleep owed after a request that took `elapsed`.
    /// A request slower than the target interval owes nothing.
    pub fn pacing_delay(&self, elapsed: Duration, live_keys: usize, throttle_hits: u32) -> Option<Duration> {
        let target = self.target_interval(live_keys);
        if elapsed >= target {
            return None;
        }
        Some(target - elapsed + Self::backoff_penalty(throttle_hits))
    }
}
