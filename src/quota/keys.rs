use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyPoolError {
    #[error("Key pool is empty")]
    Exhausted,
}

/// Round-robin pool of API keys.
///
/// The adaptive backoff counter lives under the same lock as the ring, so a
/// run only ever has one place where credential state is mutated.
pub struct KeyPool {
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Rotation order, head is handed out next
    keys: VecDeque<String>,

    /// Number of throttling responses seen during this run; never decreases
    throttle_hits: u32,
}

/// Consistent view of the pool used for pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub live_keys: usize,
    pub throttle_hits: u32,
}

impl KeyPool {
    /// Create a pool; duplicate and blank keys are dropped
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                keys: Self::distinct(keys).into(),
                throttle_hits: 0,
            }),
        }
    }

    /// Trimmed keys in first-seen order, without blanks or repeats
    pub fn distinct(keys: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut distinct: Vec<String> = Vec::new();
        for key in keys {
            let key = key.trim().to_string();
            if !key.is_empty() && !distinct.contains(&key) {
                distinct.push(key);
            }
        }
        distinct
    }

    /// Hand out the head key and requeue it at the tail
    pub async fn acquire(&self) -> Result<String, KeyPoolError> {
        let mut state = self.state.lock().await;
        let key = state.keys.pop_front().ok_or(KeyPoolError::Exhausted)?;
        state.keys.push_back(key.clone());
        Ok(key)
    }

    /// Remove a key for the rest of the run. Returns false if it was already gone.
    pub async fn evict(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.keys.len();
        state.keys.retain(|k| k != key);

        let removed = state.keys.len() != before;
        if removed {
            warn!("Evicted key {} ({} keys left)", key, state.keys.len());
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Count a throttling response and return the new total
    pub async fn record_throttle(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.throttle_hits += 1;
        debug!("Throttle counter raised to {}", state.throttle_hits);
        state.throttle_hits
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        PoolSnapshot {
            live_keys: state.keys.len(),
            throttle_hits: state.throttle_hits,
        }
    }
}
