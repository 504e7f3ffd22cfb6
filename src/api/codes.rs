use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{PoiPage, PoiResponse};

pub const SUCCESS: u32 = 10000;
pub const DAILY_QUERY_OVER_LIMIT: u32 = 10003;

/// Throttling codes; each hit raises the run's adaptive backoff counter
pub const BACKOFF_CODES: [u32; 6] = [10014, 10015, 10019, 10020, 10021, 10022];

const RETRYABLE_CODES: [u32; 3] = [10004, 10016, 10029];

const FATAL_CODES: [u32; 27] = [
    10001, 10002, 10005, 10006, 10007, 10008, 10009, 10010, 10011, 10012, 10013, 10017, 10026,
    20000, 20001, 20002, 20003, 20011, 20012, 20800, 20801, 20802, 20803, 40000, 40001, 40002,
    40003,
];

/// Why a job may succeed if tried again
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryReason {
    #[error("service busy ({code}: {info})")]
    InfoCode { code: u32, info: String },

    #[error("response is missing required fields")]
    ReturnNullData,

    #[error("request failed: {message}")]
    Transport { message: String },

    #[error("key {key} is out of quota, trying another key")]
    TryOtherKey { key: String },

    #[error("no completion observed before the polling deadline")]
    Timeout,

    #[error("crawl stopped before the job completed")]
    Interrupted,
}

/// Why the whole crawl has to stop
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FatalReason {
    #[error("service rejected the request ({code}: {info})")]
    InfoCode { code: u32, info: String },

    #[error("unknown web error ({code}: {info})")]
    UnknownWebError { code: u32, info: String },

    #[error("every key in the pool has run out of quota")]
    KeyPoolExhausted,

    #[error("the crawl was stopped")]
    Stopped,

    #[error("cell at split depth {depth} still reports {count} items; threshold cannot be satisfied")]
    CannotSatisfyThreshold { depth: u32, count: u32 },
}

/// Classification of a single response, before key eviction is resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Success(PoiPage),
    Retryable { reason: RetryReason, backoff: bool },
    KeyExhausted,
    Fatal(FatalReason),
}

/// Map a raw response onto the outcome classes the crawler acts upon
pub fn classify(response: PoiResponse) -> Classification {
    let code = response.info_code();

    if code != Some(SUCCESS) {
        let code = match code {
            Some(code) if response.status.is_some() && response.info.is_some() => code,
            _ => {
                return Classification::Retryable {
                    reason: RetryReason::ReturnNullData,
                    backoff: false,
                }
            }
        };
        let info = response.info.unwrap_or_default();

        if code == DAILY_QUERY_OVER_LIMIT {
            return Classification::KeyExhausted;
        }
        if FATAL_CODES.contains(&code) {
            return Classification::Fatal(FatalReason::InfoCode { code, info });
        }
        if BACKOFF_CODES.contains(&code) {
            return Classification::Retryable {
                reason: RetryReason::InfoCode { code, info },
                backoff: true,
            };
        }
        if RETRYABLE_CODES.contains(&code) {
            return Classification::Retryable {
                reason: RetryReason::InfoCode { code, info },
                backoff: false,
            };
        }
        return Classification::Fatal(FatalReason::UnknownWebError { code, info });
    }

    let count = response.total();
    match (count, response.pois, response.status) {
        (Some(count), Some(pois), Some(_)) => Classification::Success(PoiPage { count, pois }),
        _ => Classification::Retryable {
            reason: RetryReason::ReturnNullData,
            backoff: false,
        },
    }
}
