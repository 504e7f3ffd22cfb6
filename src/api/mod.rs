pub mod client;
pub mod codes;
pub mod models;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

// Re-export common types
pub use client::AMapClient;
pub use codes::{classify, Classification, FatalReason, RetryReason};
pub use models::{Extension, Poi, PoiPage, PoiQuery, PoiResponse};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Undecodable response body: {0}")]
    Decode(String),
}

/// The external map query service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PoiApi: Send + Sync {
    /// Issue exactly one request and return the raw response
    async fn query(&self, query: &PoiQuery) -> Result<PoiResponse, ApiError>;
}
