pub mod governor;
pub mod keys;

// Re-export common types
pub use governor::{clamp_concurrency, RateGovernor, UserType};
pub use keys::{KeyPool, KeyPoolError, PoolSnapshot};
