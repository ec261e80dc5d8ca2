//! Traffic-shaping primitives.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → mapper.rs (derive token + amount from client ip / host / header)
//!     → rate_limit.rs (per-token token bucket, wait > 0 = reject)
//!     → conn_limit.rs (per-token in-flight ceiling)
//! Request completion:
//!     → conn_limit.rs (release)
//! ```
//!
//! # Design Decisions
//! - One mutex per limiter instance, held only for O(1) bookkeeping
//! - Rejections never mutate state
//! - Fail closed: a request that can not be mapped to a token is refused
//! - Time is injected (`Clock`) so waits are exact in tests

pub mod conn_limit;
pub mod mapper;
pub mod rate_limit;
pub mod token_bucket;

pub use conn_limit::ConnectionLimiter;
pub use mapper::TokenMapper;
pub use rate_limit::TokenLimiter;
pub use token_bucket::{Clock, ManualClock, Rate, SystemClock, TokenBucket};
