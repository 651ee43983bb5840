pub mod rate_limiter;
pub mod retry_after;
