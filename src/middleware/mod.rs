//! Middleware for observability and rate limiting.
//!
//! This module provides:
//! - Request logging with latency tracking
//! - Rate limiting per user or client address
//! - Client address resolution behind proxies

pub mod client_ip;
pub mod logging;
pub mod rate_limit;

pub use client_ip::ClientIp;
pub use logging::request_logging;
pub use rate_limit::rate_limit;
