//! Diet Assistant Backend Library
//!
//! Access control and abuse prevention: token issuance and revocation,
//! login lockout, and adaptive rate limiting. Exposed as a library so the
//! server binary, the operator CLI and integration tests share one build.

pub mod app;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod limiter;
pub mod middleware;
pub mod shared_store;
pub mod tasks;

pub use app::{AccessContext, AppState};
pub use config::AppConfig;
