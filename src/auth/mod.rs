//! Authentication Module
//! Mission: Secure API access with bearer tokens, lockout and session revocation

pub mod api;
pub mod error;
pub mod jwt;
pub mod login_attempts;
pub mod middleware;
pub mod models;
pub mod revocation;
pub mod service;
pub mod user_store;

pub use error::{AccessError, TokenError};
pub use jwt::TokenIssuer;
pub use login_attempts::{LoginAttemptLedger, SqliteLoginAttemptLedger};
pub use middleware::{authenticate, require_admin};
pub use revocation::RevocationStore;
pub use service::{AccessPolicy, AccessService, Session};
pub use user_store::{CredentialStore, SqliteUserStore, SystemSettings};
