//! Create User
//!
//! Operator tool for adding accounts directly to the credential store,
//! bypassing the self-service registration flag.
//!
//! Usage:
//!   create-user --username alice --password 'correct-horse' [--role admin]
//!
//! Reads the same environment as the server (DATABASE_PATH, JWT_SECRET, ...).

use anyhow::{bail, Context, Result};
use clap::Parser;
use diet_assistant_backend::{
    app::build_service,
    auth::{
        models::UserRole,
        revocation::{MemoryRevocationStore, RevocationStore},
        SqliteLoginAttemptLedger,
    },
    clock::system_clock,
    db::Database,
    AppConfig,
};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "create-user")]
#[command(about = "Create a diet assistant account")]
struct Args {
    /// Login name (3-50 letters and digits)
    #[arg(short, long)]
    username: String,

    /// Initial password
    #[arg(short, long, env = "CREATE_USER_PASSWORD")]
    password: String,

    /// Optional email address
    #[arg(short, long)]
    email: Option<String>,

    /// Role (admin or user). Without it the first account becomes admin.
    #[arg(short, long)]
    role: Option<String>,

    /// Override DATABASE_PATH
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let role = match args.role.as_deref() {
        None => None,
        Some(raw) => match UserRole::parse(raw) {
            Some(role) => Some(role),
            None => bail!("unknown role '{raw}', expected admin or user"),
        },
    };

    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = args.database {
        config.database_path = path;
    }

    let clock = system_clock();
    let db = Database::open(&config.database_path)?;
    let attempts = Arc::new(SqliteLoginAttemptLedger::new(db.clone(), clock.clone()));
    let revocations = Arc::new(RevocationStore::InProcess(MemoryRevocationStore::new(
        clock.clone(),
    )));
    let service = build_service(&config, db, attempts, revocations, clock);

    let user = service
        .create_account(&args.username, &args.password, args.email, role)
        .await
        .context("Failed to create user")?;

    info!(
        "✅ Created user {} (id {}, role {})",
        user.username,
        user.id,
        user.role.as_str()
    );
    Ok(())
}
