//! Relational persistence for SysManage-Server.
//!
//! One PostgreSQL database holds the whole fleet state: hosts and their
//! children, users and roles, the durable message queue, the append-only
//! audit log, tags, vault-backed secret metadata, CVE data, and diagnostics.
//! Repository functions are parameterized sqlx queries; multi-statement flows
//! run inside a caller-owned transaction so a mutation and its audit entry
//! commit or roll back together.

pub mod audit;
pub mod children;
pub mod cve;
pub mod defaults;
pub mod diagnostics;
pub mod error;
pub mod hosts;
pub mod integrations;
pub mod models;
pub mod queue;
pub mod reset_tokens;
pub mod secrets;
pub mod tags;
pub mod users;

pub use error::DbError;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect a pool to the given database URL.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the database is unreachable.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await?;

    Ok(pool)
}
