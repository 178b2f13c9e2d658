//! Relational store access.
//!
//! Row models and queries for the registry tables (`package`,
//! `package_tag`, `package_version`, `package_version_dependency`, `shard`).
//! The pool is constructed once at startup and passed down explicitly; no
//! module-level engine handle exists anywhere.

pub mod models;
pub mod packages;
pub mod shards;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

/// Create the Postgres connection pool from the application configuration.
///
/// The connection URL is read from the environment variable named in
/// `config.url_env` so that credentials never live in the config file.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = std::env::var(&config.url_env)
        .with_context(|| format!("environment variable {} is not set", config.url_env))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Postgres liveness check failed after connect")?;

    tracing::info!(
        max_connections = config.max_connections,
        "Postgres pool created and verified"
    );

    Ok(pool)
}
