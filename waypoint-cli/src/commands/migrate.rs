//! Migrate command

use anyhow::{Context, Result};
use waypoint_storage::PostgresStorage;

pub async fn execute(database_url: &str) -> Result<()> {
    let storage = PostgresStorage::new(database_url)
        .await
        .context("Failed to connect to the database")?;
    waypoint_storage::migrations::run_migrations(storage.pool())
        .await
        .context("Failed to apply migrations")?;
    tracing::info!("Migrations applied successfully");

    Ok(())
}
