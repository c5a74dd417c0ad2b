use sqlx::{migrate::MigrateDatabase, SqlitePool};
use std::path::Path;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Versioned schema migrations, applied in order.
const MIGRATIONS: &[(i32, &str, &str)] = &[(1, "001_initial", include_str!("../../migrations/001_initial.sql"))];

/// Database connection manager with migration support
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and run migrations
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if !db_path.exists() {
            info!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&format!("sqlite:{}", db_path.display())).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&database_url).await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Get a handle to the database connection pool
    pub fn get_pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        let current_version = self.get_database_version().await?;
        debug!("Current database version: {}", current_version);

        for (number, name, sql) in MIGRATIONS {
            if *number <= current_version {
                debug!("Skipping migration {} (already applied)", name);
                continue;
            }

            info!("Applying migration: {}", name);
            for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                    error!("Failed to apply migration {}: {}", name, e);
                    Error::Database(e)
                })?;
            }

            self.update_database_version(*number).await?;
            info!("Successfully applied migration: {}", name);
        }

        info!("All migrations completed successfully");
        Ok(())
    }

    async fn get_database_version(&self) -> Result<i32> {
        let table_exists = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'")
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> = sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'database_version'")
            .fetch_optional(&self.pool)
            .await?;

        match version {
            Some(version_str) => version_str.parse().map_err(|e| {
                Error::Database(sqlx::Error::Decode(format!("Invalid database version: {}", e).into()))
            }),
            None => Ok(0),
        }
    }

    async fn update_database_version(&self, version: i32) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES ('database_version', ?, unixepoch())",
        )
        .bind(version.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    /// Verify database integrity
    pub async fn verify_integrity(&self) -> Result<bool> {
        let integrity_result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;

        let is_ok = integrity_result == "ok";
        if !is_ok {
            error!("Database integrity check failed: {}", integrity_result);
        }

        Ok(is_ok)
    }
}
