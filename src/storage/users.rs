use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const ROLE_COMMON: i64 = 1;
pub const ROLE_ADMIN: i64 = 10;

/// Caller identity resolved from an access token.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub group: String,
    pub is_admin: bool,
}

/// Resolves bearer tokens to identities.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve_token(&self, token: &str) -> Result<Option<Identity>>;
}

/// User balance operations consumed by billing.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(&self, user_id: i64) -> Result<i64>;
    async fn increase_quota(&self, user_id: i64, quota: i64) -> Result<()>;
    async fn decrease_quota(&self, user_id: i64, quota: i64) -> Result<()>;
}

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_user(
        &self,
        username: &str,
        access_token: &str,
        group: &str,
        role: i64,
        quota: i64,
    ) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO users (username, access_token, user_group, role, quota, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(username)
        .bind(access_token)
        .bind(group)
        .bind(role)
        .bind(quota)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!("Created user {} ({})", id, username);
        Ok(id)
    }

    pub async fn get_used_quota(&self, user_id: i64) -> Result<i64> {
        let used: Option<i64> = sqlx::query_scalar("SELECT used_quota FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        used.ok_or_else(|| Error::validation(format!("User {} does not exist", user_id)))
    }
}

#[async_trait]
impl UserDirectory for UserRepository {
    async fn resolve_token(&self, token: &str) -> Result<Option<Identity>> {
        let row = sqlx::query("SELECT id, username, user_group, role FROM users WHERE access_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let role: i64 = row.get("role");
            Identity {
                user_id: row.get("id"),
                username: row.get("username"),
                group: row.get("user_group"),
                is_admin: role >= ROLE_ADMIN,
            }
        }))
    }
}

#[async_trait]
impl QuotaStore for UserRepository {
    async fn get_quota(&self, user_id: i64) -> Result<i64> {
        let quota: Option<i64> = sqlx::query_scalar("SELECT quota FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        quota.ok_or_else(|| Error::validation(format!("User {} does not exist", user_id)))
    }

    async fn increase_quota(&self, user_id: i64, quota: i64) -> Result<()> {
        if quota < 0 {
            return Err(Error::validation("Quota increase must not be negative"));
        }
        sqlx::query("UPDATE users SET quota = quota + ? WHERE id = ?")
            .bind(quota)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        debug!("Increased quota of user {} by {}", user_id, quota);
        Ok(())
    }

    async fn decrease_quota(&self, user_id: i64, quota: i64) -> Result<()> {
        if quota < 0 {
            return Err(Error::validation("Quota decrease must not be negative"));
        }
        let rows_affected = sqlx::query(
            "UPDATE users SET quota = quota - ?, used_quota = used_quota + ?, request_count = request_count + 1 WHERE id = ?",
        )
        .bind(quota)
        .bind(quota)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            warn!("Quota decrease for missing user {}", user_id);
            return Err(Error::Database(sqlx::Error::RowNotFound));
        }
        debug!("Decreased quota of user {} by {}", user_id, quota);
        Ok(())
    }
}
