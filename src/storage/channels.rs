use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::channels::{split_list, AutoDisableInfo, Channel, ChannelStatus, MultiKeyInfo};
use crate::error::{Error, Result};

const CHANNEL_COLUMNS: &str = r#"
    id, channel_type, name, key, status, weight, priority, base_url, models,
    channel_group, model_mapping, auto_disable, multi_key_info,
    auto_disabled_reason, auto_disabled_time, auto_disabled_model, auto_disabled_status_code,
    response_time_ms, test_time, used_quota
"#;

/// Durable source of truth for channel records.
#[derive(Clone)]
pub struct ChannelRepository {
    pool: SqlitePool,
}

impl ChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a channel and return its assigned id.
    pub async fn insert(&self, channel: &Channel) -> Result<i64> {
        debug!("Inserting channel: {}", channel.name);

        let model_mapping = serde_json::to_string(&channel.model_mapping)?;
        let multi_key_info = channel
            .multi_key
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id = sqlx::query(
            r#"
            INSERT INTO channels (
                channel_type, name, key, status, weight, priority, base_url, models,
                channel_group, model_mapping, auto_disable, multi_key_info,
                response_time_ms, used_quota, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel.channel_type)
        .bind(&channel.name)
        .bind(&channel.key)
        .bind(channel.status.as_i64())
        .bind(channel.weight)
        .bind(channel.priority)
        .bind(&channel.base_url)
        .bind(channel.models.join(","))
        .bind(channel.groups.join(","))
        .bind(&model_mapping)
        .bind(channel.auto_disable)
        .bind(&multi_key_info)
        .bind(channel.response_time_ms)
        .bind(channel.used_quota)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!("Created channel {} ({})", id, channel.name);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Channel>> {
        let sql = format!("SELECT {} FROM channels WHERE id = ?", CHANNEL_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| channel_from_row(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Channel>> {
        let sql = format!("SELECT {} FROM channels ORDER BY id", CHANNEL_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(channel_from_row).collect()
    }

    /// Move a channel from `from` to `to`. Returns false when the channel was
    /// not in `from`, which makes repeated transitions no-ops.
    pub async fn transition_status(
        &self,
        id: i64,
        from: ChannelStatus,
        to: ChannelStatus,
        disable_info: Option<&AutoDisableInfo>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE channels SET
                status = ?, auto_disabled_reason = ?, auto_disabled_time = ?,
                auto_disabled_model = ?, auto_disabled_status_code = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_i64())
        .bind(disable_info.map(|d| d.reason.clone()))
        .bind(disable_info.map(|d| d.time))
        .bind(disable_info.and_then(|d| d.model.clone()))
        .bind(disable_info.and_then(|d| d.status_code.map(i64::from)))
        .bind(id)
        .bind(from.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    /// Replace the key block and its multi-key metadata together.
    pub async fn update_keys(&self, id: i64, key: &str, info: Option<&MultiKeyInfo>) -> Result<()> {
        let multi_key_info = info.map(serde_json::to_string).transpose()?;

        let rows_affected = sqlx::query("UPDATE channels SET key = ?, multi_key_info = ? WHERE id = ?")
            .bind(key)
            .bind(&multi_key_info)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    pub async fn update_multi_key_info(&self, id: i64, info: &MultiKeyInfo) -> Result<()> {
        let json = serde_json::to_string(info)?;
        sqlx::query("UPDATE channels SET multi_key_info = ? WHERE id = ?")
            .bind(&json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_test_result(&self, id: i64, response_time_ms: i64, test_time: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE channels SET response_time_ms = ?, test_time = ? WHERE id = ?")
            .bind(response_time_ms)
            .bind(test_time.timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    let model_mapping: Option<String> = row.get("model_mapping");
    let model_mapping: HashMap<String, String> = match model_mapping.as_deref() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
        _ => HashMap::new(),
    };

    let multi_key_info: Option<String> = row.get("multi_key_info");
    let multi_key = match multi_key_info.as_deref() {
        Some(raw) if !raw.trim().is_empty() => Some(serde_json::from_str::<MultiKeyInfo>(raw)?),
        _ => None,
    };

    let auto_disabled_reason: Option<String> = row.get("auto_disabled_reason");
    let auto_disabled = auto_disabled_reason.map(|reason| AutoDisableInfo {
        reason,
        time: row.get::<Option<i64>, _>("auto_disabled_time").unwrap_or_default(),
        model: row.get("auto_disabled_model"),
        status_code: row
            .get::<Option<i64>, _>("auto_disabled_status_code")
            .and_then(|c| u16::try_from(c).ok()),
    });

    let test_time: Option<i64> = row.get("test_time");
    let models: String = row.get("models");
    let groups: String = row.get("channel_group");
    let mut groups = split_list(&groups);
    if groups.is_empty() {
        groups.push("default".to_string());
    }

    Ok(Channel {
        id: row.get("id"),
        channel_type: row.get("channel_type"),
        name: row.get("name"),
        key: row.get("key"),
        status: ChannelStatus::from_i64(row.get("status")),
        weight: row.get("weight"),
        priority: row.get("priority"),
        base_url: row.get("base_url"),
        models: split_list(&models),
        groups,
        model_mapping,
        auto_disable: row.get("auto_disable"),
        auto_disabled,
        response_time_ms: row.get("response_time_ms"),
        test_time: test_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        used_quota: row.get("used_quota"),
        multi_key,
    })
}
