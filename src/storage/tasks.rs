use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tasks::{CallbackStatus, Task, TaskCore, TaskRecord, TaskStatus};

const TASK_COLUMNS: &str = r#"
    id, kind, task_id, user_id, channel_id, model, provider, request_type, prompt, params,
    quota, status, fail_reason, result, callback_url, callback_status, callback_error,
    callback_time, created_at, updated_at
"#;

/// Persistence for ledger tasks of every kind.
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a task and return its internal id.
    pub async fn insert(&self, task: &Task) -> Result<i64> {
        let core = task.core();
        let result = core.result.as_ref().map(serde_json::to_string).transpose()?;

        let id = sqlx::query(
            r#"
            INSERT INTO tasks (
                kind, task_id, user_id, channel_id, model, provider, request_type, prompt, params,
                quota, status, fail_reason, result, callback_url, callback_status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.kind().as_str())
        .bind(&core.task_id)
        .bind(core.user_id)
        .bind(core.channel_id)
        .bind(&core.model)
        .bind(&core.provider)
        .bind(&core.request_type)
        .bind(&core.prompt)
        .bind(task.params_json()?)
        .bind(core.quota)
        .bind(core.status.as_str())
        .bind(&core.fail_reason)
        .bind(&result)
        .bind(&core.callback_url)
        .bind(core.callback_status.as_str())
        .bind(core.created_at)
        .bind(core.updated_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!("Inserted {} task {}", task.kind().as_str(), id);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn find_by_task_id(&self, task_id: &str) -> Result<Option<Task>> {
        if task_id.is_empty() {
            return Ok(None);
        }
        let sql = format!("SELECT {} FROM tasks WHERE task_id = ? ORDER BY id DESC LIMIT 1", TASK_COLUMNS);
        let row = sqlx::query(&sql).bind(task_id).fetch_optional(&self.pool).await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    /// Writes the mutable fields of `task` only if its stored status is still
    /// `expected`. Returns false when another writer got there first.
    pub async fn compare_and_update(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        write_if_status(&self.pool, task, expected).await
    }

    /// Settles a successful task and charges it in one transaction: the
    /// status write, the user debit and the channel's used quota land
    /// together or not at all. Returns false when another writer settled first.
    pub async fn commit_success(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let core = task.core();
        let mut tx = self.pool.begin().await?;

        if !write_if_status(&mut *tx, task, expected).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        if core.quota > 0 {
            let debited = sqlx::query(
                "UPDATE users SET quota = quota - ?, used_quota = used_quota + ?, request_count = request_count + 1 WHERE id = ?",
            )
            .bind(core.quota)
            .bind(core.quota)
            .bind(core.user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if debited == 0 {
                return Err(Error::Database(sqlx::Error::RowNotFound));
            }

            sqlx::query("UPDATE channels SET used_quota = used_quota + ? WHERE id = ?")
                .bind(core.quota)
                .bind(core.channel_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Records that the provider was asked about this task.
    pub async fn mark_polled(&self, id: i64, polled_at: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET last_polled_at = ? WHERE id = ?")
            .bind(polled_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_callback(
        &self,
        id: i64,
        status: CallbackStatus,
        error: Option<&str>,
        time: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE tasks SET callback_status = ?, callback_error = ?, callback_time = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Non-terminal tasks with a provider id that have not moved since
    /// `updated_before`, least recently polled first.
    pub async fn list_stale_in_flight(&self, updated_before: i64, limit: i64) -> Result<Vec<Task>> {
        let sql = format!(
            r#"
            SELECT {} FROM tasks
            WHERE status IN ('submitted', 'processing') AND task_id != '' AND updated_at <= ?
            ORDER BY last_polled_at ASC, updated_at ASC, id ASC
            LIMIT ?
            "#,
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}

async fn write_if_status<'e, E>(executor: E, task: &Task, expected: TaskStatus) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let core = task.core();
    let result = core.result.as_ref().map(serde_json::to_string).transpose()?;

    let rows_affected = sqlx::query(
        r#"
        UPDATE tasks SET
            task_id = ?, status = ?, fail_reason = ?, result = ?, quota = ?, params = ?, updated_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(&core.task_id)
    .bind(core.status.as_str())
    .bind(&core.fail_reason)
    .bind(&result)
    .bind(core.quota)
    .bind(task.params_json()?)
    .bind(core.updated_at)
    .bind(core.id)
    .bind(expected.as_str())
    .execute(executor)
    .await?
    .rows_affected();

    Ok(rows_affected == 1)
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    let status = TaskStatus::parse(&status).ok_or_else(|| {
        sqlx::Error::Decode(format!("Unknown task status: {}", status).into())
    })?;

    let result: Option<String> = row.get("result");
    let result = result
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()?;

    let callback_status: String = row.get("callback_status");

    let core = TaskCore {
        id: row.get("id"),
        task_id: row.get("task_id"),
        user_id: row.get("user_id"),
        channel_id: row.get("channel_id"),
        model: row.get("model"),
        provider: row.get("provider"),
        request_type: row.get("request_type"),
        prompt: row.get("prompt"),
        quota: row.get("quota"),
        status,
        fail_reason: row.get("fail_reason"),
        result,
        callback_url: row.get("callback_url"),
        callback_status: CallbackStatus::parse(&callback_status),
        callback_error: row.get("callback_error"),
        callback_time: row.get("callback_time"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };

    let kind: String = row.get("kind");
    let params: String = row.get("params");
    Task::from_parts(&kind, core, &params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::tests::core;
    use crate::tasks::{VideoParams, VideoTask};
    use crate::testing::create_test_database;

    fn video(status: TaskStatus) -> Task {
        Task::Video(VideoTask {
            core: core(status),
            params: VideoParams {
                mode: "std".to_string(),
                duration: 10,
                ..Default::default()
            },
        })
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let (db, _temp_dir) = create_test_database().await;
        let repo = TaskRepository::new(db.get_pool());

        let id = repo.insert(&video(TaskStatus::Pending)).await.unwrap();
        let mut task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(repo.find_by_task_id("").await.unwrap().is_none());

        task.core_mut().task_id = "kt-42".to_string();
        task.set_status(TaskStatus::Submitted);
        assert!(repo.compare_and_update(&task, TaskStatus::Pending).await.unwrap());

        let found = repo.find_by_task_id("kt-42").await.unwrap().unwrap();
        assert_eq!(found.id(), id);
        assert_eq!(found.status(), TaskStatus::Submitted);
        match found {
            Task::Video(v) => assert_eq!(v.params.duration, 10),
            Task::Image(_) => panic!("expected a video task"),
        }
    }

    #[tokio::test]
    async fn test_compare_and_update_rejects_stale_writer() {
        let (db, _temp_dir) = create_test_database().await;
        let repo = TaskRepository::new(db.get_pool());
        let id = repo.insert(&video(TaskStatus::Submitted)).await.unwrap();

        let mut first = repo.get(id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.mark_success(1_000);
        assert!(repo.compare_and_update(&first, TaskStatus::Submitted).await.unwrap());

        second.mark_failed("late");
        assert!(!repo.compare_and_update(&second, TaskStatus::Submitted).await.unwrap());

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Succeed);
        assert_eq!(stored.core().quota, 1_000);
    }

    #[tokio::test]
    async fn test_callback_and_stale_listing() {
        let (db, _temp_dir) = create_test_database().await;
        let repo = TaskRepository::new(db.get_pool());

        let mut submitted = video(TaskStatus::Submitted);
        submitted.core_mut().task_id = "kt-1".to_string();
        let id = repo.insert(&submitted).await.unwrap();
        repo.insert(&video(TaskStatus::Pending)).await.unwrap();

        let stale = repo.list_stale_in_flight(10, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), id);

        repo.update_callback(id, CallbackStatus::Failed, Some("invalid URL"), 99)
            .await
            .unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.core().callback_status, CallbackStatus::Failed);
        assert_eq!(stored.core().callback_error.as_deref(), Some("invalid URL"));
        assert_eq!(stored.core().callback_time, Some(99));
    }
}
