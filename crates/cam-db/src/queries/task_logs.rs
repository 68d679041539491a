//! Database query functions for the `task_logs` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::TaskLog;

pub async fn append_line(pool: &SqlitePool, task_id: Uuid, line: &str) -> Result<TaskLog> {
    sqlx::query_as::<_, TaskLog>(
        "INSERT INTO task_logs (task_id, line) VALUES (?, ?) RETURNING *",
    )
    .bind(task_id)
    .bind(line)
    .fetch_one(pool)
    .await
    .context("failed to append task log line")
}

pub async fn list_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<TaskLog>> {
    sqlx::query_as::<_, TaskLog>("SELECT * FROM task_logs WHERE task_id = ? ORDER BY id ASC")
        .bind(task_id)
        .fetch_all(pool)
        .await
        .context("failed to list task log lines")
}

pub async fn delete_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_logs WHERE task_id = ?")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete task log lines")?;
    Ok(result.rows_affected())
}
