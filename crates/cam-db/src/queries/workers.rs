//! Database query functions for the `workers` table (SPEC_FULL.md §4.4).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Worker, WorkerMode, WorkerStatus};

/// Fields supplied by `POST /api/workers/register`.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub id: String,
    pub name: String,
    pub supported_agent_ids: Vec<Uuid>,
    pub max_concurrent: i32,
    pub mode: WorkerMode,
    pub reported_env_vars: Vec<String>,
}

/// Register a worker. A worker re-registering with the same id refreshes its
/// advertised capabilities and heartbeat without losing its counters.
pub async fn upsert_worker(pool: &SqlitePool, new: &NewWorker, now: DateTime<Utc>) -> Result<Worker> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, name, supported_agent_ids, max_concurrent, mode, status, last_heartbeat_at, reported_env_vars, uptime_since) \
         VALUES (?, ?, ?, ?, ?, 'idle', ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
            name = excluded.name, \
            supported_agent_ids = excluded.supported_agent_ids, \
            max_concurrent = excluded.max_concurrent, \
            mode = excluded.mode, \
            last_heartbeat_at = excluded.last_heartbeat_at, \
            reported_env_vars = excluded.reported_env_vars \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.name)
    .bind(Json(&new.supported_agent_ids))
    .bind(new.max_concurrent)
    .bind(new.mode)
    .bind(now)
    .bind(Json(&new.reported_env_vars))
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert worker")?;

    Ok(worker)
}

pub async fn get_worker(pool: &SqlitePool, id: &str) -> Result<Option<Worker>> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")
}

pub async fn list_workers(pool: &SqlitePool) -> Result<Vec<Worker>> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY id ASC")
        .fetch_all(pool)
        .await
        .context("failed to list workers")
}

/// Heartbeat refresh, unconditional (no CAS: the timestamp always wins).
pub async fn heartbeat(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("UPDATE workers SET last_heartbeat_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to record worker heartbeat")?;
    Ok(result.rows_affected())
}

/// Binds a worker to a task: `idle -> busy`. The dispatcher loses the claim
/// if this returns 0 (another claim already bound the worker).
pub async fn bind_task(pool: &SqlitePool, worker_id: &str, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET status = 'busy', current_task_id = ? WHERE id = ? AND status = 'idle'",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to bind worker to task")?;
    Ok(result.rows_affected())
}

/// Releases a worker after a task finishes (or a lost dispatcher race needs
/// to roll the bind back): `busy -> idle|draining|offline` depending on the
/// status the worker held before the bind, plus counters.
pub async fn release_task(
    pool: &SqlitePool,
    worker_id: &str,
    to: WorkerStatus,
    task_succeeded: Option<bool>,
) -> Result<u64> {
    let result = match task_succeeded {
        Some(true) => {
            sqlx::query(
                "UPDATE workers SET status = ?, current_task_id = NULL, total_tasks_completed = total_tasks_completed + 1 \
                 WHERE id = ? AND status = 'busy'",
            )
            .bind(to)
            .bind(worker_id)
            .execute(pool)
            .await
        }
        Some(false) => {
            sqlx::query(
                "UPDATE workers SET status = ?, current_task_id = NULL, total_tasks_failed = total_tasks_failed + 1 \
                 WHERE id = ? AND status = 'busy'",
            )
            .bind(to)
            .bind(worker_id)
            .execute(pool)
            .await
        }
        None => {
            sqlx::query(
                "UPDATE workers SET status = ?, current_task_id = NULL WHERE id = ? AND status = 'busy'",
            )
            .bind(to)
            .bind(worker_id)
            .execute(pool)
            .await
        }
    };
    Ok(result.context("failed to release worker from task")?.rows_affected())
}

/// `PATCH /api/workers/:id` status transitions: drain, go offline, or reactivate.
pub async fn set_status(pool: &SqlitePool, id: &str, from: WorkerStatus, to: WorkerStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE workers SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to change worker status")?;
    Ok(result.rows_affected())
}

/// Workers whose heartbeat is older than `threshold_ms` and are not already
/// `offline`, for the Recovery Loop (SPEC_FULL.md §4.6).
pub async fn list_stale_workers(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    threshold_ms: i64,
) -> Result<Vec<Worker>> {
    let cutoff = now - chrono::Duration::milliseconds(threshold_ms);
    sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers WHERE last_heartbeat_at < ? AND status != 'offline'",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale workers")
}

pub async fn mark_offline(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE workers SET status = 'offline', current_task_id = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark worker offline")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_worker_fields_are_plain_data() {
        let w = NewWorker {
            id: "worker-1".into(),
            name: "laptop".into(),
            supported_agent_ids: vec![Uuid::nil()],
            max_concurrent: 1,
            mode: WorkerMode::Daemon,
            reported_env_vars: vec!["GITHUB_TOKEN".into()],
        };
        assert_eq!(w.id, "worker-1");
        assert_eq!(w.supported_agent_ids.len(), 1);
    }
}
