//! Database query functions for the `tasks` table.
//!
//! CAS transitions follow the same discipline throughout: an `UPDATE ...
//! WHERE id = ? AND status = ?` guarded by the caller's observed status,
//! returning the updated row via `RETURNING *` when it lands. An empty
//! result means the row moved under us (lost race / stale write).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Task, TaskSource, TaskStatus};

/// Fields required to create a new task. Produced by the Pipeline Expander
/// or directly from a `POST /api/tasks` request.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub agent_definition_id: Uuid,
    pub repo_url: String,
    pub base_branch: String,
    pub work_branch: String,
    pub max_retries: i32,
    pub depends_on: Vec<Uuid>,
    pub group_id: Option<String>,
    pub source: TaskSource,
}

pub async fn insert_task(pool: &SqlitePool, new: &NewTask) -> Result<Task> {
    let id = Uuid::new_v4();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, description, agent_definition_id, repo_url, \
                             base_branch, work_branch, status, source, max_retries, depends_on, group_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'draft', ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.agent_definition_id)
    .bind(&new.repo_url)
    .bind(&new.base_branch)
    .bind(&new.work_branch)
    .bind(new.source)
    .bind(new.max_retries)
    .bind(Json(&new.depends_on))
    .bind(&new.group_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")
}

/// Filter used by `GET /api/tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub group_id: Option<String>,
    pub source: Option<TaskSource>,
}

pub async fn list_tasks(pool: &SqlitePool, filter: &TaskFilter) -> Result<Vec<Task>> {
    // Built as a small set of fixed shapes rather than dynamic SQL, so every
    // branch stays a plain compile-time-checkable query.
    let tasks = match (&filter.status, &filter.group_id, &filter.source) {
        (None, None, None) => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC")
                .fetch_all(pool)
                .await
        }
        (Some(status), None, None) => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC")
                .bind(*status)
                .fetch_all(pool)
                .await
        }
        (None, Some(group_id), None) => sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE group_id = ? ORDER BY created_at ASC",
        )
        .bind(group_id)
        .fetch_all(pool)
        .await,
        (None, None, Some(source)) => sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE source = ? ORDER BY created_at ASC",
        )
        .bind(*source)
        .fetch_all(pool)
        .await,
        (Some(status), Some(group_id), None) => sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status = ? AND group_id = ? ORDER BY created_at ASC",
        )
        .bind(*status)
        .bind(group_id)
        .fetch_all(pool)
        .await,
        (Some(status), None, Some(source)) => sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status = ? AND source = ? ORDER BY created_at ASC",
        )
        .bind(*status)
        .bind(*source)
        .fetch_all(pool)
        .await,
        (None, Some(group_id), Some(source)) => sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE group_id = ? AND source = ? ORDER BY created_at ASC",
        )
        .bind(group_id)
        .bind(*source)
        .fetch_all(pool)
        .await,
        (Some(status), Some(group_id), Some(source)) => sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status = ? AND group_id = ? AND source = ? ORDER BY created_at ASC",
        )
        .bind(*status)
        .bind(group_id)
        .bind(*source)
        .fetch_all(pool)
        .await,
    };

    tasks.context("failed to list tasks")
}

pub async fn list_tasks_for_group(pool: &SqlitePool, group_id: &str) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE group_id = ? ORDER BY created_at ASC")
        .bind(group_id)
        .fetch_all(pool)
        .await
        .context("failed to list tasks for group")
}

/// **publish**: `draft -> queued`.
pub async fn publish_task(pool: &SqlitePool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'queued', queued_at = ? WHERE id = ? AND status = 'draft' RETURNING *",
    )
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to publish task")
}

/// **demote**: `queued -> waiting`.
pub async fn demote_task(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = 'waiting' WHERE id = ? AND status = 'queued'")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to demote task")?;
    Ok(result.rows_affected())
}

/// **promote**: `waiting -> queued`.
pub async fn promote_task(pool: &SqlitePool, id: Uuid, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'queued', queued_at = COALESCE(queued_at, ?) WHERE id = ? AND status = 'waiting'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to promote task")?;
    Ok(result.rows_affected())
}

/// **claim**: `(queued|waiting) -> running`, guarded by `source = scheduler`.
pub async fn claim_task(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'running', assigned_worker_id = ?, started_at = ? \
         WHERE id = ? AND status = ? AND source = 'scheduler' \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .bind(from)
    .fetch_optional(pool)
    .await
    .context("failed to claim task")
}

/// Roll a claimed task back to `queued` (used when the worker-bind CAS loses the race).
pub async fn rollback_claim(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'queued', assigned_worker_id = NULL, started_at = NULL \
         WHERE id = ? AND status = 'running'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to roll back task claim")?;
    Ok(result.rows_affected())
}

/// **finish-success**: `running -> completed|awaiting_review`.
pub async fn finish_success(
    pool: &SqlitePool,
    id: Uuid,
    to: TaskStatus,
    summary: Option<&str>,
    pr_url: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = ?, completed_at = ?, summary = COALESCE(?, summary), \
                           pr_url = COALESCE(?, pr_url) \
         WHERE id = ? AND status = 'running' \
         RETURNING *",
    )
    .bind(to)
    .bind(now)
    .bind(summary)
    .bind(pr_url)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to finish task (success)")
}

/// **finish-fail**: `running -> failed`.
pub async fn finish_fail(pool: &SqlitePool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'failed', completed_at = ? WHERE id = ? AND status = 'running' RETURNING *",
    )
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to finish task (failure)")
}

/// **cancel**: any non-terminal status -> `cancelled`. `from` is the status
/// the caller observed; pass it explicitly since cancel is legal from any
/// non-terminal state.
pub async fn cancel_task(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = ? RETURNING *",
    )
    .bind(now)
    .bind(id)
    .bind(from)
    .fetch_optional(pool)
    .await
    .context("failed to cancel task")
}

/// **review-approve**: `awaiting_review -> completed`.
pub async fn review_approve(pool: &SqlitePool, id: Uuid, now: DateTime<Utc>) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'completed', completed_at = ?, reviewed_at = ? \
         WHERE id = ? AND status = 'awaiting_review' \
         RETURNING *",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to approve task review")
}

/// **review-reject** (retry path): `awaiting_review -> queued`, bumping `retryCount`
/// and clearing transient fields.
pub async fn review_reject_retry(
    pool: &SqlitePool,
    id: Uuid,
    feedback: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'queued', retry_count = retry_count + 1, feedback = ?, \
                           summary = NULL, log_file_url = NULL, review_comment = NULL, \
                           assigned_worker_id = NULL, queued_at = ?, reviewed_at = ? \
         WHERE id = ? AND status = 'awaiting_review' \
         RETURNING *",
    )
    .bind(feedback)
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to reject task review (retry)")
}

/// **review-reject** (exhausted path): `awaiting_review -> failed`.
pub async fn review_reject_final(
    pool: &SqlitePool,
    id: Uuid,
    feedback: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'failed', feedback = ?, completed_at = ?, reviewed_at = ? \
         WHERE id = ? AND status = 'awaiting_review' \
         RETURNING *",
    )
    .bind(feedback)
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to reject task review (final)")
}

/// **rerun**: any terminal status -> `queued`, bumping `retryCount` and
/// `maxRetries := max(maxRetries, retryCount)`.
pub async fn rerun_task(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    feedback: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'queued', retry_count = retry_count + 1, \
                           max_retries = MAX(max_retries, retry_count + 1), \
                           feedback = COALESCE(?, feedback), \
                           summary = NULL, log_file_url = NULL, review_comment = NULL, \
                           assigned_worker_id = NULL, pr_url = NULL, \
                           queued_at = ?, started_at = NULL, completed_at = NULL \
         WHERE id = ? AND status = ? \
         RETURNING *",
    )
    .bind(feedback)
    .bind(now)
    .bind(id)
    .bind(from)
    .fetch_optional(pool)
    .await
    .context("failed to rerun task")
}

/// Sets a task to `waiting`, optionally bumping `retryCount` when the task
/// was terminal or `awaiting_review` (used by **restart-from**, SPEC_FULL §4.1).
pub async fn restart_to_waiting(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    bump_retry: bool,
) -> Result<u64> {
    let result = if bump_retry {
        sqlx::query(
            "UPDATE tasks SET status = 'waiting', retry_count = retry_count + 1, \
                               max_retries = MAX(max_retries, retry_count + 1), \
                               assigned_worker_id = NULL, started_at = NULL, completed_at = NULL \
             WHERE id = ? AND status = ?",
        )
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
    } else {
        sqlx::query(
            "UPDATE tasks SET status = 'waiting', assigned_worker_id = NULL, started_at = NULL, completed_at = NULL \
             WHERE id = ? AND status = ?",
        )
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
    };
    Ok(result.context("failed to restart task to waiting")?.rows_affected())
}

/// Sets the restart-from root to `queued` (its upstream deps are all satisfied).
pub async fn restart_to_queued(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    bump_retry: bool,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = if bump_retry {
        sqlx::query(
            "UPDATE tasks SET status = 'queued', retry_count = retry_count + 1, \
                               max_retries = MAX(max_retries, retry_count + 1), \
                               assigned_worker_id = NULL, started_at = NULL, completed_at = NULL, queued_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(now)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
    } else {
        sqlx::query(
            "UPDATE tasks SET status = 'queued', assigned_worker_id = NULL, started_at = NULL, completed_at = NULL, queued_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(now)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
    };
    Ok(result.context("failed to restart task to queued")?.rows_affected())
}

/// Internal failure used by the Dispatcher when a candidate's dependencies
/// are blocked (missing, `failed`, or `cancelled`).
pub async fn dependency_blocked(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    summary: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "UPDATE tasks SET status = 'failed', summary = ?, completed_at = ? WHERE id = ? AND status = ? RETURNING *",
    )
    .bind(summary)
    .bind(now)
    .bind(id)
    .bind(from)
    .fetch_optional(pool)
    .await
    .context("failed to mark task dependency-blocked")
}

/// Statuses of every task id in `ids`, for dependency-readiness classification.
pub async fn get_statuses(pool: &SqlitePool, ids: &[Uuid]) -> Result<Vec<(Uuid, TaskStatus)>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(",");
    let sql = format!("SELECT id, status FROM tasks WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, (Uuid, TaskStatus)>(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    query.fetch_all(pool).await.context("failed to fetch task statuses")
}

/// Dispatcher candidate window: `source=scheduler`, status in {queued, waiting},
/// optionally filtered to the worker's supported agents, ordered per SPEC_FULL
/// §4.2 step 3 (queued before waiting, then `queuedAt`, then `createdAt`), capped at 20.
pub async fn list_dispatch_candidates(
    pool: &SqlitePool,
    supported_agent_ids: Option<&[Uuid]>,
) -> Result<Vec<Task>> {
    let order_clause = "ORDER BY (status != 'queued'), queued_at ASC, created_at ASC LIMIT 20";

    let tasks = match supported_agent_ids {
        None | Some([]) => {
            let sql = format!(
                "SELECT * FROM tasks WHERE source = 'scheduler' AND status IN ('queued','waiting') {order_clause}"
            );
            sqlx::query_as::<_, Task>(&sql).fetch_all(pool).await
        }
        Some(agent_ids) => {
            let placeholders = std::iter::repeat("?").take(agent_ids.len()).collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT * FROM tasks WHERE source = 'scheduler' AND status IN ('queued','waiting') \
                 AND agent_definition_id IN ({placeholders}) {order_clause}"
            );
            let mut query = sqlx::query_as::<_, Task>(&sql);
            for id in agent_ids {
                query = query.bind(*id);
            }
            query.fetch_all(pool).await
        }
    };

    tasks.context("failed to list dispatch candidates")
}

/// Tasks whose `dependsOn` contains `task_id` (the dependents graph).
pub async fn get_dependents(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE EXISTS ( \
            SELECT 1 FROM json_each(tasks.depends_on) WHERE json_each.value = ? \
         )",
    )
    .bind(task_id.to_string())
    .fetch_all(pool)
    .await
    .context("failed to fetch dependents")
}

/// Count of dependents that are not in a terminal status (used by the
/// `DELETE /api/tasks/:id` 409 guard).
pub async fn count_live_dependents(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE status NOT IN ('completed','failed','cancelled') \
         AND EXISTS (SELECT 1 FROM json_each(tasks.depends_on) WHERE json_each.value = ?)",
    )
    .bind(task_id.to_string())
    .fetch_one(pool)
    .await
    .context("failed to count live dependents")?;
    Ok(count)
}

/// Strip `task_id` from every other task's `dependsOn` array.
pub async fn strip_dependency_references(pool: &SqlitePool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET depends_on = ( \
            SELECT json_group_array(value) FROM json_each(tasks.depends_on) WHERE value != ? \
         ) \
         WHERE EXISTS (SELECT 1 FROM json_each(tasks.depends_on) WHERE value = ?)",
    )
    .bind(task_id.to_string())
    .bind(task_id.to_string())
    .execute(pool)
    .await
    .context("failed to strip dependency references")?;
    Ok(result.rows_affected())
}

pub async fn delete_task_row(pool: &SqlitePool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete task")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_filter_default_has_no_constraints() {
        let filter = TaskFilter::default();
        assert!(filter.status.is_none());
        assert!(filter.group_id.is_none());
        assert!(filter.source.is_none());
    }
}
